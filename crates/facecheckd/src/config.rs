use facecheck_core::ModelPaths;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Per-classifier timeout; `None` waits indefinitely.
    pub classifier_timeout: Option<Duration>,
    pub llm: LlmConfig,
}

/// Summarizer endpoint settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    /// HTTP timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Language the summary is requested in.
    pub language: String,
}

impl Config {
    /// Load configuration from `FACECHECK_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = lookup("FACECHECK_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(facecheck_core::default_model_dir);

        Self {
            model_dir,
            classifier_timeout: parse_u64(&lookup, "FACECHECK_CLASSIFIER_TIMEOUT_MS")
                .map(Duration::from_millis),
            llm: LlmConfig {
                endpoint: lookup("FACECHECK_LLM_ENDPOINT")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                model: lookup("FACECHECK_LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                api_key: lookup("FACECHECK_LLM_API_KEY").filter(|k| !k.is_empty()),
                timeout: parse_u64(&lookup, "FACECHECK_LLM_TIMEOUT_SECS").map(Duration::from_secs),
                language: lookup("FACECHECK_LLM_LANGUAGE").unwrap_or_else(|| "Russian".to_string()),
            },
        }
    }

    /// Paths of the detector and classifier weights.
    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }
}

/// Unset, unparsable and zero values all mean "not configured".
fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .filter(|&v| v > 0)
}
