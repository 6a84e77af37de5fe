use crate::engine::{Engine, EngineError};
use std::path::Path;
use zbus::interface;

/// D-Bus interface for the facecheck analysis daemon.
///
/// Bus name: org.facecheck.Analyzer1
/// Object path: /org/facecheck/Analyzer1
pub struct AnalyzerService {
    pub engine: Engine,
}

#[interface(name = "org.facecheck.Analyzer1")]
impl AnalyzerService {
    /// Analyze the image at an absolute path. Returns the full result as JSON.
    async fn analyze(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "analyze requested");

        let path = Path::new(image_path);
        if !path.is_absolute() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "image path must be absolute".into(),
            ));
        }

        let result = self.engine.analyze(path).await.map_err(|e| {
            tracing::warn!(error = %e, "analysis failed");
            match e {
                EngineError::NoFaceDetected => zbus::fdo::Error::Failed(e.to_string()),
                EngineError::Pipeline(facecheck_core::PipelineError::Decode(_)) => {
                    zbus::fdo::Error::InvalidArgs(e.to_string())
                }
                _ => zbus::fdo::Error::Failed(e.to_string()),
            }
        })?;

        serde_json::to_string(&result)
            .map_err(|e| zbus::fdo::Error::Failed(format!("failed to encode result: {e}")))
    }

    /// Parse a summarizer response without running the pipeline.
    async fn parse_response(&self, text: &str) -> zbus::fdo::Result<String> {
        let summary = self.engine.pipeline().parse_llm_response(text);
        Ok(serde_json::json!({
            "narrative_text": summary.narrative_text,
            "fields": summary.fields,
            "diagram": summary.diagram(),
        })
        .to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let classifiers: Vec<_> = self
            .engine
            .pipeline()
            .classifier_specs()
            .map(|spec| spec.name)
            .collect();

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "models_loaded": true,
            "classifiers": classifiers,
        })
        .to_string())
    }
}
