use anyhow::{Context, Result};
use facecheck_core::Pipeline;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod summarizer;

const BUS_NAME: &str = "org.facecheck.Analyzer1";
const OBJECT_PATH: &str = "/org/facecheck/Analyzer1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facecheckd starting");

    let config = config::Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        llm_endpoint = %config.llm.endpoint,
        llm_model = %config.llm.model,
        "configuration loaded"
    );

    let paths = config.model_paths();
    for missing in paths.missing() {
        tracing::error!(path = %missing.display(), "model file not found");
    }

    // Fail fast: the daemon is useless without every model.
    let pipeline = Pipeline::load(&paths)
        .context("failed to load models")?
        .with_classifier_timeout(config.classifier_timeout);

    if config.llm.api_key.is_none() {
        tracing::warn!("FACECHECK_LLM_API_KEY not set; summarizer requests are unauthenticated");
    }
    let summarizer = Arc::new(summarizer::OpenAiSummarizer::from_config(&config.llm));

    let service = dbus_interface::AnalyzerService {
        engine: engine::Engine::new(pipeline, summarizer),
    };

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facecheckd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facecheckd shutting down");

    Ok(())
}
