use crate::summarizer::Summarizer;
use chrono::{DateTime, Utc};
use facecheck_core::{AnalysisReport, DiagramFields, Pipeline, PipelineError, SummaryParseResult};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("summarizer error: {0}")]
    Summarizer(String),
    #[error("engine task failed: {0}")]
    Task(String),
}

/// Everything produced for one analyzed image.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub analysis_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
    pub faces: AnalysisReport,
    /// Text sent to the summarizer.
    pub report_text: String,
    pub summary: SummaryParseResult,
    pub diagram: DiagramFields,
}

/// Clone-safe handle over the loaded pipeline and the summarizer.
#[derive(Clone)]
pub struct Engine {
    pipeline: Arc<Pipeline>,
    summarizer: Arc<dyn Summarizer>,
}

impl Engine {
    pub fn new(pipeline: Pipeline, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            summarizer,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Analyze the image at `path`: detect and classify faces, summarize the
    /// rendered report, then split the summary into narrative and fields.
    pub async fn analyze(&self, path: &Path) -> Result<AnalysisResult, EngineError> {
        let analysis_id = Uuid::new_v4();
        let span = tracing::info_span!("analysis", id = %analysis_id);
        self.analyze_inner(analysis_id, path).instrument(span).await
    }

    async fn analyze_inner(
        &self,
        analysis_id: Uuid,
        path: &Path,
    ) -> Result<AnalysisResult, EngineError> {
        let started = Instant::now();

        let faces = self
            .pipeline
            .process_image(path)
            .await?
            .ok_or(EngineError::NoFaceDetected)?;

        let report_text = self.pipeline.print_results(Some(&faces));

        let summarizer = Arc::clone(&self.summarizer);
        let text = report_text.clone();
        let raw = tokio::task::spawn_blocking(move || summarizer.summarize(&text))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
            .map_err(|e| {
                tracing::warn!(error = %e, "summarizer failed");
                EngineError::Summarizer(e.to_string())
            })?;

        let summary = self.pipeline.parse_llm_response(&raw);
        let diagram = summary.diagram();

        tracing::info!(
            faces = faces.len(),
            fields = summary.fields.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis complete"
        );

        Ok(AnalysisResult {
            analysis_id,
            analyzed_at: Utc::now(),
            faces,
            report_text,
            summary,
            diagram,
        })
    }
}
