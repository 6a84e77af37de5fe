//! facecheck-core — Face detection and attribute classification engine.
//!
//! Uses a YOLO face detector and five MobileNet attribute classifiers, all
//! running via ONNX Runtime for CPU inference, plus the text report and
//! summary parsing that sit around the language-model call.

pub mod classifier;
pub mod detector;
pub mod pipeline;
pub mod report;
pub mod summary;
pub mod types;

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use classifier::{AttributeClassifier, ClassifierError, OnnxClassifier};
pub use detector::{DetectorError, FaceDetect, YoloFaceDetector};
pub use pipeline::{ModelPaths, Pipeline, PipelineError};
pub use report::format_report;
pub use summary::{DiagramFields, SummaryParseResult};
pub use types::{
    AnalysisReport, ClassificationOutcome, ClassifierKind, ClassifierSpec, DetectedFace, FaceBox,
    FaceReport, LabelProbability, Prediction,
};

/// Default directory for ONNX weights: `$XDG_DATA_HOME/facecheck/models`,
/// falling back to `~/.local/share/facecheck/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecheck")
        .join("models")
}

/// Lock an inference session, recovering it if a previous run panicked while
/// holding the lock. A session carries no state a half-finished run can corrupt.
pub(crate) fn lock_session<T>(session: &Mutex<T>) -> MutexGuard<'_, T> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}
