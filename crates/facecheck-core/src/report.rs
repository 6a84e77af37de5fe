//! Plain-text rendering of an [`AnalysisReport`] for the summarizer.

use crate::types::{AnalysisReport, ClassificationOutcome, FaceReport};
use std::fmt::Write;

/// Text returned when there is no report to render.
pub const NO_RESULTS_TEXT: &str = "No data to analyze";

const TOP_PREDICTIONS: usize = 3;
const SEPARATOR_WIDTH: usize = 50;

/// Render every face of `report`. Deterministic: the same report always
/// renders to the same bytes.
pub fn format_report(report: &AnalysisReport) -> String {
    let mut out = String::new();
    for face in report.faces() {
        write_face(&mut out, face);
    }
    out
}

fn write_face(out: &mut String, face: &FaceReport) {
    let _ = writeln!(out, "FACE {}", face.face_id);
    let _ = writeln!(out, "BBox: {}", face.bbox);
    let _ = writeln!(out, "Detection confidence: {:.3}", face.detection_confidence);
    out.push('\n');

    for outcome in &face.outcomes {
        match outcome {
            ClassificationOutcome::Failure {
                model_name,
                error_message,
            } => {
                let _ = writeln!(out, "[error] {model_name}: {error_message}");
            }
            ClassificationOutcome::Success(prediction) => {
                let _ = writeln!(out, "[ok] {}:", prediction.model_name);
                let _ = writeln!(out, "   Class: {}", prediction.predicted_label);
                let _ = writeln!(out, "   Confidence: {:.3}", prediction.confidence);
                out.push_str("   Top predictions:\n");
                for (index, entry) in prediction.top_labels(TOP_PREDICTIONS) {
                    let marker = if index == prediction.predicted_index { "*" } else { " " };
                    let _ = writeln!(
                        out,
                        "      {marker} {}: {:.3}",
                        entry.label, entry.probability
                    );
                }
                out.push('\n');
            }
        }
    }

    out.push_str(&"-".repeat(SEPARATOR_WIDTH));
    out.push_str("\n\n");
}
