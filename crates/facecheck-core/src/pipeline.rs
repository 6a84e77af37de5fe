//! Classification orchestrator and pipeline facade.
//!
//! [`Pipeline`] owns the detector and the five classifiers. Faces are handled
//! one at a time; within a face every classifier runs as its own blocking
//! task and the results are joined back in pipeline order.

use crate::classifier::{self, AttributeClassifier, ClassifierError, OnnxClassifier};
use crate::detector::{DetectorError, FaceDetect, YoloFaceDetector};
use crate::report;
use crate::summary::{self, SummaryParseResult};
use crate::types::{
    AnalysisReport, ClassificationOutcome, ClassifierKind, ClassifierSpec, DetectedFace, FaceReport,
};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;

/// File name of the face detector weights inside the model directory.
pub const DETECTOR_WEIGHT_FILE: &str = "model.onnx";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("pipeline task failed: {0}")]
    Task(String),
}

/// Locations of every weight file the pipeline loads.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    /// In pipeline order.
    pub classifiers: Vec<(ClassifierKind, PathBuf)>,
}

impl ModelPaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_WEIGHT_FILE),
            classifiers: ClassifierKind::PIPELINE_ORDER
                .iter()
                .map(|&kind| (kind, dir.join(kind.spec().weight_file)))
                .collect(),
        }
    }

    /// Weight files that do not exist on disk.
    pub fn missing(&self) -> Vec<&Path> {
        std::iter::once(self.detector.as_path())
            .chain(self.classifiers.iter().map(|(_, path)| path.as_path()))
            .filter(|path| !path.exists())
            .collect()
    }
}

/// Face analysis pipeline: detection, per-face classification, reporting.
pub struct Pipeline {
    detector: Arc<dyn FaceDetect>,
    classifiers: Vec<Arc<dyn AttributeClassifier>>,
    classifier_timeout: Option<Duration>,
}

impl Pipeline {
    /// Assemble a pipeline from already-loaded components. Classifier order
    /// is the outcome order of every face report.
    pub fn new(
        detector: Arc<dyn FaceDetect>,
        classifiers: Vec<Arc<dyn AttributeClassifier>>,
    ) -> Self {
        Self {
            detector,
            classifiers,
            classifier_timeout: None,
        }
    }

    /// Load the detector and all classifiers. Any missing or unreadable
    /// weight file fails the whole load.
    pub fn load(paths: &ModelPaths) -> Result<Self, PipelineError> {
        let started = Instant::now();

        let detector = YoloFaceDetector::load(&paths.detector)?;

        let mut classifiers: Vec<Arc<dyn AttributeClassifier>> =
            Vec::with_capacity(paths.classifiers.len());
        for (kind, path) in &paths.classifiers {
            classifiers.push(Arc::new(OnnxClassifier::load(*kind.spec(), path)?));
        }

        tracing::info!(
            classifiers = classifiers.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "all models loaded"
        );

        Ok(Self::new(Arc::new(detector), classifiers))
    }

    /// Give up on a classifier that has not finished within `timeout` of the
    /// face's fan-out. `None` waits indefinitely.
    pub fn with_classifier_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.classifier_timeout = timeout;
        self
    }

    pub fn classifier_specs(&self) -> impl Iterator<Item = &ClassifierSpec> + '_ {
        self.classifiers.iter().map(|c| c.spec())
    }

    /// Decode the image at `path` and analyze it.
    ///
    /// Returns `Ok(None)` when no face is found.
    pub async fn process_image(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Option<AnalysisReport>, PipelineError> {
        let path = path.as_ref().to_path_buf();
        tracing::info!(path = %path.display(), "processing image");

        let image = tokio::task::spawn_blocking(move || image::open(&path).map(|i| i.to_rgb8()))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;

        self.process_rgb(image).await
    }

    /// Decode an encoded image (PNG, JPEG, …) held in memory and analyze it.
    pub async fn process_bytes(
        &self,
        bytes: &[u8],
    ) -> Result<Option<AnalysisReport>, PipelineError> {
        let image = image::load_from_memory(bytes)?.to_rgb8();
        self.process_rgb(image).await
    }

    /// Analyze a decoded RGB image.
    pub async fn process_rgb(
        &self,
        image: RgbImage,
    ) -> Result<Option<AnalysisReport>, PipelineError> {
        let started = Instant::now();

        let faces = self.detect(image).await?;
        if faces.is_empty() {
            tracing::info!("no faces detected");
            return Ok(None);
        }

        let total = faces.len();
        let mut reports = Vec::with_capacity(total);

        for (index, face) in faces.into_iter().enumerate() {
            let face_id = index + 1;
            tracing::debug!(face_id, total, "classifying face");

            let DetectedFace {
                crop,
                bbox,
                confidence,
            } = face;
            let outcomes = self.run_pipeline(Arc::new(crop)).await;

            reports.push(FaceReport {
                face_id,
                bbox,
                detection_confidence: confidence,
                outcomes,
            });
        }

        tracing::info!(
            faces = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "image processed"
        );

        Ok(AnalysisReport::from_faces(reports))
    }

    /// Run the face detector on the blocking pool.
    pub async fn detect(&self, image: RgbImage) -> Result<Vec<DetectedFace>, PipelineError> {
        let detector = Arc::clone(&self.detector);
        let faces = tokio::task::spawn_blocking(move || detector.detect(&image))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;
        Ok(faces)
    }

    /// Classify one face crop with every classifier concurrently.
    ///
    /// Always returns one outcome per classifier, in pipeline order. A
    /// failing, panicking or timed-out classifier yields a failure outcome
    /// and does not affect the others.
    pub async fn run_pipeline(&self, crop: Arc<RgbImage>) -> Vec<ClassificationOutcome> {
        let handles: Vec<JoinHandle<ClassificationOutcome>> = self
            .classifiers
            .iter()
            .map(|classifier| {
                let classifier = Arc::clone(classifier);
                let crop = Arc::clone(&crop);
                tokio::task::spawn_blocking(move || {
                    classifier::classify(classifier.as_ref(), &crop)
                })
            })
            .collect();

        let deadline = self
            .classifier_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        let mut outcomes = Vec::with_capacity(handles.len());
        for (classifier, handle) in self.classifiers.iter().zip(handles) {
            outcomes.push(join_classifier(classifier.spec().name, handle, deadline).await);
        }
        outcomes
    }

    /// Run a single classifier by model name.
    pub async fn classify(&self, model_name: &str, crop: Arc<RgbImage>) -> ClassificationOutcome {
        let Some(classifier) = self
            .classifiers
            .iter()
            .find(|c| c.spec().name == model_name)
        else {
            return ClassificationOutcome::failure(model_name, "unknown classifier");
        };

        let classifier = Arc::clone(classifier);
        let deadline = self
            .classifier_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let handle =
            tokio::task::spawn_blocking(move || classifier::classify(classifier.as_ref(), &crop));
        join_classifier(model_name, handle, deadline).await
    }

    /// Render results for the summarizer; a fixed notice when absent.
    pub fn print_results(&self, report: Option<&AnalysisReport>) -> String {
        match report {
            Some(report) => report::format_report(report),
            None => report::NO_RESULTS_TEXT.to_string(),
        }
    }

    /// Split a summarizer response into narrative and diagram fields.
    pub fn parse_llm_response(&self, raw: &str) -> SummaryParseResult {
        summary::parse(raw)
    }
}

async fn join_classifier(
    model_name: &str,
    handle: JoinHandle<ClassificationOutcome>,
    deadline: Option<tokio::time::Instant>,
) -> ClassificationOutcome {
    let joined = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(model = model_name, "classifier timed out");
                return ClassificationOutcome::failure(model_name, "classifier timed out");
            }
        },
        None => handle.await,
    };

    joined.unwrap_or_else(|e| {
        tracing::warn!(model = model_name, error = %e, "classifier task failed");
        ClassificationOutcome::failure(model_name, format!("classifier task failed: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaceBox;
    use image::Rgb;

    /// Returns a fixed list of faces regardless of input.
    struct FakeDetector {
        boxes: Vec<FaceBox>,
    }

    impl FaceDetect for FakeDetector {
        fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError> {
            Ok(self
                .boxes
                .iter()
                .enumerate()
                .map(|(i, &bbox)| DetectedFace {
                    crop: image::imageops::crop_imm(
                        image,
                        bbox.x1,
                        bbox.y1,
                        bbox.width(),
                        bbox.height(),
                    )
                    .to_image(),
                    bbox,
                    confidence: 0.9 - i as f32 * 0.05,
                })
                .collect())
        }
    }

    struct BrokenDetector;

    impl FaceDetect for BrokenDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError> {
            Err(DetectorError::InferenceFailed("bad model".into()))
        }
    }

    enum Behavior {
        Logits(Vec<f32>),
        Fail,
        Panic,
        Sleep(Duration),
    }

    struct FakeClassifier {
        kind: ClassifierKind,
        behavior: Behavior,
    }

    impl AttributeClassifier for FakeClassifier {
        fn spec(&self) -> &ClassifierSpec {
            self.kind.spec()
        }

        fn logits(&self, crop: &RgbImage) -> Result<Vec<f32>, ClassifierError> {
            let labels = self.kind.spec().labels.len();
            match &self.behavior {
                Behavior::Logits(logits) => Ok(logits.clone()),
                Behavior::Fail => Err(ClassifierError::InferenceFailed("corrupt weights".into())),
                Behavior::Panic => panic!("classifier exploded"),
                Behavior::Sleep(d) => {
                    std::thread::sleep(*d);
                    // Brightness-dependent logits so different crops differ.
                    let first = f32::from(crop.get_pixel(0, 0)[0]) / 255.0;
                    Ok((0..labels).map(|i| if i == 0 { first } else { 0.0 }).collect())
                }
            }
        }
    }

    fn ramp_logits(kind: ClassifierKind) -> Vec<f32> {
        (0..kind.spec().labels.len()).map(|i| i as f32).collect()
    }

    fn classifiers_with(
        special: Option<(ClassifierKind, Behavior)>,
    ) -> Vec<Arc<dyn AttributeClassifier>> {
        let mut special = special;
        ClassifierKind::PIPELINE_ORDER
            .iter()
            .map(|&kind| {
                let behavior = match special.take() {
                    Some((k, b)) if k == kind => b,
                    other => {
                        special = other;
                        Behavior::Logits(ramp_logits(kind))
                    }
                };
                Arc::new(FakeClassifier { kind, behavior }) as Arc<dyn AttributeClassifier>
            })
            .collect()
    }

    fn pipeline(boxes: Vec<FaceBox>, special: Option<(ClassifierKind, Behavior)>) -> Pipeline {
        Pipeline::new(Arc::new(FakeDetector { boxes }), classifiers_with(special))
    }

    fn test_image() -> RgbImage {
        RgbImage::from_pixel(640, 480, Rgb([120, 90, 60]))
    }

    fn three_boxes() -> Vec<FaceBox> {
        vec![
            FaceBox::new(0, 0, 70, 70),
            FaceBox::new(100, 100, 220, 260),
            FaceBox::new(400, 50, 520, 200),
        ]
    }

    fn expected_names() -> Vec<&'static str> {
        ClassifierKind::PIPELINE_ORDER.iter().map(|k| k.spec().name).collect()
    }

    #[tokio::test]
    async fn test_face_ids_contiguous_in_detection_order() {
        let p = pipeline(three_boxes(), None);
        let report = p.process_rgb(test_image()).await.unwrap().unwrap();

        let ids: Vec<_> = report.faces().iter().map(|f| f.face_id).collect();
        assert_eq!(ids, [1, 2, 3]);
        assert_eq!(report.faces()[1].bbox, three_boxes()[1]);
        assert!((report.faces()[0].detection_confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_no_faces_is_absent() {
        let p = pipeline(vec![], None);
        assert!(p.process_rgb(test_image()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outcomes_in_pipeline_order_with_valid_probabilities() {
        let p = pipeline(three_boxes(), None);
        let report = p.process_rgb(test_image()).await.unwrap().unwrap();

        for face in report.faces() {
            let names: Vec<_> = face.outcomes.iter().map(|o| o.model_name()).collect();
            assert_eq!(names, expected_names());

            for (outcome, kind) in face.outcomes.iter().zip(ClassifierKind::PIPELINE_ORDER) {
                let prediction = outcome.prediction().unwrap();
                assert_eq!(prediction.label_probabilities.len(), kind.spec().labels.len());

                let sum: f64 = prediction
                    .label_probabilities
                    .iter()
                    .map(|lp| f64::from(lp.probability))
                    .sum();
                assert!((sum - 1.0).abs() < 1e-6);

                let (best, _) = prediction
                    .label_probabilities
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |acc, (i, lp)| {
                        if lp.probability > acc.1 { (i, lp.probability) } else { acc }
                    });
                assert_eq!(prediction.predicted_index, best);
                assert_eq!(prediction.predicted_label, kind.spec().labels[best]);
            }
        }
    }

    #[tokio::test]
    async fn test_failing_classifier_is_isolated() {
        let p = pipeline(three_boxes(), Some((ClassifierKind::DarkCircles, Behavior::Fail)));
        let report = p.process_rgb(test_image()).await.unwrap().unwrap();

        for face in report.faces() {
            assert_eq!(face.outcomes.len(), 5);
            assert_eq!(
                face.outcomes[2],
                ClassificationOutcome::failure(
                    "mobilenet_eyes_darkcircles",
                    "inference failed: corrupt weights"
                )
            );
            let successes = face.outcomes.iter().filter(|o| !o.is_failure()).count();
            assert_eq!(successes, 4);
        }
    }

    #[tokio::test]
    async fn test_panicking_classifier_is_isolated() {
        let p = pipeline(three_boxes(), Some((ClassifierKind::Skin, Behavior::Panic)));
        let outcomes = p.run_pipeline(Arc::new(test_image())).await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes[0].is_failure());
        assert_eq!(outcomes[0].model_name(), "mobilenet_skin");
        assert!(outcomes[1..].iter().all(|o| !o.is_failure()));
    }

    #[tokio::test]
    async fn test_slow_classifier_keeps_order() {
        let p = pipeline(
            three_boxes(),
            Some((ClassifierKind::Skin, Behavior::Sleep(Duration::from_millis(50)))),
        );
        let outcomes = p.run_pipeline(Arc::new(test_image())).await;
        let names: Vec<_> = outcomes.iter().map(|o| o.model_name()).collect();
        assert_eq!(names, expected_names());
        assert!(outcomes.iter().all(|o| !o.is_failure()));
    }

    #[tokio::test]
    async fn test_classifier_timeout_becomes_failure() {
        let p = pipeline(
            three_boxes(),
            Some((ClassifierKind::General, Behavior::Sleep(Duration::from_millis(500)))),
        )
        .with_classifier_timeout(Some(Duration::from_millis(50)));

        let outcomes = p.run_pipeline(Arc::new(test_image())).await;
        assert_eq!(
            outcomes[4],
            ClassificationOutcome::failure("mobilenet_general", "classifier timed out")
        );
        assert!(outcomes[..4].iter().all(|o| !o.is_failure()));
    }

    #[tokio::test]
    async fn test_detector_failure_is_fatal() {
        let p = Pipeline::new(Arc::new(BrokenDetector), classifiers_with(None));
        let err = p.process_rgb(test_image()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Detector(DetectorError::InferenceFailed(_))));
    }

    #[tokio::test]
    async fn test_undecodable_bytes_are_fatal() {
        let p = pipeline(three_boxes(), None);
        let err = p.process_bytes(b"definitely not an image").await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[tokio::test]
    async fn test_process_image_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        test_image().save(&path).unwrap();

        let p = pipeline(three_boxes(), None);
        let report = p.process_image(&path).await.unwrap().unwrap();
        assert_eq!(report.len(), 3);
    }

    #[tokio::test]
    async fn test_process_image_missing_file() {
        let p = pipeline(three_boxes(), None);
        let err = p.process_image("/nonexistent/face.png").await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[tokio::test]
    async fn test_classify_by_name() {
        let p = pipeline(vec![], None);
        let crop = Arc::new(test_image());

        let outcome = p.classify("mobilenet_general", Arc::clone(&crop)).await;
        assert_eq!(outcome.prediction().unwrap().predicted_label, "healthy");

        let unknown = p.classify("mobilenet_nose", crop).await;
        assert_eq!(unknown, ClassificationOutcome::failure("mobilenet_nose", "unknown classifier"));
    }

    #[tokio::test]
    async fn test_print_results() {
        let p = pipeline(three_boxes(), None);
        assert_eq!(p.print_results(None), report::NO_RESULTS_TEXT);

        let report = p.process_rgb(test_image()).await.unwrap().unwrap();
        let text = p.print_results(Some(&report));
        assert!(text.contains("FACE 3\n"));
        assert_eq!(text, p.print_results(Some(&report)));
    }

    #[test]
    fn test_model_paths_in_dir() {
        let paths = ModelPaths::in_dir(Path::new("/models"));
        assert_eq!(paths.detector, Path::new("/models/model.onnx"));
        assert_eq!(paths.classifiers.len(), 5);
        assert_eq!(paths.classifiers[2].0, ClassifierKind::DarkCircles);
        assert_eq!(paths.classifiers[2].1, Path::new("/models/mobilenet_darkcircles.onnx"));
    }

    #[test]
    fn test_load_fails_on_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths::in_dir(dir.path());
        assert_eq!(paths.missing().len(), 6);
        assert!(matches!(
            Pipeline::load(&paths),
            Err(PipelineError::Detector(DetectorError::ModelNotFound(_)))
        ));
    }
}
