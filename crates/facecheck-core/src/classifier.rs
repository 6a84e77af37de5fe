//! MobileNet attribute classifiers via ONNX Runtime.
//!
//! Each classifier scores one face crop against a fixed label set. Crops are
//! resized to a 256 px short side, center-cropped to 224×224 and normalized
//! with the ImageNet statistics before the forward pass.

use crate::types::{ClassificationOutcome, ClassifierSpec, LabelProbability, Prediction};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const CLASSIFIER_RESIZE: u32 = 256;
const CLASSIFIER_INPUT_SIZE: u32 = 224;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier model not found: {0}")]
    ModelNotFound(String),
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model produced {actual} logits for {expected} labels")]
    LabelMismatch { expected: usize, actual: usize },
    #[error("model produced non-finite logits")]
    NonFiniteLogits,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A single-label classifier over face crops.
///
/// Implementations return raw logits in label-set order; softmax and
/// arg-max are applied by [`classify`].
pub trait AttributeClassifier: Send + Sync {
    fn spec(&self) -> &ClassifierSpec;
    fn logits(&self, crop: &RgbImage) -> Result<Vec<f32>, ClassifierError>;
}

/// ONNX-backed attribute classifier.
pub struct OnnxClassifier {
    spec: ClassifierSpec,
    session: Mutex<Session>,
}

impl OnnxClassifier {
    /// Load the classifier weights from the given path.
    pub fn load(spec: ClassifierSpec, model_path: &Path) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(
            model = spec.name,
            path = %model_path.display(),
            labels = spec.labels.len(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded classifier model"
        );

        Ok(Self {
            spec,
            session: Mutex::new(session),
        })
    }
}

impl AttributeClassifier for OnnxClassifier {
    fn spec(&self) -> &ClassifierSpec {
        &self.spec
    }

    fn logits(&self, crop: &RgbImage) -> Result<Vec<f32>, ClassifierError> {
        let input = preprocess(crop)?;

        let mut session = crate::lock_session(&self.session);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("logits: {e}")))?;

        Ok(raw.to_vec())
    }
}

/// Run one classifier on one crop. Errors become a failure outcome for that
/// model; they never propagate.
pub fn classify(classifier: &dyn AttributeClassifier, crop: &RgbImage) -> ClassificationOutcome {
    let spec = classifier.spec();
    let result = classifier
        .logits(crop)
        .and_then(|logits| predict(spec, &logits));

    match result {
        Ok(prediction) => {
            tracing::debug!(
                model = spec.name,
                label = %prediction.predicted_label,
                confidence = prediction.confidence,
                "classified"
            );
            ClassificationOutcome::Success(prediction)
        }
        Err(e) => {
            tracing::warn!(model = spec.name, error = %e, "classifier failed");
            ClassificationOutcome::failure(spec.name, e.to_string())
        }
    }
}

/// Turn raw logits into a prediction over `spec.labels`.
pub fn predict(spec: &ClassifierSpec, logits: &[f32]) -> Result<Prediction, ClassifierError> {
    if logits.len() != spec.labels.len() {
        return Err(ClassifierError::LabelMismatch {
            expected: spec.labels.len(),
            actual: logits.len(),
        });
    }
    if logits.iter().any(|l| !l.is_finite()) {
        return Err(ClassifierError::NonFiniteLogits);
    }

    let probabilities = softmax(logits);
    let predicted_index = argmax(&probabilities).ok_or(ClassifierError::LabelMismatch {
        expected: spec.labels.len(),
        actual: 0,
    })?;

    Ok(Prediction {
        model_name: spec.name.to_string(),
        predicted_index,
        predicted_label: spec.labels[predicted_index].to_string(),
        confidence: probabilities[predicted_index],
        label_probabilities: spec
            .labels
            .iter()
            .zip(&probabilities)
            .map(|(label, &probability)| LabelProbability {
                label: label.to_string(),
                probability,
            })
            .collect(),
    })
}

/// Numerically stable softmax. Accumulates in f64 so the f32 outputs sum to
/// 1 within 1e-6.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f64> = logits
        .iter()
        .map(|&l| f64::from(l - max).exp())
        .collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| (e / sum) as f32).collect()
}

/// Index of the first maximal value.
fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

/// Preprocess a face crop into a normalized 1×3×224×224 tensor.
pub fn preprocess(crop: &RgbImage) -> Result<Array4<f32>, ClassifierError> {
    let (width, height) = crop.dimensions();
    if width == 0 || height == 0 {
        return Err(ClassifierError::EmptyCrop);
    }

    let (new_w, new_h) = short_side_size(width, height, CLASSIFIER_RESIZE);
    let resized = imageops::resize(crop, new_w, new_h, FilterType::Triangle);

    let left = center_offset(new_w, CLASSIFIER_INPUT_SIZE);
    let top = center_offset(new_h, CLASSIFIER_INPUT_SIZE);

    let size = CLASSIFIER_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let pixel = resized.get_pixel(left + x as u32, top + y as u32);
            for c in 0..3 {
                let value = f32::from(pixel[c]) / 255.0;
                tensor[[0, c, y, x]] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
    }

    Ok(tensor)
}

/// Output size when scaling the short side to `target`, long side truncated.
fn short_side_size(width: u32, height: u32, target: u32) -> (u32, u32) {
    let scaled = |long: u32, short: u32| {
        (u64::from(target) * u64::from(long) / u64::from(short)) as u32
    };
    if width <= height {
        (target, scaled(height, width))
    } else {
        (scaled(width, height), target)
    }
}

/// Start offset that centers `target` inside `extent`, halves rounded to even.
fn center_offset(extent: u32, target: u32) -> u32 {
    let diff = extent.saturating_sub(target);
    let half = diff / 2;
    if diff % 2 == 1 && half % 2 == 1 {
        half + 1
    } else {
        half
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassifierKind;
    use image::Rgb;

    struct FixedLogits {
        spec: ClassifierSpec,
        logits: Result<Vec<f32>, &'static str>,
    }

    impl AttributeClassifier for FixedLogits {
        fn spec(&self) -> &ClassifierSpec {
            &self.spec
        }

        fn logits(&self, _crop: &RgbImage) -> Result<Vec<f32>, ClassifierError> {
            self.logits
                .clone()
                .map_err(|e| ClassifierError::InferenceFailed(e.to_string()))
        }
    }

    #[test]
    fn test_softmax_sums_to_one() {
        for logits in [
            vec![1.0, 2.0, 3.0],
            vec![-50.0, 0.0, 50.0, 10.0, 3.0, 3.0],
            vec![0.0, 0.0],
        ] {
            let probs = softmax(&logits);
            let sum: f64 = probs.iter().map(|&p| f64::from(p)).sum();
            assert_eq!(probs.len(), logits.len());
            assert!((sum - 1.0).abs() < 1e-6, "sum = {sum}");
        }
    }

    #[test]
    fn test_softmax_large_logits_stable() {
        let probs = softmax(&[1000.0, 1000.0]);
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!((probs[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_argmax_first_on_ties() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_predict_picks_argmax() {
        let spec = ClassifierKind::Age.spec();
        let p = predict(spec, &[0.1, 0.2, 3.0, 0.4, -1.0, 0.0]).unwrap();
        assert_eq!(p.model_name, "mobilenet_age");
        assert_eq!(p.predicted_index, 2);
        assert_eq!(p.predicted_label, "child");
        assert_eq!(p.label_probabilities.len(), 6);

        let best = p
            .label_probabilities
            .iter()
            .map(|lp| lp.probability)
            .fold(f32::NEG_INFINITY, f32::max);
        assert_eq!(p.confidence, best);
        assert_eq!(p.label_probabilities[2].label, "child");
    }

    #[test]
    fn test_predict_label_mismatch() {
        let spec = ClassifierKind::Skin.spec();
        let err = predict(spec, &[0.1, 0.2]).unwrap_err();
        assert!(matches!(err, ClassifierError::LabelMismatch { expected: 3, actual: 2 }));
    }

    #[test]
    fn test_predict_rejects_nan() {
        let spec = ClassifierKind::General.spec();
        assert!(matches!(
            predict(spec, &[f32::NAN, 1.0]),
            Err(ClassifierError::NonFiniteLogits)
        ));
    }

    #[test]
    fn test_classify_captures_failure() {
        let classifier = FixedLogits {
            spec: *ClassifierKind::EyeCondition.spec(),
            logits: Err("corrupt weights"),
        };
        let outcome = classify(&classifier, &RgbImage::new(8, 8));
        assert_eq!(
            outcome,
            ClassificationOutcome::failure(
                "mobilenet_eyes_pupils",
                "inference failed: corrupt weights"
            )
        );
    }

    #[test]
    fn test_classify_success() {
        let classifier = FixedLogits {
            spec: *ClassifierKind::DarkCircles.spec(),
            logits: Ok(vec![0.0, 0.0, 2.0]),
        };
        let outcome = classify(&classifier, &RgbImage::new(8, 8));
        let p = outcome.prediction().unwrap();
        assert_eq!(p.predicted_label, "light_darkcircles");
    }

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(300, 180, Rgb([128, 128, 128]));
        let tensor = preprocess(&crop).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let crop = RgbImage::from_pixel(100, 120, Rgb([255, 0, 128]));
        let tensor = preprocess(&crop).unwrap();

        let expected_r = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let expected_g = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        let expected_b = (128.0 / 255.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2];
        assert!((tensor[[0, 0, 10, 10]] - expected_r).abs() < 1e-5);
        assert!((tensor[[0, 1, 100, 200]] - expected_g).abs() < 1e-5);
        assert!((tensor[[0, 2, 223, 0]] - expected_b).abs() < 1e-5);
    }

    #[test]
    fn test_preprocess_empty_crop() {
        assert!(matches!(preprocess(&RgbImage::new(0, 10)), Err(ClassifierError::EmptyCrop)));
    }

    #[test]
    fn test_short_side_size() {
        assert_eq!(short_side_size(100, 200, 256), (256, 512));
        assert_eq!(short_side_size(300, 200, 256), (384, 256));
        assert_eq!(short_side_size(70, 100, 256), (256, 365));
        assert_eq!(short_side_size(50, 50, 256), (256, 256));
    }

    #[test]
    fn test_center_offset_rounds_half_to_even() {
        assert_eq!(center_offset(256, 224), 16);
        // (257 - 224) / 2 = 16.5 → 16
        assert_eq!(center_offset(257, 224), 16);
        // (259 - 224) / 2 = 17.5 → 18
        assert_eq!(center_offset(259, 224), 18);
        assert_eq!(center_offset(224, 224), 0);
    }
}
