use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Face region in source-image pixel coordinates. `x2`/`y2` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl FaceBox {
    pub const fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }
}

impl fmt::Display for FaceBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// A face found by the detector, cropped out of the source image with margin.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub crop: RgbImage,
    pub bbox: FaceBox,
    /// Detector score in [0, 1].
    pub confidence: f32,
}

/// Static descriptor of one attribute classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassifierSpec {
    pub name: &'static str,
    /// Output labels in model logit order.
    pub labels: &'static [&'static str],
    /// File name of the ONNX weights inside the model directory.
    pub weight_file: &'static str,
}

const SKIN: ClassifierSpec = ClassifierSpec {
    name: "mobilenet_skin",
    labels: &["acne", "freckles", "healthy"],
    weight_file: "mobilenet_skin.onnx",
};

const AGE: ClassifierSpec = ClassifierSpec {
    name: "mobilenet_age",
    labels: &["adult", "baby", "child", "middle", "pensioner", "teenage"],
    weight_file: "mobilenet_age.onnx",
};

const DARK_CIRCLES: ClassifierSpec = ClassifierSpec {
    name: "mobilenet_eyes_darkcircles",
    labels: &["darkcircles", "healthy", "light_darkcircles"],
    weight_file: "mobilenet_darkcircles.onnx",
};

const EYE_CONDITION: ClassifierSpec = ClassifierSpec {
    name: "mobilenet_eyes_pupils",
    labels: &["conjunctivitis", "healthy", "yellowness"],
    weight_file: "mobilenet_eyes_pupils.onnx",
};

const GENERAL: ClassifierSpec = ClassifierSpec {
    name: "mobilenet_general",
    labels: &["edema", "healthy"],
    weight_file: "mobilenet_general.onnx",
};

/// The five attribute classifiers run on every face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Skin,
    Age,
    DarkCircles,
    EyeCondition,
    General,
}

impl ClassifierKind {
    /// Order in which outcomes appear in every face report.
    pub const PIPELINE_ORDER: [ClassifierKind; 5] = [
        ClassifierKind::Skin,
        ClassifierKind::Age,
        ClassifierKind::DarkCircles,
        ClassifierKind::EyeCondition,
        ClassifierKind::General,
    ];

    pub fn spec(self) -> &'static ClassifierSpec {
        match self {
            ClassifierKind::Skin => &SKIN,
            ClassifierKind::Age => &AGE,
            ClassifierKind::DarkCircles => &DARK_CIRCLES,
            ClassifierKind::EyeCondition => &EYE_CONDITION,
            ClassifierKind::General => &GENERAL,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::PIPELINE_ORDER
            .into_iter()
            .find(|kind| kind.spec().name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelProbability {
    pub label: String,
    pub probability: f32,
}

/// Successful classifier output for one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_name: String,
    pub predicted_index: usize,
    pub predicted_label: String,
    pub confidence: f32,
    /// One entry per label, in label-set order. Sums to 1.
    pub label_probabilities: Vec<LabelProbability>,
}

impl Prediction {
    /// The `k` most probable labels with their label-set index, highest first.
    ///
    /// Ties keep label-set order.
    pub fn top_labels(&self, k: usize) -> Vec<(usize, &LabelProbability)> {
        let mut ranked: Vec<(usize, &LabelProbability)> =
            self.label_probabilities.iter().enumerate().collect();
        ranked.sort_by(|a, b| {
            b.1.probability
                .partial_cmp(&a.1.probability)
                .unwrap_or(Ordering::Equal)
        });
        ranked.truncate(k);
        ranked
    }
}

/// Result of running one classifier on one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClassificationOutcome {
    Success(Prediction),
    Failure {
        model_name: String,
        error_message: String,
    },
}

impl ClassificationOutcome {
    pub fn failure(model_name: &str, error_message: impl Into<String>) -> Self {
        ClassificationOutcome::Failure {
            model_name: model_name.to_string(),
            error_message: error_message.into(),
        }
    }

    pub fn model_name(&self) -> &str {
        match self {
            ClassificationOutcome::Success(prediction) => &prediction.model_name,
            ClassificationOutcome::Failure { model_name, .. } => model_name,
        }
    }

    pub fn prediction(&self) -> Option<&Prediction> {
        match self {
            ClassificationOutcome::Success(prediction) => Some(prediction),
            ClassificationOutcome::Failure { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ClassificationOutcome::Failure { .. })
    }
}

/// All classifier outcomes for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceReport {
    /// 1-based, in detection order.
    pub face_id: usize,
    pub bbox: FaceBox,
    pub detection_confidence: f32,
    /// One per classifier, in pipeline order.
    pub outcomes: Vec<ClassificationOutcome>,
}

/// Per-face results for one image. Never empty: an image without faces
/// has no report at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AnalysisReport {
    faces: Vec<FaceReport>,
}

impl AnalysisReport {
    /// Returns `None` when `faces` is empty.
    pub fn from_faces(faces: Vec<FaceReport>) -> Option<Self> {
        if faces.is_empty() {
            None
        } else {
            Some(Self { faces })
        }
    }

    pub fn faces(&self) -> &[FaceReport] {
        &self.faces
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }
}
