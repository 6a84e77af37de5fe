//! YOLO face detector via ONNX Runtime.
//!
//! Runs an Ultralytics-style single-stage detector exported to ONNX. The
//! `[1, 4 + classes, anchors]` head is decoded per anchor, face-class boxes
//! above the confidence threshold go through NMS, and the survivors are
//! padded by a fixed margin and cropped out of the source image.

use crate::types::{DetectedFace, FaceBox};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_PAD_VALUE: u8 = 114;
const YOLO_NMS_THRESHOLD: f32 = 0.7;
const YOLO_MAX_DETECTIONS: usize = 300;
const YOLO_BOX_CHANNELS: usize = 4;

/// Minimum detector score for a face to be kept.
pub const FACE_CONFIDENCE_THRESHOLD: f32 = 0.70;
/// Class id of "face" in the detector head.
pub const FACE_CLASS_ID: usize = 0;
/// Context added around each detector box (forehead, chin) before cropping.
pub const FACE_MARGIN_PX: u32 = 20;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("face detector model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a full RGB image.
pub trait FaceDetect: Send + Sync {
    /// Faces in detection order (highest confidence first). Empty when
    /// nothing survives filtering.
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// Raw detector box in source-image coordinates, before margin expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: usize,
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Shape of the detector head. Ultralytics exports channel-major
/// `[1, channels, anchors]`; some converters emit `[1, anchors, channels]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadLayout {
    channels: usize,
    anchors: usize,
    transposed: bool,
}

impl HeadLayout {
    fn from_dims(dims: &[usize]) -> Result<Self, DetectorError> {
        let &[_, a, b] = dims else {
            return Err(DetectorError::InferenceFailed(format!(
                "expected a rank-3 detection head, got shape {dims:?}"
            )));
        };
        let (channels, anchors, transposed) = if a <= b { (a, b, false) } else { (b, a, true) };
        if channels <= YOLO_BOX_CHANNELS {
            return Err(DetectorError::InferenceFailed(format!(
                "detection head has {channels} channels, need box + at least one class"
            )));
        }
        Ok(Self {
            channels,
            anchors,
            transposed,
        })
    }

    fn num_classes(&self) -> usize {
        self.channels - YOLO_BOX_CHANNELS
    }

    fn at(&self, data: &[f32], channel: usize, anchor: usize) -> f32 {
        let idx = if self.transposed {
            anchor * self.channels + channel
        } else {
            channel * self.anchors + anchor
        };
        data.get(idx).copied().unwrap_or(0.0)
    }
}

/// YOLO-based face detector.
pub struct YoloFaceDetector {
    session: Mutex<Session>,
}

impl YoloFaceDetector {
    /// Load the detector ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded YOLO face model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Run the model and return NMS-filtered face boxes, highest confidence first.
    fn raw_detections(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::EmptyImage);
        }

        let (input, letterbox) = letterbox(image);

        let mut session = crate::lock_session(&self.session);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detection head: {e}")))?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        let layout = HeadLayout::from_dims(&dims)?;
        tracing::trace!(?layout, "decoding detection head");

        let candidates = decode_head(
            data,
            layout,
            &letterbox,
            width,
            height,
            FACE_CONFIDENCE_THRESHOLD,
        );

        let mut detections = nms(candidates, YOLO_NMS_THRESHOLD);
        detections.truncate(YOLO_MAX_DETECTIONS);
        Ok(detections)
    }
}

impl FaceDetect for YoloFaceDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError> {
        let detections = self.raw_detections(image)?;
        let faces = crop_faces(image, &detections);
        tracing::debug!(
            raw = detections.len(),
            kept = faces.len(),
            "face detection complete"
        );
        Ok(faces)
    }
}

/// Letterbox an RGB image into a 640×640 NCHW tensor scaled to [0, 1].
///
/// Aspect ratio is preserved; the border is filled with grey 114.
fn letterbox(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let size = YOLO_INPUT_SIZE;
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let left = ((size - new_w) as f32 / 2.0 - 0.1).round().max(0.0) as u32;
    let top = ((size - new_h) as f32 / 2.0 - 0.1).round().max(0.0) as u32;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([YOLO_PAD_VALUE; 3]));
    imageops::replace(&mut canvas, &resized, i64::from(left), i64::from(top));

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = f32::from(pixel[c]) / 255.0;
        }
    }

    (
        tensor,
        LetterboxInfo {
            scale,
            pad_x: left as f32,
            pad_y: top as f32,
        },
    )
}

/// Decode face-class candidates from the raw head output.
///
/// Each anchor is assigned its best-scoring class; only anchors whose best
/// class is [`FACE_CLASS_ID`] with a score at or above `threshold` are kept.
/// Boxes are mapped back to source pixels and clipped to the image.
fn decode_head(
    data: &[f32],
    layout: HeadLayout,
    letterbox: &LetterboxInfo,
    width: u32,
    height: u32,
    threshold: f32,
) -> Vec<Detection> {
    let mut detections = Vec::new();

    for anchor in 0..layout.anchors {
        let mut best_class = 0;
        let mut best_score = f32::NEG_INFINITY;
        for class in 0..layout.num_classes() {
            let score = layout.at(data, YOLO_BOX_CHANNELS + class, anchor);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if best_class != FACE_CLASS_ID || best_score < threshold {
            continue;
        }

        let cx = layout.at(data, 0, anchor);
        let cy = layout.at(data, 1, anchor);
        let w = layout.at(data, 2, anchor);
        let h = layout.at(data, 3, anchor);

        let unmap_x = |v: f32| ((v - letterbox.pad_x) / letterbox.scale).clamp(0.0, width as f32);
        let unmap_y = |v: f32| ((v - letterbox.pad_y) / letterbox.scale).clamp(0.0, height as f32);

        detections.push(Detection {
            x1: unmap_x(cx - w / 2.0),
            y1: unmap_y(cy - h / 2.0),
            x2: unmap_x(cx + w / 2.0),
            y2: unmap_y(cy + h / 2.0),
            confidence: best_score,
            class_id: best_class,
        });
    }

    detections
}

/// Crop every face-class detection out of `image` with [`FACE_MARGIN_PX`] margin.
///
/// Detections of other classes and boxes that clamp to zero area are dropped.
pub fn crop_faces(image: &RgbImage, detections: &[Detection]) -> Vec<DetectedFace> {
    let (width, height) = image.dimensions();

    detections
        .iter()
        .filter(|d| d.class_id == FACE_CLASS_ID)
        .filter_map(|d| {
            let Some(bbox) = expand_and_clamp(d, FACE_MARGIN_PX, width, height) else {
                tracing::debug!(?d, "dropping detection with empty crop");
                return None;
            };
            let crop =
                imageops::crop_imm(image, bbox.x1, bbox.y1, bbox.width(), bbox.height()).to_image();
            tracing::debug!(%bbox, confidence = d.confidence, "face cropped");
            Some(DetectedFace {
                crop,
                bbox,
                confidence: d.confidence,
            })
        })
        .collect()
}

/// Truncate a detection to integer pixels, grow it by `margin` on every side
/// and clamp it to a `width`×`height` image.
///
/// Returns `None` if the clamped box has zero area.
pub fn expand_and_clamp(det: &Detection, margin: u32, width: u32, height: u32) -> Option<FaceBox> {
    let margin = i64::from(margin);
    let x1 = (det.x1 as i64 - margin).max(0);
    let y1 = (det.y1 as i64 - margin).max(0);
    let x2 = (det.x2 as i64 + margin).min(i64::from(width));
    let y2 = (det.y2 as i64 + margin).min(i64::from(height));

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(FaceBox::new(x1 as u32, y1 as u32, x2 as u32, y2 as u32))
}

/// Non-Maximum Suppression: remove overlapping detections of the same class.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] || detections[j].class_id != detections[i].class_id {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two boxes.
fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
