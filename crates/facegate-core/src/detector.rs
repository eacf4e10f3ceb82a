//! Deep face detection (SCRFD, `det_10g.onnx`) on ONNX Runtime.
//!
//! The image is letterboxed into a square input, the three anchor-free heads
//! (strides 8, 16, 32; two anchors per cell) are decoded into boxes with
//! five-point landmarks, and overlapping boxes are suppressed greedily.

use std::path::Path;
use std::sync::Mutex;

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::{DynValue, TensorRef};
use thiserror::Error;

use crate::types::BoundingBox;

const INPUT_SIDE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
/// Anchors scoring at or below this are not decoded at all.
const DECODE_MIN_SCORE: f32 = 0.5;
const OVERLAP_LIMIT: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("detector inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector session lock poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Deep detector producing boxes with confidences and, where available, landmarks.
pub trait LandmarkDetector: Send + Sync {
    /// Detections in image coordinates, highest confidence first.
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;

    fn name(&self) -> &str;
}

/// Where the source image sits inside the square network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
    inner_w: usize,
    inner_h: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize, side: usize) -> Self {
        let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
        let inner_w = ((width as f32 * scale).round() as usize).clamp(1, side);
        let inner_h = ((height as f32 * scale).round() as usize).clamp(1, side);
        Self {
            scale,
            offset_x: (side - inner_w) as f32 / 2.0,
            offset_y: (side - inner_h) as f32 / 2.0,
            inner_w,
            inner_h,
        }
    }

    /// Network-input point back to source-image coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.offset_x) / self.scale, (y - self.offset_y) / self.scale)
    }
}

/// Output positions of the three tensors belonging to one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadLayout {
    score: usize,
    bbox: usize,
    kps: usize,
}

impl HeadLayout {
    const fn at(score: usize, bbox: usize, kps: usize) -> Self {
        Self { score, bbox, kps }
    }
}

/// Positional layout used by exports without named outputs: all scores, then boxes, then landmarks.
const POSITIONAL_LAYOUT: [HeadLayout; 3] = [HeadLayout::at(0, 3, 6), HeadLayout::at(1, 4, 7), HeadLayout::at(2, 5, 8)];

pub struct ScrfdDetector {
    session: Mutex<Session>,
    layout: [HeadLayout; 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?.with_intra_threads(2)?.commit_from_file(model_path)?;
        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if outputs.len() < STRIDES.len() * 3 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected {} outputs (score, bbox and kps per stride), model has {}",
                STRIDES.len() * 3,
                outputs.len()
            )));
        }

        let layout = head_layout(&outputs);
        tracing::info!(path = %model_path.display(), ?outputs, ?layout, "deep face detector loaded");

        Ok(Self { session: Mutex::new(session), layout })
    }
}

impl LandmarkDetector for ScrfdDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = to_input_tensor(image, INPUT_SIDE);

        let mut session = self.session.lock().map_err(|_| DetectorError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (layout, &stride) in self.layout.iter().zip(STRIDES.iter()) {
            let level = Level {
                stride,
                scores: tensor(&outputs[layout.score], "score", stride)?,
                boxes: tensor(&outputs[layout.bbox], "bbox", stride)?,
                landmarks: tensor(&outputs[layout.kps], "kps", stride)?,
            };
            candidates.extend(level.decode(INPUT_SIDE, &letterbox, DECODE_MIN_SCORE));
        }

        let kept = suppress_overlaps(candidates, OVERLAP_LIMIT);
        tracing::debug!(faces = kept.len(), "deep detector pass finished");
        Ok(kept)
    }

    fn name(&self) -> &str {
        "scrfd"
    }
}

fn tensor<'a>(value: &'a DynValue, what: &str, stride: usize) -> Result<&'a [f32], DetectorError> {
    value
        .try_extract_tensor::<f32>()
        .map(|(_, data)| data)
        .map_err(|e| DetectorError::InferenceFailed(format!("{what} output for stride {stride}: {e}")))
}

/// RGB, mean/std normalised, NCHW. Letterbox padding stays at 0.0.
fn to_input_tensor(image: &RgbImage, side: usize) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width() as usize, image.height() as usize, side);
    let resized = image::imageops::resize(image, letterbox.inner_w as u32, letterbox.inner_h as u32, FilterType::Triangle);
    let (left, top) = (letterbox.offset_x as usize, letterbox.offset_y as usize);

    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, px) in resized.enumerate_pixels() {
        for (c, &v) in px.0.iter().enumerate() {
            input[[0, c, top + y as usize, left + x as usize]] = (v as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }
    (input, letterbox)
}

/// Map each stride to its outputs by name (`score_8`, `bbox_16`, `kps_32`, ...),
/// or positionally when the export does not use those names.
fn head_layout(outputs: &[String]) -> [HeadLayout; 3] {
    let position = |kind: &str, stride: usize| outputs.iter().position(|n| *n == format!("{kind}_{stride}"));
    let by_name = |stride: usize| {
        Some(HeadLayout::at(position("score", stride)?, position("bbox", stride)?, position("kps", stride)?))
    };

    match (by_name(STRIDES[0]), by_name(STRIDES[1]), by_name(STRIDES[2])) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::info!(?outputs, "unrecognised detector output names; assuming positional layout");
            POSITIONAL_LAYOUT
        }
    }
}

/// Flattened head outputs of one stride: `scores[a]`, `boxes[a*4..]`, `landmarks[a*10..]`.
struct Level<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: &'a [f32],
}

impl Level<'_> {
    fn decode(&self, side: usize, letterbox: &Letterbox, min_score: f32) -> Vec<BoundingBox> {
        let cols = side / self.stride;
        let step = self.stride as f32;
        let anchors = cols * cols * ANCHORS_PER_CELL;

        (0..anchors.min(self.scores.len()))
            .filter(|&a| self.scores[a] > min_score)
            .filter_map(|a| {
                let cell = a / ANCHORS_PER_CELL;
                let cx = (cell % cols) as f32 * step;
                let cy = (cell / cols) as f32 * step;

                let d = self.boxes.get(a * 4..a * 4 + 4)?;
                let (left, top) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
                let (right, bottom) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

                let landmarks = self.landmarks.get(a * 10..a * 10 + 10).map(|k| {
                    std::array::from_fn(|p| letterbox.unmap(cx + k[2 * p] * step, cy + k[2 * p + 1] * step))
                });

                Some(BoundingBox {
                    x: left,
                    y: top,
                    width: right - left,
                    height: bottom - top,
                    confidence: self.scores[a],
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy suppression: walk boxes by falling confidence, dropping any that
/// overlap an already-kept box by more than `limit` IoU.
fn suppress_overlaps(mut boxes: Vec<BoundingBox>, limit: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| overlap(k, &candidate) <= limit) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection over union.
fn overlap(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, side: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: side, height: side, confidence, landmarks: None }
    }

    #[test]
    fn test_overlap() {
        let a = face(10.0, 10.0, 20.0, 1.0);
        assert!((overlap(&a, &a) - 1.0).abs() < 1e-6);
        // Half-shifted square: 200 shared of 600 total.
        let b = face(20.0, 10.0, 20.0, 1.0);
        assert!((overlap(&a, &b) - 200.0 / 600.0).abs() < 1e-6);
        assert_eq!(overlap(&a, &face(100.0, 100.0, 5.0, 1.0)), 0.0);
    }

    #[test]
    fn test_suppression_keeps_strongest_per_cluster() {
        let kept = suppress_overlaps(
            vec![
                face(2.0, 2.0, 60.0, 0.75),
                face(300.0, 40.0, 40.0, 0.6),
                face(0.0, 0.0, 60.0, 0.97),
            ],
            OVERLAP_LIMIT,
        );
        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.97, 0.6]);
        assert!(suppress_overlaps(Vec::new(), OVERLAP_LIMIT).is_empty());
    }

    #[test]
    fn test_letterbox_tall_image() {
        let lb = Letterbox::fit(200, 400, 640);
        assert!((lb.scale - 1.6).abs() < 1e-6);
        assert_eq!((lb.inner_w, lb.inner_h), (320, 640));
        assert!((lb.offset_x - 160.0).abs() < 1e-6);
        assert_eq!(lb.offset_y, 0.0);

        let (x, y) = lb.unmap(160.0 + 50.0 * 1.6, 300.0 * 1.6);
        assert!((x - 50.0).abs() < 1e-3 && (y - 300.0).abs() < 1e-3);
    }

    #[test]
    fn test_input_tensor_layout() {
        let img = RgbImage::from_pixel(160, 320, image::Rgb([0, 255, 64]));
        let (input, lb) = to_input_tensor(&img, 64);
        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert_eq!(lb.inner_w, 32);
        // Left padding column.
        assert_eq!(input[[0, 1, 20, 3]], 0.0);
        let at = |c: usize| input[[0, c, 32, 32]];
        assert!((at(0) + PIXEL_MEAN / PIXEL_STD).abs() < 1e-5);
        assert!((at(1) - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-5);
    }

    #[test]
    fn test_level_decode() {
        let stride = 16;
        let cols = 64 / stride;
        let anchors = cols * cols * ANCHORS_PER_CELL;
        let mut scores = vec![0.1f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];
        let mut landmarks = vec![0.0f32; anchors * 10];

        // Anchor 11 sits in cell 5: column 1, row 1 → centre (16, 16).
        scores[11] = 0.88;
        boxes[44..48].copy_from_slice(&[1.0, 0.5, 1.0, 1.5]);
        landmarks[110..112].copy_from_slice(&[0.5, -0.25]);
        // Exactly at the cut-off is not decoded.
        scores[0] = 0.5;

        let lb = Letterbox { scale: 1.0, offset_x: 0.0, offset_y: 0.0, inner_w: 64, inner_h: 64 };
        let level = Level { stride, scores: &scores, boxes: &boxes, landmarks: &landmarks };
        let found = level.decode(64, &lb, DECODE_MIN_SCORE);

        assert_eq!(found.len(), 1);
        let f = &found[0];
        assert!((f.x - 0.0).abs() < 1e-5 && (f.y - 8.0).abs() < 1e-5);
        assert!((f.width - 32.0).abs() < 1e-5 && (f.height - 32.0).abs() < 1e-5);
        let eye = f.landmarks.unwrap()[0];
        assert!((eye.0 - 24.0).abs() < 1e-5 && (eye.1 - 12.0).abs() < 1e-5);
    }

    #[test]
    fn test_head_layout_by_name() {
        let outputs: Vec<String> = ["kps_8", "bbox_8", "score_8", "kps_16", "bbox_16", "score_16", "kps_32", "bbox_32", "score_32"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            head_layout(&outputs),
            [HeadLayout::at(2, 1, 0), HeadLayout::at(5, 4, 3), HeadLayout::at(8, 7, 6)]
        );
    }

    #[test]
    fn test_head_layout_positional() {
        let outputs: Vec<String> = (400..409).map(|i: u32| format!("out{i}")).collect();
        assert_eq!(head_layout(&outputs), POSITIONAL_LAYOUT);
    }
}
