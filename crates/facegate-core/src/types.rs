use chrono::{DateTime, Utc};
use image::DynamicImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::keypoints::{Descriptor, Keypoint};

/// Side length of the square greyscale face used for structural comparison.
pub const NORMALIZED_FACE_SIZE: u32 = 200;

/// Default decision threshold on the fused similarity (0–1).
pub const DEFAULT_THRESHOLD: f32 = 0.65;

/// Integer pixel rectangle in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Grow the box by `factor` of its size on every side, clamped to the image.
    ///
    /// The origin is clamped at zero without shrinking the extent, so a box
    /// touching the left/top edge shifts its context window inwards instead.
    pub fn expand(&self, factor: f32, image_width: u32, image_height: u32) -> Rect {
        // Truncate like an integer cast, tolerating f32 noise in `factor`.
        let trunc = |v: f64| (v + 1e-6).max(0.0).trunc() as u32;
        let factor = factor as f64;
        let w = self.width as f64;
        let h = self.height as f64;

        let x = trunc(self.x as f64 - w * factor).min(image_width);
        let y = trunc(self.y as f64 - h * factor).min(image_height);

        let width = trunc(w * (1.0 + 2.0 * factor)).min(image_width - x);
        let height = trunc(h * (1.0 + 2.0 * factor)).min(image_height - y);

        Rect { x, y, width, height }
    }

    /// Intersect with an image of the given size. `None` if nothing remains.
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Option<Rect> {
        if self.x >= image_width || self.y >= image_height {
            return None;
        }
        let width = self.width.min(image_width - self.x);
        let height = self.height.min(image_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(Rect { x: self.x, y: self.y, width, height })
    }

    /// Map a rectangle found on a resampled image back by dividing through `scale`.
    pub fn unscale(&self, scale: f32) -> Rect {
        if scale == 1.0 {
            return *self;
        }
        Rect {
            x: (self.x as f32 / scale).round() as u32,
            y: (self.y as f32 / scale).round() as u32,
            width: (self.width as f32 / scale).round() as u32,
            height: (self.height as f32 / scale).round() as u32,
        }
    }
}

/// Detector output box with confidence and optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Round to an integer rectangle inside a `width` × `height` image.
    pub fn to_rect(&self, width: u32, height: u32) -> Option<Rect> {
        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = (self.x + self.width).min(width as f32);
        let y2 = (self.y + self.height).min(height as f32);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Rect::new(x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32).clamp_to(width, height)
    }

    /// Both eye landmarks exist and fall inside the image.
    pub fn has_eye_landmarks(&self, width: u32, height: u32) -> bool {
        let inside = |(x, y): (f32, f32)| {
            x.is_finite() && y.is_finite() && x >= 0.0 && y >= 0.0 && x < width as f32 && y < height as f32
        };
        match &self.landmarks {
            Some(lms) => inside(lms[0]) && inside(lms[1]),
            None => false,
        }
    }
}

/// Face embedding vector (512-dimensional for the bundled FaceNet export).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "facenet_vggface2").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Unit-length copy of the vector. A zero vector stays zero.
    pub fn normalized(&self) -> Vec<f32> {
        let norm = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        }
    }

    /// Cosine similarity in [-1, 1] over L2-normalized vectors.
    ///
    /// `None` when dimensions differ or either vector is all zeros.
    pub fn similarity(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() || self.values.is_empty() {
            return None;
        }
        let a = self.normalized();
        let b = other.normalized();
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        if !dot.is_finite() || a.iter().all(|v| *v == 0.0) || b.iter().all(|v| *v == 0.0) {
            return None;
        }
        Some(dot.clamp(-1.0, 1.0))
    }
}

/// Everything extracted from one image; produced once per image and never persisted.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    /// 200×200 equalized greyscale face, values in [0, 1].
    pub normalized_face: Array2<f32>,
    /// Preprocessed colour (or greyscale, for greyscale inputs) context crop.
    pub color_face: DynamicImage,
    /// Selected face in source image coordinates (before context expansion).
    pub bounding_box: Rect,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    pub embedding: Option<Embedding>,
    /// At least one eye was found inside the face region.
    pub has_eyes: bool,
}

/// Similarity methods, in fusion-table column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[serde(rename = "facenet")]
    Embedding,
    #[serde(rename = "ssim")]
    Structural,
    Feature,
    Histogram,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::Embedding, Method::Structural, Method::Feature, Method::Histogram];

    pub fn name(&self) -> &'static str {
        match self {
            Method::Embedding => "facenet",
            Method::Structural => "ssim",
            Method::Feature => "feature",
            Method::Histogram => "histogram",
        }
    }
}

/// Per-method scores in [0, 1]. `None` means the method could not run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodScores {
    #[serde(rename = "facenet", skip_serializing_if = "Option::is_none")]
    pub embedding: Option<f32>,
    #[serde(rename = "ssim", skip_serializing_if = "Option::is_none")]
    pub structural: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<f32>,
}

impl MethodScores {
    pub fn get(&self, method: Method) -> Option<f32> {
        match method {
            Method::Embedding => self.embedding,
            Method::Structural => self.structural,
            Method::Feature => self.feature,
            Method::Histogram => self.histogram,
        }
    }

    pub fn is_present(&self, method: Method) -> bool {
        self.get(method).is_some()
    }

    pub fn any_present(&self) -> bool {
        Method::ALL.iter().any(|m| self.is_present(*m))
    }
}

/// Outcome of comparing two face records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityScoreSet {
    pub scores: MethodScores,
    /// Weighted, eye-checked similarity in [0, 1].
    pub fused: f32,
    pub has_eyes_check: bool,
}

/// Final answer of one verification call. Built once and handed to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    #[serde(rename = "match")]
    pub matched: bool,
    /// Fused similarity × 100.
    pub confidence: f32,
    /// Fused similarity in [0, 1].
    pub similarity: f32,
    pub has_eyes: bool,
    /// `matched && has_eyes`.
    pub security_passed: bool,
    /// Decision threshold × 100.
    pub threshold: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<SimilarityScoreSet>,
}

impl VerificationResult {
    /// Non-match carrying a diagnostic; used for every failure path.
    pub fn failure(error: impl Into<String>, threshold: f32) -> Self {
        Self {
            matched: false,
            confidence: 0.0,
            similarity: 0.0,
            has_eyes: false,
            security_passed: false,
            threshold: threshold * 100.0,
            error: Some(error.into()),
            warning: None,
            timestamp: Utc::now(),
            scores: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![3.0, 0.0, 0.0]);
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![0.0, 1.0]);
        assert!(a.similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![-1.0, 0.0]);
        assert!((a.similarity(&b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector_is_absent() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert!(a.similarity(&b).is_none());
    }

    #[test]
    fn test_cosine_similarity_dimension_mismatch() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert!(a.similarity(&b).is_none());
    }

    #[test]
    fn test_expand_inside_image() {
        let r = Rect::new(100, 100, 50, 50);
        let e = r.expand(0.2, 640, 480);
        assert_eq!(e, Rect::new(90, 90, 70, 70));
    }

    #[test]
    fn test_expand_clamps_origin_and_extent() {
        let r = Rect::new(5, 5, 100, 100);
        let e = r.expand(0.2, 120, 120);
        // Origin clamps to zero, extent clamps to what is left of the image.
        assert_eq!(e, Rect::new(0, 0, 120, 120));
    }

    #[test]
    fn test_bounding_box_to_rect_clips() {
        let b = BoundingBox {
            x: -10.0, y: 20.0, width: 60.0, height: 500.0,
            confidence: 0.95, landmarks: None,
        };
        let r = b.to_rect(100, 100).unwrap();
        assert_eq!(r, Rect::new(0, 20, 50, 80));
    }

    #[test]
    fn test_eye_landmarks_must_be_inside() {
        let mut b = BoundingBox {
            x: 0.0, y: 0.0, width: 50.0, height: 50.0, confidence: 0.99,
            landmarks: Some([(10.0, 10.0), (30.0, 10.0), (20.0, 25.0), (12.0, 40.0), (28.0, 40.0)]),
        };
        assert!(b.has_eye_landmarks(100, 100));
        b.landmarks = Some([(-5.0, 10.0), (30.0, 10.0), (20.0, 25.0), (12.0, 40.0), (28.0, 40.0)]);
        assert!(!b.has_eye_landmarks(100, 100));
        b.landmarks = None;
        assert!(!b.has_eye_landmarks(100, 100));
    }

    #[test]
    fn test_result_serializes_wire_names() {
        let r = VerificationResult::failure("no face found in probe image", 0.65);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["match"], false);
        assert_eq!(json["security_passed"], false);
        assert_eq!(json["error"], "no face found in probe image");
        assert!(json.get("warning").is_none());
        assert!((json["threshold"].as_f64().unwrap() - 65.0).abs() < 1e-3);
    }

    #[test]
    fn test_method_scores_serialize_only_present() {
        let s = MethodScores { embedding: None, structural: Some(0.5), feature: None, histogram: Some(0.25) };
        let json = serde_json::to_value(s).unwrap();
        assert_eq!(json["ssim"], 0.5);
        assert_eq!(json["histogram"], 0.25);
        assert!(json.get("facenet").is_none());
    }
}
