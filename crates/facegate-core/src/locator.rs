//! Face localisation as an ordered chain of detection stages.
//!
//! The chain runs deep detector → primary cascade → secondary cascade →
//! edge-enhanced primary cascade and stops at the first stage that returns any
//! candidate. The largest candidate wins and is widened for context.

use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};

use crate::cascade::{RegionDetector, ScanParams};
use crate::detector::LandmarkDetector;
use crate::image_ops::{equalize, laplacian};
use crate::types::{BoundingBox, Rect};

/// Deep detections at or below this confidence are ignored.
pub const DEEP_MIN_CONFIDENCE: f32 = 0.90;
/// Fraction of the box size added on every side before cropping.
pub const CONTEXT_EXPANSION: f32 = 0.2;
/// Longest side the detection stages work at by default.
pub const DEFAULT_MAX_DETECTION_SIDE: u32 = 1280;

pub const PRIMARY_STANDARD: ScanParams = ScanParams::new(1.1, 5, 60);
pub const PRIMARY_LENIENT: ScanParams = ScanParams::new(1.2, 3, 40);
pub const SECONDARY_STANDARD: ScanParams = ScanParams::new(1.1, 4, 60);
pub const SECONDARY_LENIENT: ScanParams = ScanParams::new(1.3, 2, 30);
pub const EDGE_ENHANCED: ScanParams = ScanParams::new(1.1, 3, 40);

/// Image as seen by the detection stages, possibly downscaled from the source.
pub struct WorkingFrame {
    pub rgb: RgbImage,
    pub gray: GrayImage,
    /// Working size / source size.
    pub scale: f32,
}

impl WorkingFrame {
    pub fn new(image: &DynamicImage, max_side: u32) -> Self {
        let (w, h) = (image.width(), image.height());
        let longest = w.max(h);
        if max_side == 0 || longest <= max_side {
            return Self { rgb: image.to_rgb8(), gray: image.to_luma8(), scale: 1.0 };
        }

        let scale = max_side as f32 / longest as f32;
        let nw = ((w as f32 * scale).round() as u32).max(1);
        let nh = ((h as f32 * scale).round() as u32).max(1);
        let resized = image.resize_exact(nw, nh, FilterType::Triangle);
        Self { rgb: resized.to_rgb8(), gray: resized.to_luma8(), scale }
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }
}

/// A face candidate in working-frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub rect: Rect,
    /// Both eye landmarks were reported inside the frame.
    pub landmark_eyes: bool,
}

impl Candidate {
    pub fn from_rect(rect: Rect) -> Self {
        Self { rect, landmark_eyes: false }
    }
}

/// One rung of the detection ladder.
pub trait DetectionStage: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, frame: &WorkingFrame) -> Vec<Candidate>;
}

/// Deep detector stage; keeps confident boxes and reports landmark eyes.
pub struct DeepStage {
    detector: Arc<dyn LandmarkDetector>,
    min_confidence: f32,
}

impl DeepStage {
    pub fn new(detector: Arc<dyn LandmarkDetector>) -> Self {
        Self { detector, min_confidence: DEEP_MIN_CONFIDENCE }
    }

    fn to_candidate(&self, det: &BoundingBox, frame: &WorkingFrame) -> Option<Candidate> {
        if det.confidence <= self.min_confidence {
            return None;
        }
        let rect = det.to_rect(frame.width(), frame.height())?;
        Some(Candidate { rect, landmark_eyes: det.has_eye_landmarks(frame.width(), frame.height()) })
    }
}

impl DetectionStage for DeepStage {
    fn name(&self) -> &str {
        "deep-detector"
    }

    fn detect(&self, frame: &WorkingFrame) -> Vec<Candidate> {
        match self.detector.detect(&frame.rgb) {
            Ok(dets) => dets.iter().filter_map(|d| self.to_candidate(d, frame)).collect(),
            Err(e) => {
                tracing::warn!(detector = self.detector.name(), error = %e, "deep detector failed; falling back to cascades");
                Vec::new()
            }
        }
    }
}

/// Cascade stage: tries each parameter set in order until one finds something.
pub struct CascadeStage {
    name: String,
    cascade: Arc<dyn RegionDetector>,
    attempts: Vec<ScanParams>,
}

impl CascadeStage {
    pub fn new(name: impl Into<String>, cascade: Arc<dyn RegionDetector>, attempts: Vec<ScanParams>) -> Self {
        Self { name: name.into(), cascade, attempts }
    }
}

impl DetectionStage for CascadeStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, frame: &WorkingFrame) -> Vec<Candidate> {
        for params in &self.attempts {
            let rects = self.cascade.detect(&frame.gray, params);
            if !rects.is_empty() {
                return rects.into_iter().map(Candidate::from_rect).collect();
            }
            tracing::debug!(stage = %self.name, ?params, "no candidates");
        }
        Vec::new()
    }
}

/// Laplacian + equalisation, then the primary cascade once more.
pub struct EdgeEnhancedStage {
    cascade: Arc<dyn RegionDetector>,
    params: ScanParams,
}

impl EdgeEnhancedStage {
    pub fn new(cascade: Arc<dyn RegionDetector>) -> Self {
        Self { cascade, params: EDGE_ENHANCED }
    }
}

impl DetectionStage for EdgeEnhancedStage {
    fn name(&self) -> &str {
        "edge-enhanced"
    }

    fn detect(&self, frame: &WorkingFrame) -> Vec<Candidate> {
        let edges = equalize(&laplacian(&frame.gray));
        self.cascade
            .detect(&edges, &self.params)
            .into_iter()
            .map(Candidate::from_rect)
            .collect()
    }
}

/// The chosen face, in source-image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedFace {
    /// Selected detection box.
    pub face: Rect,
    /// `face` widened by [`CONTEXT_EXPANSION`] and clamped to the image; this is what gets cropped.
    pub context: Rect,
    pub landmark_eyes: bool,
    /// Name of the stage that produced the detection.
    pub stage: String,
}

pub struct FaceLocator {
    stages: Vec<Box<dyn DetectionStage>>,
    max_detection_side: u32,
}

impl FaceLocator {
    pub fn new(stages: Vec<Box<dyn DetectionStage>>, max_detection_side: u32) -> Self {
        Self { stages, max_detection_side }
    }

    /// Standard ladder over whichever detectors are available.
    pub fn ladder(
        deep: Option<Arc<dyn LandmarkDetector>>,
        primary: Option<Arc<dyn RegionDetector>>,
        secondary: Option<Arc<dyn RegionDetector>>,
        max_detection_side: u32,
    ) -> Self {
        let mut stages: Vec<Box<dyn DetectionStage>> = Vec::new();
        if let Some(d) = deep {
            stages.push(Box::new(DeepStage::new(d)));
        }
        if let Some(p) = &primary {
            stages.push(Box::new(CascadeStage::new(
                "primary-cascade",
                p.clone(),
                vec![PRIMARY_STANDARD, PRIMARY_LENIENT],
            )));
        }
        if let Some(s) = secondary {
            stages.push(Box::new(CascadeStage::new(
                "secondary-cascade",
                s,
                vec![SECONDARY_STANDARD, SECONDARY_LENIENT],
            )));
        }
        if let Some(p) = primary {
            stages.push(Box::new(EdgeEnhancedStage::new(p)));
        }
        Self::new(stages, max_detection_side)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Largest face found by the first productive stage, or `None`.
    pub fn locate(&self, image: &DynamicImage) -> Option<LocatedFace> {
        let (src_w, src_h) = (image.width(), image.height());
        if src_w == 0 || src_h == 0 {
            return None;
        }
        let frame = WorkingFrame::new(image, self.max_detection_side);

        for stage in &self.stages {
            let candidates = stage.detect(&frame);
            tracing::debug!(stage = stage.name(), candidates = candidates.len(), "detection stage finished");
            let Some(best) = largest(&candidates) else {
                continue;
            };

            let face = best.rect.unscale(frame.scale).clamp_to(src_w, src_h)?;
            let context = face.expand(CONTEXT_EXPANSION, src_w, src_h);
            tracing::info!(
                stage = stage.name(),
                candidates = candidates.len(),
                x = face.x, y = face.y, width = face.width, height = face.height,
                "face located"
            );
            return Some(LocatedFace {
                face,
                context,
                landmark_eyes: best.landmark_eyes,
                stage: stage.name().to_string(),
            });
        }

        tracing::info!(stages = self.stages.len(), "no face found");
        None
    }
}

/// Largest-area candidate; the earliest wins ties.
fn largest(candidates: &[Candidate]) -> Option<Candidate> {
    candidates.iter().fold(None, |best: Option<Candidate>, c| match best {
        Some(b) if b.rect.area() >= c.rect.area() => Some(b),
        _ => Some(*c),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::detector::DetectorError;

    struct FixedStage {
        name: &'static str,
        candidates: Vec<Candidate>,
        seen: Mutex<Vec<(u32, u32)>>,
    }

    impl FixedStage {
        fn boxed(name: &'static str, rects: &[Rect]) -> Box<Self> {
            Box::new(Self {
                name,
                candidates: rects.iter().copied().map(Candidate::from_rect).collect(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl DetectionStage for FixedStage {
        fn name(&self) -> &str {
            self.name
        }

        fn detect(&self, frame: &WorkingFrame) -> Vec<Candidate> {
            self.seen.lock().unwrap().push((frame.width(), frame.height()));
            self.candidates.clone()
        }
    }

    /// Returns a box only for one specific `min_neighbors` value.
    struct PickyCascade {
        accepts: u32,
    }

    impl RegionDetector for PickyCascade {
        fn detect(&self, _gray: &GrayImage, params: &ScanParams) -> Vec<Rect> {
            if params.min_neighbors == self.accepts {
                vec![Rect::new(10, 10, 40, 40)]
            } else {
                vec![]
            }
        }

        fn name(&self) -> &str {
            "picky"
        }
    }

    struct FixedDeep(Vec<BoundingBox>);

    impl LandmarkDetector for FixedDeep {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn image(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(w, h))
    }

    #[test]
    fn test_selects_largest_and_expands() {
        let locator = FaceLocator::new(
            vec![FixedStage::boxed("a", &[Rect::new(10, 10, 20, 20), Rect::new(100, 100, 50, 50), Rect::new(0, 0, 30, 30)])],
            DEFAULT_MAX_DETECTION_SIDE,
        );
        let located = locator.locate(&image(640, 480)).unwrap();
        assert_eq!(located.face, Rect::new(100, 100, 50, 50));
        assert_eq!(located.context, Rect::new(90, 90, 70, 70));
        assert_eq!(located.stage, "a");
    }

    #[test]
    fn test_ladder_stops_at_first_productive_stage() {
        let locator = FaceLocator::new(
            vec![
                FixedStage::boxed("empty", &[]),
                FixedStage::boxed("second", &[Rect::new(5, 5, 10, 10)]),
                FixedStage::boxed("third", &[Rect::new(0, 0, 200, 200)]),
            ],
            DEFAULT_MAX_DETECTION_SIDE,
        );
        let located = locator.locate(&image(300, 300)).unwrap();
        assert_eq!(located.stage, "second");
        assert_eq!(located.face, Rect::new(5, 5, 10, 10));
    }

    #[test]
    fn test_no_stage_finds_anything() {
        let locator = FaceLocator::new(vec![FixedStage::boxed("empty", &[])], DEFAULT_MAX_DETECTION_SIDE);
        assert!(locator.locate(&image(100, 100)).is_none());
        assert!(FaceLocator::new(vec![], 1280).locate(&image(100, 100)).is_none());
    }

    #[test]
    fn test_large_images_are_detected_at_working_resolution() {
        let stage = FixedStage::boxed("a", &[Rect::new(100, 50, 200, 200)]);
        let locator = FaceLocator::new(vec![stage], 1000);
        let located = locator.locate(&image(2000, 1000)).unwrap();
        // Stage saw a half-size frame; result is in source coordinates.
        assert_eq!(located.face, Rect::new(200, 100, 400, 400));
    }

    #[test]
    fn test_cascade_stage_falls_back_to_lenient_params() {
        let stage = CascadeStage::new(
            "primary-cascade",
            Arc::new(PickyCascade { accepts: PRIMARY_LENIENT.min_neighbors }),
            vec![PRIMARY_STANDARD, PRIMARY_LENIENT],
        );
        let frame = WorkingFrame::new(&image(100, 100), 1280);
        assert_eq!(stage.detect(&frame).len(), 1);

        let strict_only = CascadeStage::new("p", Arc::new(PickyCascade { accepts: 99 }), vec![PRIMARY_STANDARD]);
        assert!(strict_only.detect(&frame).is_empty());
    }

    #[test]
    fn test_deep_stage_filters_confidence_and_reads_landmarks() {
        let eyes = Some([(30.0, 40.0), (60.0, 40.0), (45.0, 55.0), (35.0, 70.0), (55.0, 70.0)]);
        let deep = FixedDeep(vec![
            BoundingBox { x: 0.0, y: 0.0, width: 150.0, height: 150.0, confidence: 0.90, landmarks: None },
            BoundingBox { x: 20.0, y: 20.0, width: 60.0, height: 60.0, confidence: 0.97, landmarks: eyes },
        ]);
        let frame = WorkingFrame::new(&image(200, 200), 1280);
        let found = DeepStage::new(Arc::new(deep)).detect(&frame);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rect, Rect::new(20, 20, 60, 60));
        assert!(found[0].landmark_eyes);
    }

    #[test]
    fn test_ladder_composition() {
        let p: Arc<dyn RegionDetector> = Arc::new(PickyCascade { accepts: 0 });
        let locator = FaceLocator::ladder(None, Some(p.clone()), Some(p), 1280);
        assert_eq!(locator.stage_names(), vec!["primary-cascade", "secondary-cascade", "edge-enhanced"]);

        let s: Arc<dyn RegionDetector> = Arc::new(PickyCascade { accepts: 0 });
        let no_primary = FaceLocator::ladder(None, None, Some(s), 1280);
        assert_eq!(no_primary.stage_names(), vec!["secondary-cascade"]);
    }

    #[test]
    fn test_largest_tie_keeps_first() {
        let a = Candidate::from_rect(Rect::new(0, 0, 10, 10));
        let b = Candidate::from_rect(Rect::new(50, 50, 10, 10));
        assert_eq!(largest(&[a, b]), Some(a));
        assert_eq!(largest(&[]), None);
    }
}
