//! Turns one image into one [`FaceRecord`].

use std::sync::Arc;

use image::DynamicImage;

use crate::cascade::{RegionDetector, ScanParams};
use crate::embedder::FaceEmbedder;
use crate::image_ops::{crop, crop_gray, equalize, gaussian_blur, resize_gray, to_unit_plane};
use crate::keypoints::KeypointExtractor;
use crate::locator::FaceLocator;
use crate::preprocess::ImagePreprocessor;
use crate::types::{FaceRecord, NORMALIZED_FACE_SIZE};

pub struct FeatureExtractor {
    preprocessor: ImagePreprocessor,
    locator: FaceLocator,
    eye_detector: Option<Arc<dyn RegionDetector>>,
    keypoints: Option<Arc<dyn KeypointExtractor>>,
    embedder: Option<Arc<dyn FaceEmbedder>>,
}

impl FeatureExtractor {
    pub fn new(
        locator: FaceLocator,
        eye_detector: Option<Arc<dyn RegionDetector>>,
        keypoints: Option<Arc<dyn KeypointExtractor>>,
        embedder: Option<Arc<dyn FaceEmbedder>>,
    ) -> Self {
        Self {
            preprocessor: ImagePreprocessor,
            locator,
            eye_detector,
            keypoints,
            embedder,
        }
    }

    pub fn locator(&self) -> &FaceLocator {
        &self.locator
    }

    /// Enhance, locate, crop and describe the largest face. `None` when no face is found.
    pub fn extract(&self, image: &DynamicImage) -> Option<FaceRecord> {
        let enhanced = self.preprocessor.enhance(image);
        let located = self.locator.locate(&enhanced)?;

        let gray = enhanced.to_luma8();
        let gray_crop = crop_gray(&gray, located.context)?;
        let color_crop = crop(&enhanced, located.context)?;

        let has_eyes = located.landmark_eyes || self.eyes_visible(&gray_crop);

        let face = gaussian_blur(&equalize(&gray_crop), 3);

        let (keypoints, descriptors) = match &self.keypoints {
            Some(extractor) => extractor.detect_and_compute(&face),
            None => (Vec::new(), Vec::new()),
        };

        let normalized = equalize(&resize_gray(&face, NORMALIZED_FACE_SIZE, NORMALIZED_FACE_SIZE));
        let color_face = self.preprocessor.enhance(&color_crop);

        let embedding = self.embedder.as_ref().and_then(|embedder| match embedder.embed(&color_face) {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(embedder = embedder.name(), error = %e, "embedding unavailable for this face");
                None
            }
        });

        tracing::debug!(
            stage = %located.stage,
            has_eyes,
            keypoints = keypoints.len(),
            embedding = embedding.is_some(),
            "face record extracted"
        );

        Some(FaceRecord {
            normalized_face: to_unit_plane(&normalized),
            color_face,
            bounding_box: located.face,
            keypoints,
            descriptors,
            embedding,
            has_eyes,
        })
    }

    /// At least one eye in the crop. Without an eye detector the check fails closed.
    fn eyes_visible(&self, gray_crop: &image::GrayImage) -> bool {
        match &self.eye_detector {
            Some(detector) => !detector.detect(gray_crop, &ScanParams::default()).is_empty(),
            None => {
                tracing::debug!("no eye detector loaded; treating face as eyes-not-found");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};

    use crate::embedder::EmbedderError;
    use crate::keypoints::OrbExtractor;
    use crate::locator::{Candidate, DetectionStage, WorkingFrame};
    use crate::types::{Embedding, Rect};

    struct CentreStage;

    impl DetectionStage for CentreStage {
        fn name(&self) -> &str {
            "centre"
        }

        fn detect(&self, frame: &WorkingFrame) -> Vec<Candidate> {
            let (w, h) = (frame.width(), frame.height());
            vec![Candidate::from_rect(Rect::new(w / 4, h / 4, w / 2, h / 2))]
        }
    }

    struct AlwaysEyes(bool);

    impl RegionDetector for AlwaysEyes {
        fn detect(&self, _gray: &GrayImage, _params: &ScanParams) -> Vec<Rect> {
            if self.0 {
                vec![Rect::new(1, 1, 5, 5)]
            } else {
                vec![]
            }
        }

        fn name(&self) -> &str {
            "eyes"
        }
    }

    struct MeanColour;

    impl FaceEmbedder for MeanColour {
        fn embed(&self, face: &DynamicImage) -> Result<Embedding, EmbedderError> {
            let rgb = face.to_rgb8();
            let n = (rgb.width() * rgb.height()) as f32;
            let mut values = vec![0f32; 3];
            for px in rgb.pixels() {
                for c in 0..3 {
                    values[c] += px.0[c] as f32 / n;
                }
            }
            Ok(Embedding { values, model_version: None })
        }

        fn name(&self) -> &str {
            "mean-colour"
        }
    }

    struct Broken;

    impl FaceEmbedder for Broken {
        fn embed(&self, _face: &DynamicImage) -> Result<Embedding, EmbedderError> {
            Err(EmbedderError::InferenceFailed("boom".into()))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    fn textured() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(160, 160, |x, y| {
            image::Rgb([((x * 7 + y * 3) % 256) as u8, ((x * y) % 256) as u8, ((x + 2 * y) % 256) as u8])
        }))
    }

    fn locator() -> FaceLocator {
        FaceLocator::new(vec![Box::new(CentreStage)], 1280)
    }

    #[test]
    fn test_record_shapes() {
        let extractor = FeatureExtractor::new(
            locator(),
            Some(Arc::new(AlwaysEyes(true))),
            Some(Arc::new(OrbExtractor::default())),
            Some(Arc::new(MeanColour)),
        );
        let record = extractor.extract(&textured()).unwrap();
        assert_eq!(record.normalized_face.dim(), (200, 200));
        assert!(record.normalized_face.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(record.bounding_box, Rect::new(40, 40, 80, 80));
        // Context crop is 20% wider on every side.
        assert_eq!((record.color_face.width(), record.color_face.height()), (112, 112));
        assert_eq!(record.keypoints.len(), record.descriptors.len());
        assert!(record.has_eyes);
        assert_eq!(record.embedding.unwrap().values.len(), 3);
    }

    #[test]
    fn test_missing_eye_detector_fails_closed() {
        let extractor = FeatureExtractor::new(locator(), None, None, None);
        let record = extractor.extract(&textured()).unwrap();
        assert!(!record.has_eyes);
        assert!(record.keypoints.is_empty() && record.descriptors.is_empty());
        assert!(record.embedding.is_none());

        let blind = FeatureExtractor::new(locator(), Some(Arc::new(AlwaysEyes(false))), None, None);
        assert!(!blind.extract(&textured()).unwrap().has_eyes);
    }

    #[test]
    fn test_embedder_failure_leaves_embedding_absent() {
        let extractor = FeatureExtractor::new(locator(), None, None, Some(Arc::new(Broken)));
        assert!(extractor.extract(&textured()).unwrap().embedding.is_none());
    }

    #[test]
    fn test_no_face_no_record() {
        let extractor = FeatureExtractor::new(FaceLocator::new(vec![], 1280), None, None, None);
        assert!(extractor.extract(&textured()).is_none());
    }
}
