//! Which optional methods are available, decided once at start-up.
//!
//! Every model is optional. A model that fails to load is logged and left out;
//! the engine then scores with whatever remains.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cascade::{HaarCascade, RegionDetector};
use crate::detector::{LandmarkDetector, ScrfdDetector};
use crate::embedder::{FaceEmbedder, FaceNetEmbedder};
use crate::keypoints::{KeypointExtractor, OrbExtractor};
use crate::scorer::StructuralIndex;

pub const DEFAULT_DETECTOR_MODEL: &str = "det_10g.onnx";
pub const DEFAULT_EMBEDDER_MODEL: &str = "facenet_vggface2.onnx";
pub const DEFAULT_PRIMARY_CASCADE: &str = "haarcascade_frontalface_default.xml";
pub const DEFAULT_SECONDARY_CASCADE: &str = "haarcascade_frontalface_alt2.xml";
pub const DEFAULT_EYE_CASCADE: &str = "haarcascade_eye.xml";

/// Model file locations. Relative names resolve against `model_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPaths {
    pub model_dir: PathBuf,
    pub detector: String,
    pub embedder: String,
    pub primary_cascade: String,
    pub secondary_cascade: String,
    pub eye_cascade: String,
}

impl ModelPaths {
    pub fn in_dir(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            detector: DEFAULT_DETECTOR_MODEL.to_string(),
            embedder: DEFAULT_EMBEDDER_MODEL.to_string(),
            primary_cascade: DEFAULT_PRIMARY_CASCADE.to_string(),
            secondary_cascade: DEFAULT_SECONDARY_CASCADE.to_string(),
            eye_cascade: DEFAULT_EYE_CASCADE.to_string(),
        }
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.model_dir.join(path)
        }
    }
}

/// Switches for methods that need no model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodToggles {
    pub keypoints: bool,
    /// Off forces the `1 − MSE` structural fallback.
    pub ssim: bool,
}

impl Default for MethodToggles {
    fn default() -> Self {
        Self { keypoints: true, ssim: true }
    }
}

/// Loaded collaborators. `None` means the method is unavailable.
#[derive(Clone)]
pub struct Capabilities {
    pub deep_detector: Option<Arc<dyn LandmarkDetector>>,
    pub embedder: Option<Arc<dyn FaceEmbedder>>,
    pub primary_cascade: Option<Arc<dyn RegionDetector>>,
    pub secondary_cascade: Option<Arc<dyn RegionDetector>>,
    pub eye_detector: Option<Arc<dyn RegionDetector>>,
    pub keypoints: Option<Arc<dyn KeypointExtractor>>,
    pub structural: StructuralIndex,
}

/// Availability flags, as logged at start-up and printed by `facegate status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub deep_detector: bool,
    pub embedder: bool,
    pub primary_cascade: bool,
    pub secondary_cascade: bool,
    pub eye_detector: bool,
    pub keypoints: bool,
    pub ssim: bool,
}

impl Capabilities {
    /// No optional method at all; scoring falls back to SSIM and histograms.
    pub fn empty() -> Self {
        Self {
            deep_detector: None,
            embedder: None,
            primary_cascade: None,
            secondary_cascade: None,
            eye_detector: None,
            keypoints: None,
            structural: StructuralIndex::Ssim,
        }
    }

    /// Load every model named in `paths`; failures are logged and skipped.
    pub fn load(paths: &ModelPaths, toggles: &MethodToggles) -> Self {
        let deep_detector = optional("deep detector", ScrfdDetector::load(&paths.resolve(&paths.detector)))
            .map(|d| Arc::new(d) as Arc<dyn LandmarkDetector>);
        let embedder = optional("embedder", FaceNetEmbedder::load(&paths.resolve(&paths.embedder)))
            .map(|e| Arc::new(e) as Arc<dyn FaceEmbedder>);

        let cascade = |what: &str, name: &str| {
            optional(what, HaarCascade::load(&paths.resolve(name))).map(|c| Arc::new(c) as Arc<dyn RegionDetector>)
        };

        let caps = Self {
            deep_detector,
            embedder,
            primary_cascade: cascade("primary cascade", &paths.primary_cascade),
            secondary_cascade: cascade("secondary cascade", &paths.secondary_cascade),
            eye_detector: cascade("eye cascade", &paths.eye_cascade),
            keypoints: toggles
                .keypoints
                .then(|| Arc::new(OrbExtractor::default()) as Arc<dyn KeypointExtractor>),
            structural: if toggles.ssim { StructuralIndex::Ssim } else { StructuralIndex::Mse },
        };

        let report = caps.report();
        tracing::info!(
            deep_detector = report.deep_detector,
            embedder = report.embedder,
            primary_cascade = report.primary_cascade,
            secondary_cascade = report.secondary_cascade,
            eye_detector = report.eye_detector,
            keypoints = report.keypoints,
            ssim = report.ssim,
            "capabilities loaded"
        );
        if !report.deep_detector && !report.primary_cascade && !report.secondary_cascade {
            tracing::warn!(model_dir = %paths.model_dir.display(), "no face detector available; every verification will report no face");
        }
        caps
    }

    pub fn with_deep_detector(mut self, detector: Arc<dyn LandmarkDetector>) -> Self {
        self.deep_detector = Some(detector);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn FaceEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_primary_cascade(mut self, cascade: Arc<dyn RegionDetector>) -> Self {
        self.primary_cascade = Some(cascade);
        self
    }

    pub fn with_secondary_cascade(mut self, cascade: Arc<dyn RegionDetector>) -> Self {
        self.secondary_cascade = Some(cascade);
        self
    }

    pub fn with_eye_detector(mut self, detector: Arc<dyn RegionDetector>) -> Self {
        self.eye_detector = Some(detector);
        self
    }

    pub fn with_keypoints(mut self, extractor: Arc<dyn KeypointExtractor>) -> Self {
        self.keypoints = Some(extractor);
        self
    }

    pub fn with_structural(mut self, structural: StructuralIndex) -> Self {
        self.structural = structural;
        self
    }

    pub fn report(&self) -> CapabilityReport {
        CapabilityReport {
            deep_detector: self.deep_detector.is_some(),
            embedder: self.embedder.is_some(),
            primary_cascade: self.primary_cascade.is_some(),
            secondary_cascade: self.secondary_cascade.is_some(),
            eye_detector: self.eye_detector.is_some(),
            keypoints: self.keypoints.is_some(),
            ssim: self.structural == StructuralIndex::Ssim,
        }
    }
}

fn optional<T, E: std::fmt::Display>(what: &str, loaded: Result<T, E>) -> Option<T> {
    match loaded {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(method = what, error = %e, "optional method unavailable");
            None
        }
    }
}
