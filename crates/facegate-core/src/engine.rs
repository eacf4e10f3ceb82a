//! The verification engine: image in, decision out.
//!
//! `verify` and `verify_enrolled` never fail. Every error, including a panic
//! inside a collaborator, becomes a non-matching [`VerificationResult`] with
//! `error` set.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use image::DynamicImage;
use thiserror::Error;

use crate::capabilities::{Capabilities, CapabilityReport};
use crate::decision::decide;
use crate::extractor::FeatureExtractor;
use crate::fusion::{fuse, FusionError};
use crate::locator::{FaceLocator, DEFAULT_MAX_DETECTION_SIDE};
use crate::scorer::SimilarityScorer;
use crate::types::{FaceRecord, SimilarityScoreSet, VerificationResult, DEFAULT_THRESHOLD};

/// Which side of the comparison an image is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    Reference,
    Probe,
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRole::Reference => write!(f, "reference"),
            ImageRole::Probe => write!(f, "probe"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to read {role} image: {source}")]
    Io {
        role: ImageRole,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {role} image: {source}")]
    ImageDecode {
        role: ImageRole,
        #[source]
        source: image::ImageError,
    },
    #[error("No face found in {role} image")]
    NoFace { role: ImageRole },
    #[error("no usable reference image")]
    NoUsableReference,
    #[error("threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f32),
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error("Error during verification: {0}")]
    Internal(String),
}

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl ImageSource {
    pub fn decode(&self, role: ImageRole) -> Result<DynamicImage, EngineError> {
        match self {
            ImageSource::Path(path) => {
                let bytes = std::fs::read(path).map_err(|source| EngineError::Io { role, source })?;
                image::load_from_memory(&bytes).map_err(|source| EngineError::ImageDecode { role, source })
            }
            ImageSource::Bytes(bytes) => {
                image::load_from_memory(bytes).map_err(|source| EngineError::ImageDecode { role, source })
            }
        }
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        ImageSource::Path(path.to_path_buf())
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Bytes(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOptions {
    /// Longest side the detection ladder works at; larger inputs are downscaled for detection only.
    pub max_detection_side: u32,
    pub default_threshold: f32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_detection_side: DEFAULT_MAX_DETECTION_SIDE,
            default_threshold: DEFAULT_THRESHOLD,
        }
    }
}

pub struct VerificationEngine {
    extractor: FeatureExtractor,
    scorer: SimilarityScorer,
    report: CapabilityReport,
    options: EngineOptions,
}

impl VerificationEngine {
    pub fn new(capabilities: Capabilities, options: EngineOptions) -> Self {
        let locator = FaceLocator::ladder(
            capabilities.deep_detector.clone(),
            capabilities.primary_cascade.clone(),
            capabilities.secondary_cascade.clone(),
            options.max_detection_side,
        );
        tracing::info!(stages = ?locator.stage_names(), "detection ladder ready");
        Self::with_locator(locator, capabilities, options)
    }

    /// Engine with a hand-built locator, for callers that assemble their own ladder.
    pub fn with_locator(locator: FaceLocator, capabilities: Capabilities, options: EngineOptions) -> Self {
        let report = capabilities.report();
        let extractor = FeatureExtractor::new(
            locator,
            capabilities.eye_detector,
            capabilities.keypoints,
            capabilities.embedder,
        );
        Self {
            extractor,
            scorer: SimilarityScorer::new(capabilities.structural),
            report,
            options,
        }
    }

    pub fn capabilities(&self) -> &CapabilityReport {
        &self.report
    }

    pub fn default_threshold(&self) -> f32 {
        self.options.default_threshold
    }

    /// One face record for the largest face, or `None`.
    pub fn extract(&self, image: &DynamicImage) -> Option<FaceRecord> {
        self.extractor.extract(image)
    }

    /// Score and fuse two records; the eye check comes from `unknown`.
    pub fn compare(&self, known: &FaceRecord, unknown: &FaceRecord) -> Result<SimilarityScoreSet, EngineError> {
        let scores = self.scorer.score(known, unknown);
        let fused = fuse(&scores, unknown.has_eyes)?;
        Ok(SimilarityScoreSet {
            scores,
            fused: fused.similarity,
            has_eyes_check: fused.has_eyes_check,
        })
    }

    /// Compare a probe image against one reference image.
    pub fn verify(&self, reference: &ImageSource, probe: &ImageSource, threshold: f32) -> VerificationResult {
        guarded(threshold, || {
            check_threshold(threshold)?;
            let known = self.record_for(reference, ImageRole::Reference)?;
            let unknown = self.record_for(probe, ImageRole::Probe)?;
            self.decide_pair(&known, &unknown, threshold)
        })
    }

    /// Compare a probe against several references: best similarity wins, first match stops the search.
    pub fn verify_enrolled(&self, references: &[ImageSource], probe: &ImageSource, threshold: f32) -> VerificationResult {
        guarded(threshold, || {
            check_threshold(threshold)?;
            let unknown = self.record_for(probe, ImageRole::Probe)?;

            let mut best: Option<VerificationResult> = None;
            for (index, reference) in references.iter().enumerate() {
                let known = match self.record_for(reference, ImageRole::Reference) {
                    Ok(k) => k,
                    Err(e) => {
                        tracing::warn!(index, error = %e, "skipping reference");
                        continue;
                    }
                };
                let result = self.decide_pair(&known, &unknown, threshold)?;
                let matched = result.matched;
                if best.as_ref().map_or(true, |b| result.similarity > b.similarity) {
                    best = Some(result);
                }
                if matched {
                    tracing::debug!(index, "reference matched; stopping");
                    break;
                }
            }
            best.ok_or(EngineError::NoUsableReference)
        })
    }

    fn record_for(&self, source: &ImageSource, role: ImageRole) -> Result<FaceRecord, EngineError> {
        let image = source.decode(role)?;
        self.extract(&image).ok_or(EngineError::NoFace { role })
    }

    fn decide_pair(&self, known: &FaceRecord, unknown: &FaceRecord, threshold: f32) -> Result<VerificationResult, EngineError> {
        let set = self.compare(known, unknown)?;
        let mut result = decide(set.fused, unknown.has_eyes, threshold);
        result.scores = Some(set);
        Ok(result)
    }
}

fn check_threshold(threshold: f32) -> Result<(), EngineError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(EngineError::InvalidThreshold(threshold))
    }
}

/// Run `f`, turning errors and panics into failure results.
fn guarded(threshold: f32, f: impl FnOnce() -> Result<VerificationResult, EngineError>) -> VerificationResult {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            match &e {
                EngineError::NoFace { .. } | EngineError::NoUsableReference => tracing::info!(error = %e, "verification rejected"),
                _ => tracing::error!(error = %e, "verification failed"),
            }
            VerificationResult::failure(e.to_string(), threshold)
        }
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(panic = %msg, "panic during verification");
            VerificationResult::failure(EngineError::Internal(msg).to_string(), threshold)
        }
    }
}
