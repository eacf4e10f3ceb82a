//! facegate-core: 1:1 face verification engine.
//!
//! Finds the largest face in each of two images, compares them with every
//! available method (deep embeddings, structural similarity, ORB keypoints,
//! colour histograms), fuses the scores and applies a threshold plus an eye
//! check. Deep models run through ONNX Runtime; everything else is native.

pub mod capabilities;
pub mod cascade;
pub mod decision;
pub mod detector;
pub mod embedder;
pub mod engine;
pub mod extractor;
pub mod fusion;
pub mod histogram;
pub mod image_ops;
pub mod keypoints;
pub mod locator;
pub mod preprocess;
pub mod scorer;
pub mod service;
pub mod ssim;
pub mod types;

use std::path::PathBuf;

pub use capabilities::{Capabilities, CapabilityReport, MethodToggles, ModelPaths};
pub use engine::{EngineError, EngineOptions, ImageRole, ImageSource, VerificationEngine};
pub use service::{spawn_workers, EngineHandle, ServiceError};
pub use types::{
    BoundingBox, Embedding, FaceRecord, Method, MethodScores, Rect, SimilarityScoreSet, VerificationResult,
    DEFAULT_THRESHOLD,
};

/// `$XDG_DATA_HOME/facegate/models`, falling back to `~/.local/share/facegate/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
        .join("models")
}
