use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use facegate_core::capabilities::{
    DEFAULT_DETECTOR_MODEL, DEFAULT_EMBEDDER_MODEL, DEFAULT_EYE_CASCADE, DEFAULT_PRIMARY_CASCADE,
    DEFAULT_SECONDARY_CASCADE,
};
use facegate_core::locator::DEFAULT_MAX_DETECTION_SIDE;
use facegate_core::{EngineOptions, MethodToggles, ModelPaths, DEFAULT_THRESHOLD};
use serde::{Deserialize, Serialize};

/// Engine configuration: optional TOML file, then `FACEGATE_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing model files.
    pub model_dir: PathBuf,
    /// SCRFD detector model, relative to `model_dir` unless absolute.
    pub detector_model: String,
    /// FaceNet embedding model.
    pub embedder_model: String,
    pub primary_cascade: String,
    pub secondary_cascade: String,
    pub eye_cascade: String,
    /// Fused-similarity threshold for a positive match.
    pub threshold: f32,
    /// Worker threads used by `batch`.
    pub workers: usize,
    pub keypoints_enabled: bool,
    /// Off forces the MSE structural fallback.
    pub ssim_enabled: bool,
    /// Longest side the detection ladder works at.
    pub max_detection_side: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: facegate_core::default_model_dir(),
            detector_model: DEFAULT_DETECTOR_MODEL.to_string(),
            embedder_model: DEFAULT_EMBEDDER_MODEL.to_string(),
            primary_cascade: DEFAULT_PRIMARY_CASCADE.to_string(),
            secondary_cascade: DEFAULT_SECONDARY_CASCADE.to_string(),
            eye_cascade: DEFAULT_EYE_CASCADE.to_string(),
            threshold: DEFAULT_THRESHOLD,
            workers: 2,
            keypoints_enabled: true,
            ssim_enabled: true,
            max_detection_side: DEFAULT_MAX_DETECTION_SIDE,
        }
    }
}

impl Config {
    /// Read `path` if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(base.with_overrides(|key| std::env::var(key).ok()))
    }

    /// Apply `FACEGATE_*` overrides looked up through `var`.
    pub fn with_overrides(self, var: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, current: String| var(key).unwrap_or(current);
        Self {
            model_dir: var("FACEGATE_MODEL_DIR").map(PathBuf::from).unwrap_or(self.model_dir),
            detector_model: string("FACEGATE_DETECTOR_MODEL", self.detector_model),
            embedder_model: string("FACEGATE_EMBEDDER_MODEL", self.embedder_model),
            primary_cascade: string("FACEGATE_PRIMARY_CASCADE", self.primary_cascade),
            secondary_cascade: string("FACEGATE_SECONDARY_CASCADE", self.secondary_cascade),
            eye_cascade: string("FACEGATE_EYE_CASCADE", self.eye_cascade),
            threshold: env_f32(&var, "FACEGATE_THRESHOLD", self.threshold),
            workers: env_usize(&var, "FACEGATE_WORKERS", self.workers),
            keypoints_enabled: env_bool(&var, "FACEGATE_KEYPOINTS_ENABLED", self.keypoints_enabled),
            ssim_enabled: env_bool(&var, "FACEGATE_SSIM_ENABLED", self.ssim_enabled),
            max_detection_side: env_u32(&var, "FACEGATE_MAX_DETECTION_SIDE", self.max_detection_side),
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths {
            model_dir: self.model_dir.clone(),
            detector: self.detector_model.clone(),
            embedder: self.embedder_model.clone(),
            primary_cascade: self.primary_cascade.clone(),
            secondary_cascade: self.secondary_cascade.clone(),
            eye_cascade: self.eye_cascade.clone(),
        }
    }

    pub fn toggles(&self) -> MethodToggles {
        MethodToggles { keypoints: self.keypoints_enabled, ssim: self.ssim_enabled }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_detection_side: self.max_detection_side,
            default_threshold: self.threshold,
        }
    }
}

fn env_f32(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(var: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(var: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// `0`, `false`, `off` and `no` switch a flag off; anything else switches it on.
fn env_bool(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    var(key)
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off" | "no"))
        .unwrap_or(default)
}
