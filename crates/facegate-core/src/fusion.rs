//! Weighted fusion of per-method scores.
//!
//! The weight row is chosen from which metrics are present; absence is tracked
//! explicitly, so a real score of zero still counts as present.

use serde::Serialize;
use thiserror::Error;

use crate::types::{Method, MethodScores};

/// Multiplier applied when no eyes were found on the probe.
pub const NO_EYES_PENALTY: f32 = 0.5;

#[derive(Error, Debug, PartialEq)]
pub enum FusionError {
    #[error("no similarity method produced a score")]
    NoMetrics,
}

/// Column weights of one fusion-table row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightRow {
    pub embedding: f32,
    pub structural: f32,
    pub feature: f32,
    pub histogram: f32,
}

impl WeightRow {
    const fn new(embedding: f32, structural: f32, feature: f32, histogram: f32) -> Self {
        Self { embedding, structural, feature, histogram }
    }

    pub fn weight(&self, method: Method) -> f32 {
        match method {
            Method::Embedding => self.embedding,
            Method::Structural => self.structural,
            Method::Feature => self.feature,
            Method::Histogram => self.histogram,
        }
    }

    /// Row for the given presence of embedding, feature and histogram scores.
    pub fn select(scores: &MethodScores) -> WeightRow {
        let embedding = scores.is_present(Method::Embedding);
        let feature = scores.is_present(Method::Feature);
        let histogram = scores.is_present(Method::Histogram);
        match (embedding, feature, histogram) {
            (true, false, false) => WeightRow::new(0.7, 0.3, 0.0, 0.0),
            (true, false, true) => WeightRow::new(0.6, 0.3, 0.0, 0.1),
            (true, true, false) => WeightRow::new(0.6, 0.2, 0.2, 0.0),
            (true, true, true) => WeightRow::new(0.5, 0.2, 0.2, 0.1),
            (false, false, true) => WeightRow::new(0.0, 0.8, 0.0, 0.2),
            (false, true, false) => WeightRow::new(0.0, 0.6, 0.4, 0.0),
            (false, false, false) => WeightRow::new(0.0, 1.0, 0.0, 0.0),
            (false, true, true) => WeightRow::new(0.0, 0.45, 0.40, 0.15),
        }
    }
}

/// Fused similarity with the bookkeeping needed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Fused {
    /// Final similarity in [0, 1], after the eye check.
    pub similarity: f32,
    /// Weighted sum before the eye check, clamped to [0, 1].
    pub weighted: f32,
    pub row: WeightRow,
    /// Method with the largest weighted contribution.
    pub dominant: Method,
    pub has_eyes_check: bool,
}

/// Combine present scores with the matching weight row, halving the result
/// when the probe showed no eyes.
pub fn fuse(scores: &MethodScores, has_eyes_check: bool) -> Result<Fused, FusionError> {
    if !scores.any_present() {
        return Err(FusionError::NoMetrics);
    }

    let row = WeightRow::select(scores);
    let contributions = Method::ALL.map(|m| (m, row.weight(m) * scores.get(m).unwrap_or(0.0)));

    let weighted = contributions
        .iter()
        .map(|(_, c)| c)
        .sum::<f32>()
        .clamp(0.0, 1.0);
    let dominant = contributions
        .iter()
        .fold(contributions[0], |best, c| if c.1 > best.1 { *c } else { best })
        .0;

    let similarity = if has_eyes_check { weighted } else { weighted * NO_EYES_PENALTY };

    tracing::debug!(
        ?row,
        weighted,
        similarity,
        dominant = dominant.name(),
        has_eyes_check,
        "scores fused"
    );

    Ok(Fused { similarity, weighted, row, dominant, has_eyes_check })
}
