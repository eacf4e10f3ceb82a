//! Pairwise per-method similarity between two face records.
//!
//! Each metric is independent and yields `None` when it cannot run, so one
//! failing method never hides the others.

use crate::histogram::histogram_score;
use crate::keypoints::{knn_match, ratio_test, MatchError};
use crate::ssim::{mse_score, structural_score};
use crate::types::{FaceRecord, MethodScores};

/// Lowe ratio for k-NN descriptor matching.
pub const RATIO_TEST: f32 = 0.75;

/// Feature score above which strong agreement boosts the scores.
pub const BOOST_FEATURE_MIN: f32 = 0.65;
/// Structural score above which strong agreement boosts the scores.
pub const BOOST_STRUCTURAL_MIN: f32 = 0.5;
/// Histogram score above which the histogram is boosted along with the rest.
pub const BOOST_HISTOGRAM_MIN: f32 = 0.4;
pub const FEATURE_BOOST: f32 = 1.3;
pub const STRUCTURAL_BOOST: f32 = 1.25;
pub const HISTOGRAM_BOOST: f32 = 1.2;

/// How the structural metric is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralIndex {
    /// Best-of-three SSIM.
    Ssim,
    /// `1 − MSE`, used when SSIM is switched off.
    Mse,
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityScorer {
    structural: StructuralIndex,
}

impl SimilarityScorer {
    pub fn new(structural: StructuralIndex) -> Self {
        Self { structural }
    }

    /// All four metrics, after the corroboration boost.
    pub fn score(&self, known: &FaceRecord, unknown: &FaceRecord) -> MethodScores {
        let mut scores = MethodScores {
            embedding: embedding_score(known, unknown),
            structural: self.structural_score(known, unknown),
            feature: feature_score(known, unknown),
            histogram: histogram_score(&known.color_face, &unknown.color_face),
        };

        tracing::debug!(
            facenet = ?scores.embedding,
            ssim = ?scores.structural,
            feature = ?scores.feature,
            histogram = ?scores.histogram,
            "method scores"
        );

        if apply_corroboration_boost(&mut scores) {
            tracing::debug!(
                feature = ?scores.feature,
                ssim = ?scores.structural,
                histogram = ?scores.histogram,
                "feature and structural scores agree; boosted"
            );
        }
        scores
    }

    pub fn structural_score(&self, known: &FaceRecord, unknown: &FaceRecord) -> Option<f32> {
        let score = match self.structural {
            StructuralIndex::Ssim => structural_score(&known.normalized_face, &unknown.normalized_face),
            StructuralIndex::Mse => mse_score(&known.normalized_face, &unknown.normalized_face),
        };
        if score.is_none() {
            tracing::warn!(
                known = ?known.normalized_face.dim(),
                unknown = ?unknown.normalized_face.dim(),
                "structural score unavailable"
            );
        }
        score
    }
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self::new(StructuralIndex::Ssim)
    }
}

/// Cosine similarity of the two embeddings mapped from [-1, 1] to [0, 1].
pub fn embedding_score(known: &FaceRecord, unknown: &FaceRecord) -> Option<f32> {
    let (a, b) = (known.embedding.as_ref()?, unknown.embedding.as_ref()?);
    match a.similarity(b) {
        Some(cos) => Some(((cos + 1.0) / 2.0).clamp(0.0, 1.0)),
        None => {
            tracing::warn!(known = a.values.len(), unknown = b.values.len(), "embeddings not comparable");
            None
        }
    }
}

/// Share of `known` descriptors with a distinctive match in `unknown`.
///
/// `None` when either side has no descriptors, or when `unknown` has fewer
/// than two: no descriptor then has a second neighbour to pass the ratio test.
pub fn feature_score(known: &FaceRecord, unknown: &FaceRecord) -> Option<f32> {
    if known.descriptors.is_empty() || unknown.descriptors.is_empty() {
        return None;
    }

    match knn_match(&known.descriptors, &unknown.descriptors, 2) {
        Ok(knn) => {
            let good = ratio_test(&knn, RATIO_TEST);
            Some(good as f32 / known.descriptors.len() as f32)
        }
        Err(e @ MatchError::TooFewCandidates { .. }) => {
            tracing::debug!(error = %e, "ratio-test matching unavailable; feature score absent");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "descriptor matching failed");
            None
        }
    }
}

/// Boost feature, structural and (if high enough) histogram scores when the
/// feature and structural scores agree strongly. Returns whether it fired.
pub fn apply_corroboration_boost(scores: &mut MethodScores) -> bool {
    let (Some(feature), Some(structural)) = (scores.feature, scores.structural) else {
        return false;
    };
    if feature <= BOOST_FEATURE_MIN || structural <= BOOST_STRUCTURAL_MIN {
        return false;
    }

    scores.feature = Some((feature * FEATURE_BOOST).min(1.0));
    scores.structural = Some((structural * STRUCTURAL_BOOST).min(1.0));
    if let Some(h) = scores.histogram {
        if h > BOOST_HISTOGRAM_MIN {
            scores.histogram = Some((h * HISTOGRAM_BOOST).min(1.0));
        }
    }
    true
}
