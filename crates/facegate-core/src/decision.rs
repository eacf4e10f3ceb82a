//! Threshold and liveness decision on a fused similarity.

use chrono::Utc;

use crate::types::VerificationResult;

/// Confidence (0–100) above which a match is flagged as suspicious.
pub const SPOOF_CONFIDENCE: f32 = 99.5;
pub const SPOOF_WARNING: &str = "Unusually high confidence score detected - possible spoof attempt";

/// Thresholds above this are "strict"; near misses under them get logged.
const STRICT_THRESHOLD: f32 = 0.80;
const NEAR_MATCH_FLOOR: f32 = 0.65;

/// `match = similarity > threshold`; `security_passed = match && has_eyes`.
pub fn decide(similarity: f32, has_eyes: bool, threshold: f32) -> VerificationResult {
    let matched = similarity > threshold;
    let confidence = similarity * 100.0;
    let security_passed = matched && has_eyes;

    let warning = (confidence > SPOOF_CONFIDENCE).then(|| {
        tracing::warn!(confidence, "suspiciously perfect match");
        SPOOF_WARNING.to_string()
    });

    if threshold > STRICT_THRESHOLD && similarity > NEAR_MATCH_FLOOR && similarity < threshold {
        tracing::warn!(similarity, threshold, "near match rejected by strict threshold");
    }

    tracing::info!(matched, confidence, has_eyes, security_passed, threshold, "verification decided");

    VerificationResult {
        matched,
        confidence,
        similarity,
        has_eyes,
        security_passed,
        threshold: threshold * 100.0,
        error: None,
        warning,
        timestamp: Utc::now(),
        scores: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_is_strictly_greater() {
        assert!(!decide(0.65, true, 0.65).matched);
        assert!(decide(0.6501, true, 0.65).matched);
    }

    #[test]
    fn test_security_requires_eyes() {
        let r = decide(0.9, false, 0.65);
        assert!(r.matched);
        assert!(!r.security_passed);
        assert!(decide(0.9, true, 0.65).security_passed);
    }

    #[test]
    fn test_confidence_and_threshold_scaling() {
        let r = decide(0.5, true, 0.7);
        assert!((r.confidence - 50.0).abs() < 1e-4);
        assert!((r.threshold - 70.0).abs() < 1e-4);
        assert!(r.error.is_none());
    }

    #[test]
    fn test_spoof_warning() {
        assert_eq!(decide(0.996, true, 0.65).warning.as_deref(), Some(SPOOF_WARNING));
        assert!(decide(0.99, true, 0.65).warning.is_none());
    }

    #[test]
    fn test_threshold_monotonic() {
        let s = 0.72;
        let mut seen_reject = false;
        for t in (0..100).map(|i| i as f32 / 100.0) {
            let m = decide(s, true, t).matched;
            assert_eq!(m, s > t);
            if !m {
                seen_reject = true;
            }
            assert!(!(seen_reject && m), "raising the threshold re-admitted a match at {t}");
        }
    }
}
