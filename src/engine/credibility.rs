// Horadus — Source Credibility
// Effective credibility folds the configured base score with tier and
// reporting-type multipliers; the result stays in [0, 1].

use crate::atoms::constants::{reporting_multiplier, tier_multiplier, DEFAULT_SOURCE_CREDIBILITY};

/// Apply tier and reporting multipliers to a base credibility score.
pub fn effective_source_credibility(
    base_credibility: Option<f64>,
    source_tier: Option<&str>,
    reporting_type: Option<&str>,
) -> f64 {
    let base = base_credibility
        .filter(|value| value.is_finite())
        .unwrap_or(DEFAULT_SOURCE_CREDIBILITY);
    let adjusted = base * tier_multiplier(source_tier) * reporting_multiplier(reporting_type);
    adjusted.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipliers_compound() {
        // wire (0.95) × secondary (0.70)
        let value = effective_source_credibility(Some(1.0), Some("wire"), Some("secondary"));
        assert!((value - 0.665).abs() < 1e-9);
    }

    #[test]
    fn missing_base_uses_default() {
        let value = effective_source_credibility(None, Some("primary"), Some("firsthand"));
        assert!((value - DEFAULT_SOURCE_CREDIBILITY).abs() < 1e-9);
    }

    #[test]
    fn result_is_clamped() {
        assert_eq!(effective_source_credibility(Some(2.0), None, None), 1.0);
        assert_eq!(effective_source_credibility(Some(-1.0), None, None), 0.0);
        assert_eq!(
            effective_source_credibility(Some(f64::NAN), None, None),
            DEFAULT_SOURCE_CREDIBILITY
        );
    }
}
