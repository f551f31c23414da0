// ── Horadus Atoms: Constants ───────────────────────────────────────────────
// Tuning constants shared across the engine. Anything an operator should be
// able to override lives in config::Settings instead; these are the fixed
// semantics of the probability and lifecycle machinery.

// ── Probability engine ─────────────────────────────────────────────────────

/// Floor for exposed probabilities; log-odds storage is unclamped.
pub const MIN_PROBABILITY: f64 = 0.001;
/// Ceiling for exposed probabilities.
pub const MAX_PROBABILITY: f64 = 0.999;
/// Hard cap on the magnitude of a single evidence delta, in log-odds.
pub const MAX_DELTA_PER_EVENT: f64 = 0.5;

// ── Event lifecycle ────────────────────────────────────────────────────────

/// Distinct sources required to move an event from emerging to confirmed.
pub const CONFIRMATION_THRESHOLD: i64 = 3;
/// Hours without a mention before a confirmed event starts fading.
pub const FADING_HOURS: i64 = 48;
/// Days without a mention before a fading event is archived.
pub const ARCHIVE_DAYS: i64 = 7;

// ── Source credibility ─────────────────────────────────────────────────────

/// Credibility assumed for sources with no configured score.
pub const DEFAULT_SOURCE_CREDIBILITY: f64 = 0.5;

/// Credibility multiplier for a source tier. Unknown tiers pass through at 1.0.
pub fn tier_multiplier(source_tier: Option<&str>) -> f64 {
    match source_tier {
        Some("primary") => 1.0,
        Some("wire") => 0.95,
        Some("major") => 0.85,
        Some("regional") => 0.70,
        Some("aggregator") => 0.50,
        _ => 1.0,
    }
}

/// Credibility multiplier for a reporting type. Unknown types pass through at 1.0.
pub fn reporting_multiplier(reporting_type: Option<&str>) -> f64 {
    match reporting_type {
        Some("firsthand") => 1.0,
        Some("secondary") => 0.70,
        Some("aggregator") => 0.40,
        _ => 1.0,
    }
}

// ── Corroboration scoring ──────────────────────────────────────────────────

/// Score discount applied to an aggregator-reporting source cluster.
pub const AGGREGATOR_CLUSTER_DISCOUNT: f64 = 0.4;
/// Multiplier applied to the corroboration score of contradicted events.
pub const CONTRADICTION_PENALTY: f64 = 0.7;
/// √score reaches full corroboration at this many effective sources.
pub const CORROBORATION_SATURATION: f64 = 3.0;

// ── LLM payload safety ─────────────────────────────────────────────────────

/// Conservative chars-per-token heuristic for payload sizing.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;
/// Marker appended when a payload is truncated to fit a token budget.
pub const TRUNCATION_MARKER: &str = "[TRUNCATED]";

// ── Content limits ─────────────────────────────────────────────────────────

/// Canonical summary fallback length when an item has no title.
pub const CANONICAL_SUMMARY_MAX_CHARS: usize = 400;
/// Tier-1 per-item content truncation.
pub const TIER1_CONTENT_MAX_CHARS: usize = 4000;
/// Tier-2 per-chunk truncation.
pub const TIER2_CHUNK_MAX_CHARS: usize = 2500;
/// Linked items included as tier-2 context.
pub const TIER2_CONTEXT_ITEMS: usize = 5;
/// Persisted error messages are truncated to this many chars.
pub const ERROR_MESSAGE_MAX_CHARS: usize = 1000;

// ── Worker runtime ─────────────────────────────────────────────────────────

/// Dead-letter list keeps only this many newest entries.
pub const DEAD_LETTER_MAX_ITEMS: usize = 1000;
/// Seconds the semantic cache bypasses a failing backend before retrying.
pub const SEMANTIC_CACHE_DEGRADE_SECONDS: i64 = 30;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_multiplier_keys_default_to_one() {
        assert_eq!(tier_multiplier(Some("blog")), 1.0);
        assert_eq!(tier_multiplier(None), 1.0);
        assert_eq!(reporting_multiplier(Some("rumor")), 1.0);
        assert_eq!(reporting_multiplier(None), 1.0);
    }

    #[test]
    fn multiplier_tables_match_tiers() {
        assert_eq!(tier_multiplier(Some("primary")), 1.0);
        assert_eq!(tier_multiplier(Some("aggregator")), 0.50);
        assert_eq!(reporting_multiplier(Some("firsthand")), 1.0);
        assert_eq!(reporting_multiplier(Some("aggregator")), 0.40);
    }
}
