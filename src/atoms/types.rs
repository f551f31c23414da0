// ── Horadus Atoms: Pure Data Types ─────────────────────────────────────────
// All plain struct/enum definitions with no logic beyond string codecs.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.
//
// Enums are stored in SQLite as lowercase TEXT; each carries `as_str` /
// `parse` so row mapping stays total (unknown strings are an explicit
// `None`, never a panic).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Enumerations ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Rss,
    Gdelt,
    Telegram,
    Api,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Rss => "rss",
            SourceType::Gdelt => "gdelt",
            SourceType::Telegram => "telegram",
            SourceType::Api => "api",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rss" => Some(SourceType::Rss),
            "gdelt" => Some(SourceType::Gdelt),
            "telegram" => Some(SourceType::Telegram),
            "api" => Some(SourceType::Api),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Classified,
    Noise,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Classified => "classified",
            ProcessingStatus::Noise => "noise",
            ProcessingStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "classified" => Some(ProcessingStatus::Classified),
            "noise" => Some(ProcessingStatus::Noise),
            "error" => Some(ProcessingStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLifecycle {
    Emerging,
    Confirmed,
    Fading,
    Archived,
}

impl EventLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLifecycle::Emerging => "emerging",
            EventLifecycle::Confirmed => "confirmed",
            EventLifecycle::Fading => "fading",
            EventLifecycle::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "emerging" => Some(EventLifecycle::Emerging),
            "confirmed" => Some(EventLifecycle::Confirmed),
            "fading" => Some(EventLifecycle::Fading),
            "archived" => Some(EventLifecycle::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Escalatory,
    DeEscalatory,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Escalatory => "escalatory",
            Direction::DeEscalatory => "de_escalatory",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "escalatory" => Some(Direction::Escalatory),
            "de_escalatory" => Some(Direction::DeEscalatory),
            _ => None,
        }
    }

    /// Sign applied to evidence deltas: escalation pushes log-odds up.
    pub fn multiplier(&self) -> f64 {
        match self {
            Direction::Escalatory => 1.0,
            Direction::DeEscalatory => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    Occurred,
    DidNotOccur,
    Partial,
    Ongoing,
}

impl OutcomeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeType::Occurred => "occurred",
            OutcomeType::DidNotOccur => "did_not_occur",
            OutcomeType::Partial => "partial",
            OutcomeType::Ongoing => "ongoing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "occurred" => Some(OutcomeType::Occurred),
            "did_not_occur" => Some(OutcomeType::DidNotOccur),
            "partial" => Some(OutcomeType::Partial),
            "ongoing" => Some(OutcomeType::Ongoing),
            _ => None,
        }
    }

    /// The actual value used for Brier scoring; `None` for unresolved outcomes.
    pub fn actual_value(&self) -> Option<f64> {
        match self {
            OutcomeType::Occurred => Some(1.0),
            OutcomeType::DidNotOccur => Some(0.0),
            OutcomeType::Partial => Some(0.5),
            OutcomeType::Ongoing => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Guarded,
    Elevated,
    High,
    Severe,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Guarded => "guarded",
            RiskLevel::Elevated => "elevated",
            RiskLevel::High => "high",
            RiskLevel::Severe => "severe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Pin,
    MarkNoise,
    Invalidate,
    OverrideDelta,
}

impl FeedbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackAction::Pin => "pin",
            FeedbackAction::MarkNoise => "mark_noise",
            FeedbackAction::Invalidate => "invalidate",
            FeedbackAction::OverrideDelta => "override_delta",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pin" => Some(FeedbackAction::Pin),
            "mark_noise" => Some(FeedbackAction::MarkNoise),
            "invalidate" => Some(FeedbackAction::Invalidate),
            "override_delta" => Some(FeedbackAction::OverrideDelta),
            _ => None,
        }
    }

    /// Actions that suppress further automated impact from an event.
    pub fn is_suppressive(&self) -> bool {
        matches!(self, FeedbackAction::MarkNoise | FeedbackAction::Invalidate)
    }
}

/// LLM budget tier; each gets its own daily ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmTier {
    Tier1,
    Tier2,
    Embedding,
}

impl LlmTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmTier::Tier1 => "tier1",
            LlmTier::Tier2 => "tier2",
            LlmTier::Embedding => "embedding",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tier1" => Some(LlmTier::Tier1),
            "tier2" => Some(LlmTier::Tier2),
            "embedding" => Some(LlmTier::Embedding),
            _ => None,
        }
    }

    pub const ALL: [LlmTier; 3] = [LlmTier::Tier1, LlmTier::Tier2, LlmTier::Embedding];
}

// ── Storage records ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,
    pub url: Option<String>,
    pub credibility_score: f64,
    pub source_tier: Option<String>,
    pub reporting_type: Option<String>,
    pub is_active: bool,
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// Ingestion watermark: end of the last successfully collected window.
    pub ingestion_window_end_at: Option<DateTime<Utc>>,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    pub source_id: String,
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub raw_content: String,
    /// sha256 of the normalized raw text.
    pub content_hash: String,
    pub language: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub embedding_generated_at: Option<DateTime<Utc>>,
    pub processing_status: ProcessingStatus,
    pub error_message: Option<String>,
}

/// Per-trend impact extracted by tier-2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendImpact {
    pub trend_id: String,
    pub signal_type: String,
    pub direction: Direction,
    pub severity: f64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Structured claims payload stored on an event after tier-2.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedClaims {
    #[serde(default)]
    pub claims: Vec<String>,
    #[serde(default)]
    pub trend_impacts: Vec<TrendImpact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub canonical_summary: String,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub embedding_generated_at: Option<DateTime<Utc>>,
    pub source_count: i64,
    pub unique_source_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_mention_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub lifecycle_status: EventLifecycle,
    /// Weak reference to the linked item with the highest effective credibility.
    pub primary_item_id: Option<String>,
    pub extracted_who: Vec<String>,
    pub extracted_what: Option<String>,
    pub extracted_where: Option<String>,
    pub extracted_when: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    pub extracted_claims: Option<ExtractedClaims>,
    pub has_contradictions: bool,
}

/// One indicator configuration inside a trend definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendIndicator {
    pub weight: f64,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay_half_life_days: Option<i64>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trend {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub definition: serde_json::Value,
    /// signal_type → indicator config. BTreeMap keeps payload order stable.
    pub indicators: BTreeMap<String, TrendIndicator>,
    pub baseline_log_odds: f64,
    pub current_log_odds: f64,
    pub decay_half_life_days: i64,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl Trend {
    /// Stable identifier used in LLM payloads: `definition.id` when present,
    /// else the row id.
    pub fn identifier(&self) -> String {
        if let Some(id) = self.definition.get("id").and_then(|v| v.as_str()) {
            let trimmed = id.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        self.id.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendEvidence {
    pub id: String,
    pub trend_id: String,
    pub event_id: String,
    pub signal_type: String,
    pub delta_log_odds: f64,
    pub factors: serde_json::Value,
    pub reasoning: Option<String>,
    pub is_invalidated: bool,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub invalidation_feedback_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendSnapshot {
    pub trend_id: String,
    pub timestamp: DateTime<Utc>,
    pub log_odds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendOutcome {
    pub id: String,
    pub trend_id: String,
    pub prediction_date: DateTime<Utc>,
    pub predicted_probability: f64,
    pub predicted_risk_level: RiskLevel,
    pub probability_band_low: f64,
    pub probability_band_high: f64,
    pub outcome: OutcomeType,
    pub outcome_notes: Option<String>,
    pub outcome_evidence: Option<serde_json::Value>,
    pub brier_score: Option<f64>,
    pub recorded_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUsage {
    pub usage_date: String,
    pub tier: LlmTier,
    pub call_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanFeedback {
    pub id: String,
    pub target_type: String,
    pub target_id: String,
    pub action: FeedbackAction,
    pub original_value: Option<serde_json::Value>,
    pub corrected_value: Option<serde_json::Value>,
    pub notes: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit row for LLM outputs referencing unknown trend/signal identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyGap {
    pub id: String,
    pub reason: TaxonomyGapReason,
    pub trend_id: String,
    pub signal_type: Option<String>,
    pub event_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxonomyGapReason {
    UnknownTrendId,
    UnknownSignalType,
}

impl TaxonomyGapReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxonomyGapReason::UnknownTrendId => "UNKNOWN_TREND_ID",
            TaxonomyGapReason::UnknownSignalType => "UNKNOWN_SIGNAL_TYPE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UNKNOWN_TREND_ID" => Some(TaxonomyGapReason::UnknownTrendId),
            "UNKNOWN_SIGNAL_TYPE" => Some(TaxonomyGapReason::UnknownSignalType),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_string_round_trips() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Classified,
            ProcessingStatus::Noise,
            ProcessingStatus::Error,
        ] {
            assert_eq!(ProcessingStatus::parse(status.as_str()), Some(status));
        }
        for lifecycle in [
            EventLifecycle::Emerging,
            EventLifecycle::Confirmed,
            EventLifecycle::Fading,
            EventLifecycle::Archived,
        ] {
            assert_eq!(EventLifecycle::parse(lifecycle.as_str()), Some(lifecycle));
        }
        assert_eq!(Direction::parse("de_escalatory"), Some(Direction::DeEscalatory));
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn trend_identifier_prefers_definition_id() {
        let mut trend = sample_trend();
        assert_eq!(trend.identifier(), "eu-russia");
        trend.definition = serde_json::json!({});
        assert_eq!(trend.identifier(), trend.id);
        trend.definition = serde_json::json!({ "id": "  " });
        assert_eq!(trend.identifier(), trend.id);
    }

    #[test]
    fn outcome_actual_values() {
        assert_eq!(OutcomeType::Occurred.actual_value(), Some(1.0));
        assert_eq!(OutcomeType::DidNotOccur.actual_value(), Some(0.0));
        assert_eq!(OutcomeType::Partial.actual_value(), Some(0.5));
        assert_eq!(OutcomeType::Ongoing.actual_value(), None);
    }

    fn sample_trend() -> Trend {
        Trend {
            id: "row-id".into(),
            name: "EU-Russia escalation".into(),
            description: None,
            definition: serde_json::json!({ "id": "eu-russia" }),
            indicators: BTreeMap::new(),
            baseline_log_odds: 0.0,
            current_log_odds: 0.0,
            decay_half_life_days: 30,
            is_active: true,
            updated_at: Utc::now(),
        }
    }
}
