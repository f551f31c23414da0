// Horadus — Trend Engine
//
// Probability tracking in log-odds space. LLMs extract structured signals;
// this code computes deltas. Storage never holds probabilities — only
// log-odds — and every mutation of a trend row (evidence, decay, manual
// override, invalidation) runs inside a single store transaction that
// reads and writes current_log_odds atomically, so concurrent deltas
// always compose as their algebraic sum.

use crate::atoms::constants::{
    AGGREGATOR_CLUSTER_DISCOUNT, CONTRADICTION_PENALTY, CORROBORATION_SATURATION,
    MAX_DELTA_PER_EVENT, MAX_PROBABILITY, MIN_PROBABILITY,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Direction, FeedbackAction, HumanFeedback, Trend};
use crate::engine::observability::record_corroboration_path;
use crate::engine::store::{ts, Store};
use chrono::{DateTime, Utc};
use log::info;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

// ── Probability math ───────────────────────────────────────────────────────

/// logit: probability → log-odds. Input is clamped to the valid band first.
pub fn prob_to_logodds(probability: f64) -> f64 {
    let p = probability.clamp(MIN_PROBABILITY, MAX_PROBABILITY);
    (p / (1.0 - p)).ln()
}

/// sigmoid: log-odds → probability, clamped to the exposed band.
pub fn logodds_to_prob(log_odds: f64) -> f64 {
    let p = 1.0 / (1.0 + (-log_odds).exp());
    p.clamp(MIN_PROBABILITY, MAX_PROBABILITY)
}

// ── Evidence factors ───────────────────────────────────────────────────────

/// The multiplicative components behind one evidence delta, persisted as
/// the factor breakdown on the evidence row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceFactors {
    pub base_weight: f64,
    pub severity: f64,
    pub confidence: f64,
    pub credibility: f64,
    pub corroboration: f64,
    pub novelty: f64,
    pub evidence_age_days: f64,
    pub temporal_decay: f64,
    pub direction_multiplier: f64,
    pub raw_delta: f64,
    pub clamped_delta: f64,
}

/// Compute one evidence delta from its factors.
#[allow(clippy::too_many_arguments)]
pub fn calculate_evidence_delta(
    base_weight: f64,
    severity: f64,
    confidence: f64,
    credibility: f64,
    corroboration: f64,
    novelty: f64,
    evidence_age_days: f64,
    half_life_days: f64,
    direction: Direction,
) -> EvidenceFactors {
    let age = evidence_age_days.max(0.0);
    let half_life = if half_life_days > 0.0 { half_life_days } else { 1.0 };
    let temporal_decay = 0.5f64.powf(age / half_life);
    let direction_multiplier = direction.multiplier();
    let raw_delta = base_weight
        * severity
        * confidence
        * credibility
        * corroboration
        * novelty
        * temporal_decay
        * direction_multiplier;
    let clamped_delta = raw_delta.clamp(-MAX_DELTA_PER_EVENT, MAX_DELTA_PER_EVENT);
    EvidenceFactors {
        base_weight,
        severity,
        confidence,
        credibility,
        corroboration,
        novelty,
        evidence_age_days: age,
        temporal_decay,
        direction_multiplier,
        raw_delta,
        clamped_delta,
    }
}

// ── Corroboration ──────────────────────────────────────────────────────────

/// Cluster-aware corroboration score over an event's linked sources.
///
/// Sources group by (reporting_type, source_tier). Firsthand sources count
/// 1.0 each and secondary 0.7 each; aggregator-reporting sources collapse
/// into one cluster per tier contributing √n × 0.4, so a wire story echoed
/// by many aggregators cannot overcount. Contradicted events take a 0.7
/// penalty on the whole score.
pub fn corroboration_score(
    source_rows: &[(String, Option<String>, Option<String>)],
    has_contradictions: bool,
) -> f64 {
    let mut score = 0.0;
    let mut aggregator_clusters: BTreeMap<String, usize> = BTreeMap::new();

    for (_source_id, source_tier, reporting_type) in source_rows {
        match reporting_type.as_deref() {
            Some("aggregator") => {
                let tier = source_tier.clone().unwrap_or_else(|| "unknown".into());
                *aggregator_clusters.entry(tier).or_insert(0) += 1;
            }
            Some("secondary") => score += 0.7,
            _ => score += 1.0,
        }
    }
    for count in aggregator_clusters.values() {
        score += (*count as f64).sqrt() * AGGREGATOR_CLUSTER_DISCOUNT;
    }

    if has_contradictions {
        score *= CONTRADICTION_PENALTY;
    }
    score
}

/// Fold a corroboration score into the multiplicative evidence factor:
/// √score normalized to saturate at nine effective sources.
pub fn corroboration_factor(score: f64) -> f64 {
    (score.max(0.0).sqrt() / CORROBORATION_SATURATION).clamp(0.0, 1.0)
}

/// Novelty per (trend, event): full weight the first time, then decaying.
pub fn novelty_factor(prior_evidence_count: i64) -> f64 {
    match prior_evidence_count {
        0 => 1.0,
        1 => 0.5,
        _ => 0.25,
    }
}

/// Event-level corroboration with the documented fallback: rows missing
/// source-cluster fields fall back to the raw unique source count.
pub fn event_corroboration_score(
    source_rows: &[(String, Option<String>, Option<String>)],
    unique_source_count: i64,
    has_contradictions: bool,
) -> f64 {
    if source_rows.is_empty() {
        record_corroboration_path("fallback", "missing_source_cluster_fields");
        let mut score = unique_source_count.max(0) as f64;
        if has_contradictions {
            score *= CONTRADICTION_PENALTY;
        }
        return score;
    }
    record_corroboration_path("cluster_aware", "source_cluster_fields_present");
    corroboration_score(source_rows, has_contradictions)
}

// ── Trend updates ──────────────────────────────────────────────────────────

/// Outcome of one evidence application.
#[derive(Debug, Clone)]
pub struct TrendUpdate {
    pub previous_probability: f64,
    pub new_probability: f64,
    pub delta_applied: f64,
    pub direction: &'static str,
}

/// Summary of one decay pass.
#[derive(Debug, Clone, Serialize)]
pub struct DecayRunSummary {
    pub trends_decayed: usize,
    pub trends_skipped: usize,
}

pub struct TrendEngine {
    store: Arc<Store>,
}

impl TrendEngine {
    pub fn new(store: Arc<Store>) -> Self {
        TrendEngine { store }
    }

    /// Apply one evidence delta: update the trend's log-odds and write the
    /// evidence row with its factor breakdown, atomically.
    pub fn apply_evidence(
        &self,
        trend_id: &str,
        event_id: &str,
        signal_type: &str,
        factors: &EvidenceFactors,
        reasoning: Option<&str>,
    ) -> EngineResult<TrendUpdate> {
        let delta = factors.clamped_delta;
        let now = Utc::now();

        let mut conn = self.store.conn.lock();
        let tx = conn.transaction()?;
        let current: f64 = tx
            .query_row(
                "SELECT current_log_odds FROM trends WHERE id = ?1",
                params![trend_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::not_found(format!("trend '{trend_id}'"))
                }
                other => EngineError::Database(other),
            })?;
        let new_log_odds = current + delta;

        tx.execute(
            "UPDATE trends SET current_log_odds = ?2, updated_at = ?3 WHERE id = ?1",
            params![trend_id, new_log_odds, ts(now)],
        )?;
        tx.execute(
            "INSERT INTO trend_evidence (id, trend_id, event_id, signal_type, delta_log_odds,
                                         factors_json, reasoning, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                trend_id,
                event_id,
                signal_type,
                delta,
                serde_json::to_string(factors)?,
                reasoning,
                ts(now),
            ],
        )?;
        tx.commit()?;

        let previous_probability = logodds_to_prob(current);
        let new_probability = logodds_to_prob(new_log_odds);
        Ok(TrendUpdate {
            previous_probability,
            new_probability,
            delta_applied: delta,
            direction: if delta > 0.0 {
                "up"
            } else if delta < 0.0 {
                "down"
            } else {
                "flat"
            },
        })
    }

    /// Analyst override: add a manual log-odds delta and record the
    /// feedback audit trail in the same transaction.
    pub fn apply_manual_override(
        &self,
        trend_id: &str,
        delta_log_odds: f64,
        notes: Option<&str>,
        created_by: Option<&str>,
    ) -> EngineResult<HumanFeedback> {
        let now = Utc::now();
        let feedback_id = Uuid::new_v4().to_string();

        let mut conn = self.store.conn.lock();
        let tx = conn.transaction()?;
        let current: f64 = tx
            .query_row(
                "SELECT current_log_odds FROM trends WHERE id = ?1",
                params![trend_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::not_found(format!("trend '{trend_id}'"))
                }
                other => EngineError::Database(other),
            })?;
        let new_log_odds = current + delta_log_odds;
        tx.execute(
            "UPDATE trends SET current_log_odds = ?2, updated_at = ?3 WHERE id = ?1",
            params![trend_id, new_log_odds, ts(now)],
        )?;

        let original_value = serde_json::json!({ "current_log_odds": current });
        let corrected_value = serde_json::json!({
            "delta_log_odds": delta_log_odds,
            "new_log_odds": new_log_odds,
        });
        tx.execute(
            "INSERT INTO human_feedback (id, target_type, target_id, action,
                                         original_value_json, corrected_value_json,
                                         notes, created_by, created_at)
             VALUES (?1, 'trend', ?2, 'override_delta', ?3, ?4, ?5, ?6, ?7)",
            params![
                feedback_id,
                trend_id,
                original_value.to_string(),
                corrected_value.to_string(),
                notes,
                created_by,
                ts(now),
            ],
        )?;
        tx.commit()?;

        Ok(HumanFeedback {
            id: feedback_id,
            target_type: "trend".into(),
            target_id: trend_id.to_string(),
            action: FeedbackAction::OverrideDelta,
            original_value: Some(original_value),
            corrected_value: Some(corrected_value),
            notes: notes.map(str::to_string),
            created_by: created_by.map(str::to_string),
            created_at: now,
        })
    }

    /// Pull each active trend toward its baseline by the elapsed-time decay
    /// factor. Each trend is read and written under its own transaction, so
    /// a manual delta landing concurrently is preserved: decay applies to
    /// the value it observed, and the later delta adds on top of the
    /// decayed value.
    pub fn apply_decay(&self, now: DateTime<Utc>) -> EngineResult<DecayRunSummary> {
        let trends = self.store.list_active_trends()?;
        let mut decayed = 0usize;
        let mut skipped = 0usize;

        for trend in &trends {
            let elapsed_days =
                (now - trend.updated_at).num_seconds() as f64 / 86_400.0;
            if elapsed_days <= 0.0 {
                skipped += 1;
                continue;
            }
            let half_life = trend.decay_half_life_days.max(1) as f64;
            let factor = 0.5f64.powf(elapsed_days / half_life);

            let mut conn = self.store.conn.lock();
            let tx = conn.transaction()?;
            let current: f64 = tx.query_row(
                "SELECT current_log_odds FROM trends WHERE id = ?1",
                params![trend.id],
                |row| row.get(0),
            )?;
            let new_log_odds = trend.baseline_log_odds + (current - trend.baseline_log_odds) * factor;
            tx.execute(
                "UPDATE trends SET current_log_odds = ?2, updated_at = ?3 WHERE id = ?1",
                params![trend.id, new_log_odds, ts(now)],
            )?;
            tx.commit()?;
            decayed += 1;
        }

        Ok(DecayRunSummary {
            trends_decayed: decayed,
            trends_skipped: skipped,
        })
    }

    /// Append a snapshot per active trend. Returns the snapshot count.
    pub fn snapshot_trends(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let trends = self.store.list_active_trends()?;
        for trend in &trends {
            self.store
                .insert_snapshot(&trend.id, now, trend.current_log_odds)?;
        }
        Ok(trends.len())
    }

    /// Reverse every not-yet-invalidated evidence delta contributed by an
    /// event: affected trends lose the summed delta and the evidence rows
    /// are marked invalidated (kept for lineage).
    pub fn invalidate_event_evidence(
        &self,
        event_id: &str,
        feedback_id: &str,
    ) -> EngineResult<BTreeMap<String, f64>> {
        let now = Utc::now();
        let mut conn = self.store.conn.lock();
        let tx = conn.transaction()?;

        let rows: Vec<(String, f64)> = {
            let mut stmt = tx.prepare(
                "SELECT trend_id, delta_log_odds FROM trend_evidence
                 WHERE event_id = ?1 AND is_invalidated = 0",
            )?;
            let rows = stmt
                .query_map(params![event_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut trend_deltas: BTreeMap<String, f64> = BTreeMap::new();
        for (trend_id, delta) in &rows {
            *trend_deltas.entry(trend_id.clone()).or_insert(0.0) += delta;
        }

        for (trend_id, delta) in &trend_deltas {
            tx.execute(
                "UPDATE trends
                 SET current_log_odds = current_log_odds - ?2, updated_at = ?3
                 WHERE id = ?1",
                params![trend_id, delta, ts(now)],
            )?;
        }
        tx.execute(
            "UPDATE trend_evidence
             SET is_invalidated = 1, invalidated_at = ?2, invalidation_feedback_id = ?3
             WHERE event_id = ?1 AND is_invalidated = 0",
            params![event_id, ts(now), feedback_id],
        )?;
        tx.commit()?;

        if !trend_deltas.is_empty() {
            info!(
                "[trend] Invalidated evidence for event {}: {} trend(s) reverted",
                event_id,
                trend_deltas.len()
            );
        }
        Ok(trend_deltas)
    }

    /// Current probability of a trend row.
    pub fn current_probability(trend: &Trend) -> f64 {
        logodds_to_prob(trend.current_log_odds)
    }
}
