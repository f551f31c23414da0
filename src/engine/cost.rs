// Horadus — Cost Tracker
//
// Per-tier daily call/token/cost ledger with hard budget enforcement.
// `record_usage` re-checks both limits inside the same transaction that
// increments the counters, so two workers racing on the last budget slot
// cannot both get through: the loser's transaction sees the winner's
// increment and rolls back with BudgetExceeded.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::LlmTier;
use crate::config::Settings;
use crate::engine::observability::record_budget_denial;
use crate::engine::store::{ts, Store};
use chrono::Utc;
use log::warn;
use rusqlite::{params, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;

/// (input, output) USD per 1M tokens, by tier.
fn cost_per_1m_tokens(tier: LlmTier) -> (f64, f64) {
    match tier {
        LlmTier::Tier1 => (0.10, 0.40),
        LlmTier::Tier2 => (0.15, 0.60),
        LlmTier::Embedding => (0.10, 0.00),
    }
}

#[derive(Debug, Clone)]
pub struct CostLimits {
    pub tier1_max_daily_calls: i64,
    pub tier2_max_daily_calls: i64,
    pub embedding_max_daily_calls: i64,
    pub daily_cost_limit_usd: f64,
    pub cost_alert_threshold_pct: i64,
}

impl CostLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        CostLimits {
            tier1_max_daily_calls: settings.tier1_max_daily_calls,
            tier2_max_daily_calls: settings.tier2_max_daily_calls,
            embedding_max_daily_calls: settings.embedding_max_daily_calls,
            daily_cost_limit_usd: settings.daily_cost_limit_usd,
            cost_alert_threshold_pct: settings.cost_alert_threshold_pct,
        }
    }

    /// Per-tier daily call limit; 0 means unlimited.
    fn call_limit(&self, tier: LlmTier) -> i64 {
        match tier {
            LlmTier::Tier1 => self.tier1_max_daily_calls,
            LlmTier::Tier2 => self.tier2_max_daily_calls,
            LlmTier::Embedding => self.embedding_max_daily_calls,
        }
    }
}

/// Per-tier rollup inside the daily summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TierSummary {
    pub calls: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub call_limit: i64,
}

/// Compact budget summary for one UTC date.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DailySummary {
    pub date: String,
    /// "active", or "sleep_mode" when any limit is exhausted.
    pub status: String,
    pub daily_cost_limit_usd: f64,
    pub total_cost_usd: f64,
    pub budget_remaining_usd: Option<f64>,
    pub tiers: BTreeMap<String, TierSummary>,
}

pub struct CostTracker {
    store: Arc<Store>,
    limits: CostLimits,
}

impl CostTracker {
    pub fn new(store: Arc<Store>, limits: CostLimits) -> Self {
        CostTracker { store, limits }
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    /// Error with a denial counter if the tier cannot make another call now.
    pub fn ensure_within_budget(&self, tier: LlmTier) -> EngineResult<()> {
        match self.check_budget(tier)? {
            None => Ok(()),
            Some(reason) => {
                record_budget_denial(tier.as_str(), &reason);
                Err(EngineError::budget(tier.as_str(), reason))
            }
        }
    }

    /// None when the tier may call; Some(reason) when exhausted.
    pub fn check_budget(&self, tier: LlmTier) -> EngineResult<Option<String>> {
        let today = Self::today();
        let conn = self.store.conn.lock();
        let (calls, total_cost) = read_counters(&conn, &today, tier)?;
        Ok(self.violation(tier, calls, total_cost))
    }

    fn violation(&self, tier: LlmTier, calls: i64, total_cost: f64) -> Option<String> {
        let call_limit = self.limits.call_limit(tier);
        if call_limit > 0 && calls >= call_limit {
            return Some(format!(
                "{} daily call limit ({}) exceeded",
                tier.as_str(),
                call_limit
            ));
        }
        let cost_limit = self.limits.daily_cost_limit_usd;
        if cost_limit > 0.0 && total_cost >= cost_limit {
            return Some(format!("daily cost limit (${cost_limit}) exceeded"));
        }
        None
    }

    /// Persist token and cost counters for one successful API call.
    /// The whole check-and-increment is a single transaction.
    pub fn record_usage(
        &self,
        tier: LlmTier,
        input_tokens: i64,
        output_tokens: i64,
    ) -> EngineResult<()> {
        let today = Self::today();
        let safe_input = input_tokens.max(0);
        let safe_output = output_tokens.max(0);
        let (input_rate, output_rate) = cost_per_1m_tokens(tier);
        let estimated_cost = (safe_input as f64 / 1_000_000.0) * input_rate
            + (safe_output as f64 / 1_000_000.0) * output_rate;

        let total_cost_after = {
            let mut conn = self.store.conn.lock();
            let tx = conn.transaction()?;
            ensure_usage_row(&tx, &today, tier)?;

            let (calls, total_cost) = read_counters(&tx, &today, tier)?;
            if let Some(reason) = self.violation(tier, calls, total_cost) {
                drop(tx); // rolls back
                record_budget_denial(tier.as_str(), &reason);
                return Err(EngineError::budget(tier.as_str(), reason));
            }

            tx.execute(
                "UPDATE api_usage
                 SET call_count = call_count + 1,
                     input_tokens = input_tokens + ?3,
                     output_tokens = output_tokens + ?4,
                     estimated_cost_usd = estimated_cost_usd + ?5,
                     updated_at = ?6
                 WHERE usage_date = ?1 AND tier = ?2",
                params![
                    today,
                    tier.as_str(),
                    safe_input,
                    safe_output,
                    estimated_cost,
                    ts(Utc::now()),
                ],
            )?;
            tx.commit()?;
            total_cost + estimated_cost
        };

        self.maybe_log_cost_alert(&today, total_cost_after);
        Ok(())
    }

    fn maybe_log_cost_alert(&self, date: &str, total_cost: f64) {
        let limit = self.limits.daily_cost_limit_usd;
        let threshold_pct = self.limits.cost_alert_threshold_pct;
        if limit <= 0.0 || threshold_pct <= 0 {
            return;
        }
        let usage_pct = (total_cost / limit) * 100.0;
        if usage_pct >= threshold_pct as f64 {
            warn!(
                "[cost] Daily LLM cost alert threshold reached: date={} total=${:.4} limit=${} usage={:.1}%",
                date, total_cost, limit, usage_pct
            );
        }
    }

    /// Per-tier rollup for the current UTC date.
    pub fn get_daily_summary(&self) -> EngineResult<DailySummary> {
        let today = Self::today();
        let rows = self.store.usage_rows_for_date(&today)?;

        let mut tiers = BTreeMap::new();
        let mut total_cost = 0.0;
        let mut call_blocked = false;
        for tier in LlmTier::ALL {
            let row = rows.iter().find(|row| row.tier == tier);
            let calls = row.map(|r| r.call_count).unwrap_or(0);
            let cost = row.map(|r| r.estimated_cost_usd).unwrap_or(0.0);
            let call_limit = self.limits.call_limit(tier);
            if call_limit > 0 && calls >= call_limit {
                call_blocked = true;
            }
            total_cost += cost;
            tiers.insert(
                tier.as_str().to_string(),
                TierSummary {
                    calls,
                    input_tokens: row.map(|r| r.input_tokens).unwrap_or(0),
                    output_tokens: row.map(|r| r.output_tokens).unwrap_or(0),
                    cost_usd: cost,
                    call_limit,
                },
            );
        }

        let cost_limit = self.limits.daily_cost_limit_usd;
        let cost_blocked = cost_limit > 0.0 && total_cost >= cost_limit;
        let budget_remaining = if cost_limit > 0.0 {
            Some((cost_limit - total_cost).max(0.0))
        } else {
            None
        };

        Ok(DailySummary {
            date: today,
            status: if cost_blocked || call_blocked {
                "sleep_mode".into()
            } else {
                "active".into()
            },
            daily_cost_limit_usd: cost_limit,
            total_cost_usd: total_cost,
            budget_remaining_usd: budget_remaining,
            tiers,
        })
    }
}

// ── Transaction helpers ────────────────────────────────────────────────────

fn ensure_usage_row(tx: &Transaction<'_>, date: &str, tier: LlmTier) -> EngineResult<()> {
    tx.execute(
        "INSERT INTO api_usage (usage_date, tier, call_count, input_tokens, output_tokens,
                                estimated_cost_usd, updated_at)
         VALUES (?1, ?2, 0, 0, 0, 0, ?3)
         ON CONFLICT(usage_date, tier) DO NOTHING",
        params![date, tier.as_str(), ts(Utc::now())],
    )?;
    Ok(())
}

/// (tier call count, total cost across all tiers) for one date.
fn read_counters(
    conn: &rusqlite::Connection,
    date: &str,
    tier: LlmTier,
) -> EngineResult<(i64, f64)> {
    let calls: i64 = conn
        .query_row(
            "SELECT call_count FROM api_usage WHERE usage_date = ?1 AND tier = ?2",
            params![date, tier.as_str()],
            |row| row.get(0),
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(0),
            other => Err(other),
        })?;
    let total_cost: f64 = conn.query_row(
        "SELECT COALESCE(SUM(estimated_cost_usd), 0) FROM api_usage WHERE usage_date = ?1",
        params![date],
        |row| row.get(0),
    )?;
    Ok((calls, total_cost))
}
