use super::{parse_ts, parse_ts_opt, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::types::TrendEvidence;
use chrono::Utc;
use rusqlite::params;

impl TrendEvidence {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let factors_json: String = row.get(5)?;
        let created_at: String = row.get(10)?;
        Ok(TrendEvidence {
            id: row.get(0)?,
            trend_id: row.get(1)?,
            event_id: row.get(2)?,
            signal_type: row.get(3)?,
            delta_log_odds: row.get(4)?,
            factors: serde_json::from_str(&factors_json).unwrap_or(serde_json::Value::Null),
            reasoning: row.get(6)?,
            is_invalidated: row.get::<_, i64>(7)? != 0,
            invalidated_at: parse_ts_opt(row.get(8)?),
            invalidation_feedback_id: row.get(9)?,
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        })
    }
}

pub(crate) const EVIDENCE_COLUMNS: &str = "id, trend_id, event_id, signal_type, delta_log_odds, \
     factors_json, reasoning, is_invalidated, invalidated_at, \
     invalidation_feedback_id, created_at";

impl Store {
    /// Evidence rows for one event, oldest first.
    pub fn list_event_evidence(&self, event_id: &str) -> EngineResult<Vec<TrendEvidence>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVIDENCE_COLUMNS} FROM trend_evidence
             WHERE event_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![event_id], TrendEvidence::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Evidence rows for one trend, newest first.
    pub fn list_trend_evidence(
        &self,
        trend_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<TrendEvidence>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVIDENCE_COLUMNS} FROM trend_evidence
             WHERE trend_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![trend_id, limit as i64], TrendEvidence::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Count of prior (non-invalidated) evidence rows for a (trend, event)
    /// pair — drives novelty decay.
    pub fn count_prior_evidence(&self, trend_id: &str, event_id: &str) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM trend_evidence
             WHERE trend_id = ?1 AND event_id = ?2 AND is_invalidated = 0",
            params![trend_id, event_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
