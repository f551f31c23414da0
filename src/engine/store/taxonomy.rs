use super::{parse_ts, ts, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{TaxonomyGap, TaxonomyGapReason};
use chrono::Utc;
use rusqlite::params;

impl TaxonomyGap {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let reason: String = row.get(1)?;
        let payload_json: String = row.get(5)?;
        let created_at: String = row.get(6)?;
        Ok(TaxonomyGap {
            id: row.get(0)?,
            reason: TaxonomyGapReason::parse(&reason)
                .unwrap_or(TaxonomyGapReason::UnknownTrendId),
            trend_id: row.get(2)?,
            signal_type: row.get(3)?,
            event_id: row.get(4)?,
            payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        })
    }
}

impl Store {
    pub fn insert_taxonomy_gap(&self, gap: &TaxonomyGap) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO taxonomy_gaps (id, reason, trend_id, signal_type, event_id,
                                        payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                gap.id,
                gap.reason.as_str(),
                gap.trend_id,
                gap.signal_type,
                gap.event_id,
                serde_json::to_string(&gap.payload)?,
                ts(gap.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_taxonomy_gaps(&self, limit: usize) -> EngineResult<Vec<TaxonomyGap>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, reason, trend_id, signal_type, event_id, payload_json, created_at
             FROM taxonomy_gaps ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], TaxonomyGap::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
