use super::Store;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ApiUsage, LlmTier};
use rusqlite::params;

impl ApiUsage {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let tier: String = row.get(1)?;
        Ok(ApiUsage {
            usage_date: row.get(0)?,
            tier: LlmTier::parse(&tier).unwrap_or(LlmTier::Tier1),
            call_count: row.get(2)?,
            input_tokens: row.get(3)?,
            output_tokens: row.get(4)?,
            estimated_cost_usd: row.get(5)?,
        })
    }
}

impl Store {
    /// All usage rows for one UTC date, ordered by tier.
    pub fn usage_rows_for_date(&self, usage_date: &str) -> EngineResult<Vec<ApiUsage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT usage_date, tier, call_count, input_tokens, output_tokens,
                    estimated_cost_usd
             FROM api_usage WHERE usage_date = ?1 ORDER BY tier ASC",
        )?;
        let rows = stmt
            .query_map(params![usage_date], ApiUsage::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
