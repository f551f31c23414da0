use super::{parse_ts_opt, ts, ts_opt, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Source, SourceType};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl Source {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let source_type: String = row.get(2)?;
        let config_json: String = row.get(12)?;
        Ok(Source {
            id: row.get(0)?,
            name: row.get(1)?,
            source_type: SourceType::parse(&source_type).unwrap_or(SourceType::Api),
            url: row.get(3)?,
            credibility_score: row.get(4)?,
            source_tier: row.get(5)?,
            reporting_type: row.get(6)?,
            is_active: row.get::<_, i64>(7)? != 0,
            last_fetched_at: parse_ts_opt(row.get(8)?),
            ingestion_window_end_at: parse_ts_opt(row.get(9)?),
            error_count: row.get(10)?,
            last_error: row.get(11)?,
            config: serde_json::from_str(&config_json).unwrap_or(serde_json::Value::Null),
        })
    }
}

const SOURCE_COLUMNS: &str = "id, name, source_type, url, credibility_score, source_tier, \
     reporting_type, is_active, last_fetched_at, ingestion_window_end_at, \
     error_count, last_error, config_json";

impl Store {
    // ── Source CRUD ────────────────────────────────────────────────────

    pub fn insert_source(&self, source: &Source) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sources (id, name, source_type, url, credibility_score, source_tier,
                                  reporting_type, is_active, last_fetched_at,
                                  ingestion_window_end_at, error_count, last_error,
                                  config_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                source.id,
                source.name,
                source.source_type.as_str(),
                source.url,
                source.credibility_score,
                source.source_tier,
                source.reporting_type,
                source.is_active as i64,
                ts_opt(source.last_fetched_at),
                ts_opt(source.ingestion_window_end_at),
                source.error_count,
                source.last_error,
                serde_json::to_string(&source.config)?,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_source(&self, id: &str) -> EngineResult<Option<Source>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![id], Source::from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_active_sources(&self) -> EngineResult<Vec<Source>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE is_active = 1
             ORDER BY source_type ASC, name ASC"
        ))?;
        let sources = stmt
            .query_map([], Source::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sources)
    }

    /// Record a successful collection: refresh the fetch time, advance the
    /// ingestion watermark, and clear the error streak.
    pub fn record_source_success(
        &self,
        id: &str,
        fetched_at: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sources
             SET last_fetched_at = ?2, ingestion_window_end_at = ?3,
                 error_count = 0, last_error = NULL
             WHERE id = ?1",
            params![id, ts(fetched_at), ts(window_end)],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found(format!("source '{id}'")));
        }
        Ok(())
    }

    /// Record a transient collection failure.
    pub fn record_source_error(&self, id: &str, error: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sources SET error_count = error_count + 1, last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found(format!("source '{id}'")));
        }
        Ok(())
    }

    /// The (credibility, tier, reporting_type) of the source behind an item.
    pub fn item_source_fields(
        &self,
        item_id: &str,
    ) -> EngineResult<Option<(f64, Option<String>, Option<String>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.credibility_score, s.source_tier, s.reporting_type
             FROM sources s JOIN raw_items i ON i.source_id = s.id
             WHERE i.id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![item_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    pub fn sample_source(source_type: SourceType) -> Source {
        Source {
            id: Uuid::new_v4().to_string(),
            name: format!("source-{}", &Uuid::new_v4().to_string()[..8]),
            source_type,
            url: Some("https://example.org/feed".into()),
            credibility_score: 0.8,
            source_tier: Some("wire".into()),
            reporting_type: Some("firsthand".into()),
            is_active: true,
            last_fetched_at: None,
            ingestion_window_end_at: None,
            error_count: 0,
            last_error: None,
            config: serde_json::json!({}),
        }
    }
}
