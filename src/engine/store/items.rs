use super::{parse_ts, parse_ts_opt, ts, ts_opt, Store};
use super::{bytes_to_f32_vec, f32_vec_to_bytes};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ProcessingStatus, RawItem};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

impl RawItem {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let fetched_at: String = row.get(8)?;
        let status: String = row.get(13)?;
        let embedding: Option<Vec<u8>> = row.get(10)?;
        Ok(RawItem {
            id: row.get(0)?,
            source_id: row.get(1)?,
            external_id: row.get(2)?,
            url: row.get(3)?,
            title: row.get(4)?,
            raw_content: row.get(5)?,
            content_hash: row.get(6)?,
            language: row.get(7)?,
            fetched_at: parse_ts(&fetched_at).unwrap_or_else(Utc::now),
            published_at: parse_ts_opt(row.get(9)?),
            embedding: embedding.map(|blob| bytes_to_f32_vec(&blob)),
            embedding_model: row.get(11)?,
            embedding_generated_at: parse_ts_opt(row.get(12)?),
            processing_status: ProcessingStatus::parse(&status)
                .unwrap_or(ProcessingStatus::Pending),
            error_message: row.get(14)?,
        })
    }
}

const ITEM_COLUMNS: &str = "id, source_id, external_id, url, title, raw_content, content_hash, \
     language, fetched_at, published_at, embedding, embedding_model, \
     embedding_generated_at, processing_status, error_message";

impl Store {
    // ── Raw item CRUD ──────────────────────────────────────────────────

    pub fn insert_raw_item(&self, item: &RawItem) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO raw_items (id, source_id, external_id, url, title, raw_content,
                                    content_hash, language, fetched_at, published_at,
                                    embedding, embedding_model, embedding_generated_at,
                                    processing_status, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                item.id,
                item.source_id,
                item.external_id,
                item.url,
                item.title,
                item.raw_content,
                item.content_hash,
                item.language,
                ts(item.fetched_at),
                ts_opt(item.published_at),
                item.embedding.as_deref().map(f32_vec_to_bytes),
                item.embedding_model,
                ts_opt(item.embedding_generated_at),
                item.processing_status.as_str(),
                item.error_message,
            ],
        )?;
        Ok(())
    }

    /// Insert unless an item with the same content hash already exists inside
    /// the dedup window. Runs check + insert in one transaction so two
    /// collectors racing on the same story store exactly one row.
    pub fn insert_raw_item_if_new(
        &self,
        item: &RawItem,
        window_days: i64,
    ) -> EngineResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let window_start = ts(item.fetched_at - Duration::days(window_days));
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM raw_items
                 WHERE content_hash = ?1 AND fetched_at >= ?2 LIMIT 1",
                params![item.content_hash, window_start],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if existing.is_some() {
            tx.commit()?;
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO raw_items (id, source_id, external_id, url, title, raw_content,
                                    content_hash, language, fetched_at, published_at,
                                    processing_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                item.id,
                item.source_id,
                item.external_id,
                item.url,
                item.title,
                item.raw_content,
                item.content_hash,
                item.language,
                ts(item.fetched_at),
                ts_opt(item.published_at),
                item.processing_status.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_raw_item(&self, id: &str) -> EngineResult<Option<RawItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM raw_items WHERE id = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![id], RawItem::from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ── Worker claims ──────────────────────────────────────────────────

    /// Claim up to `limit` pending items: atomically flip them to
    /// `processing` (clearing any stale error message) and return them.
    /// Concurrent workers each receive a disjoint set.
    pub fn claim_pending_items(&self, limit: usize) -> EngineResult<Vec<RawItem>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM raw_items WHERE processing_status = 'pending'
                 ORDER BY fetched_at ASC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let now = ts(Utc::now());
        for id in &ids {
            tx.execute(
                "UPDATE raw_items
                 SET processing_status = 'processing', processing_started_at = ?2,
                     error_message = NULL
                 WHERE id = ?1 AND processing_status = 'pending'",
                params![id, now],
            )?;
        }
        let mut items = Vec::with_capacity(ids.len());
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM raw_items WHERE id = ?1 LIMIT 1"
            ))?;
            for id in &ids {
                let item = stmt.query_row(params![id], RawItem::from_row)?;
                if item.processing_status == ProcessingStatus::Processing {
                    items.push(item);
                }
            }
        }
        tx.commit()?;
        Ok(items)
    }

    pub fn set_item_status(
        &self,
        id: &str,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE raw_items SET processing_status = ?2, error_message = ?3 WHERE id = ?1",
            params![id, status.as_str(), error_message],
        )?;
        Ok(())
    }

    /// Reset `processing` items whose claim is older than the threshold back
    /// to `pending`. Returns the number of rows reset.
    pub fn reap_stale_processing_items(&self, older_than: DateTime<Utc>) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE raw_items
             SET processing_status = 'pending', processing_started_at = NULL
             WHERE processing_status = 'processing'
               AND (processing_started_at IS NULL OR processing_started_at < ?1)",
            params![ts(older_than)],
        )?;
        Ok(changed)
    }

    pub fn count_pending_items(&self) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM raw_items WHERE processing_status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Embedding persistence ──────────────────────────────────────────

    pub fn update_item_embedding(
        &self,
        id: &str,
        embedding: &[f32],
        model: &str,
        generated_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE raw_items
             SET embedding = ?2, embedding_model = ?3, embedding_generated_at = ?4
             WHERE id = ?1",
            params![id, f32_vec_to_bytes(embedding), model, ts(generated_at)],
        )?;
        Ok(())
    }

    pub fn items_without_embedding(&self, limit: usize) -> EngineResult<Vec<RawItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM raw_items
             WHERE embedding IS NULL AND raw_content <> ''
             ORDER BY fetched_at ASC LIMIT ?1"
        ))?;
        let items = stmt
            .query_map(params![limit as i64], RawItem::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Pending items, oldest first, without claiming them.
    pub fn list_pending_items(&self, limit: usize) -> EngineResult<Vec<RawItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM raw_items
             WHERE processing_status = 'pending'
             ORDER BY fetched_at ASC LIMIT ?1"
        ))?;
        let items = stmt
            .query_map(params![limit as i64], RawItem::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Items not yet linked to any event, oldest first.
    pub fn items_without_event(&self, limit: usize) -> EngineResult<Vec<RawItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM raw_items
             WHERE id NOT IN (SELECT item_id FROM event_items)
             ORDER BY fetched_at ASC LIMIT ?1"
        ))?;
        let items = stmt
            .query_map(params![limit as i64], RawItem::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    // ── Dedup lookups ──────────────────────────────────────────────────

    /// Exact-field duplicate lookup inside the dedup window.
    pub fn find_item_by_field(
        &self,
        column: ItemMatchColumn,
        value: &str,
        window_start: DateTime<Utc>,
        exclude_item_id: Option<&str>,
    ) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id FROM raw_items
             WHERE {} = ?1 AND fetched_at >= ?2 AND id <> ?3
             ORDER BY fetched_at ASC LIMIT 1",
            column.column_name()
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(
            params![value, ts(window_start), exclude_item_id.unwrap_or("")],
            |row| row.get::<_, String>(0),
        )?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Candidate (id, embedding) pairs for embedding-similarity dedup:
    /// same embedding model, inside the window, excluding the probe item.
    pub fn embedding_dedup_candidates(
        &self,
        embedding_model: &str,
        window_start: DateTime<Utc>,
        exclude_item_id: Option<&str>,
    ) -> EngineResult<Vec<(String, Vec<f32>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, embedding FROM raw_items
             WHERE embedding IS NOT NULL AND embedding_model = ?1
               AND fetched_at >= ?2 AND id <> ?3",
        )?;
        let rows = stmt
            .query_map(
                params![embedding_model, ts(window_start), exclude_item_id.unwrap_or("")],
                |row| {
                    let id: String = row.get(0)?;
                    let blob: Vec<u8> = row.get(1)?;
                    Ok((id, bytes_to_f32_vec(&blob)))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Columns usable for exact duplicate matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemMatchColumn {
    ExternalId,
    Url,
    ContentHash,
}

impl ItemMatchColumn {
    fn column_name(&self) -> &'static str {
        match self {
            ItemMatchColumn::ExternalId => "external_id",
            ItemMatchColumn::Url => "url",
            ItemMatchColumn::ContentHash => "content_hash",
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::super::sources::test_support::sample_source;
    use super::*;
    use crate::atoms::types::SourceType;
    use sha2::{Digest, Sha256};
    use uuid::Uuid;

    pub fn sample_item(store: &Store, content: &str) -> RawItem {
        let source = sample_source(SourceType::Rss);
        store.insert_source(&source).unwrap();
        item_for_source(&source.id, content)
    }

    pub fn item_for_source(source_id: &str, content: &str) -> RawItem {
        let digest = Sha256::digest(content.as_bytes());
        let content_hash: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        RawItem {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            external_id: None,
            url: None,
            title: Some("Sample headline".into()),
            raw_content: content.to_string(),
            content_hash,
            language: Some("en".into()),
            fetched_at: Utc::now(),
            published_at: None,
            embedding: None,
            embedding_model: None,
            embedding_generated_at: None,
            processing_status: ProcessingStatus::Pending,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{item_for_source, sample_item};
    use super::*;

    #[test]
    fn item_round_trip_with_embedding() {
        let store = Store::open_in_memory().unwrap();
        let mut item = sample_item(&store, "troop movement reported near the border");
        item.embedding = Some(vec![0.1, 0.2, 0.3]);
        item.embedding_model = Some("text-embedding-3-small".into());
        item.embedding_generated_at = Some(Utc::now());
        store.insert_raw_item(&item).unwrap();

        let loaded = store.get_raw_item(&item.id).unwrap().unwrap();
        assert_eq!(loaded.content_hash, item.content_hash);
        assert_eq!(loaded.embedding.as_deref(), Some(&[0.1f32, 0.2, 0.3][..]));
        assert_eq!(loaded.processing_status, ProcessingStatus::Pending);
    }

    #[test]
    fn duplicate_content_hash_within_window_stores_once() {
        let store = Store::open_in_memory().unwrap();
        let item = sample_item(&store, "identical wire copy");
        assert!(store.insert_raw_item_if_new(&item, 7).unwrap());

        let mut second = item_for_source(&item.source_id, "identical wire copy");
        second.fetched_at = item.fetched_at;
        assert!(!store.insert_raw_item_if_new(&second, 7).unwrap());

        let count: i64 = {
            let conn = store.conn.lock();
            conn.query_row(
                "SELECT COUNT(*) FROM raw_items WHERE content_hash = ?1",
                params![item.content_hash],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(count, 1);
    }

    #[test]
    fn claims_are_disjoint_and_flip_status() {
        let store = Store::open_in_memory().unwrap();
        let first = sample_item(&store, "first pending item");
        let second = item_for_source(&first.source_id, "second pending item");
        store.insert_raw_item(&first).unwrap();
        store.insert_raw_item(&second).unwrap();

        let claimed = store.claim_pending_items(1).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].processing_status, ProcessingStatus::Processing);

        let rest = store.claim_pending_items(10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_ne!(rest[0].id, claimed[0].id);

        assert!(store.claim_pending_items(10).unwrap().is_empty());
    }

    #[test]
    fn reaper_resets_only_stale_claims() {
        let store = Store::open_in_memory().unwrap();
        let item = sample_item(&store, "stuck in processing");
        store.insert_raw_item(&item).unwrap();
        store.claim_pending_items(10).unwrap();

        // Claim is fresh, so a cutoff in the past resets nothing.
        let reset = store
            .reap_stale_processing_items(Utc::now() - chrono::Duration::minutes(30))
            .unwrap();
        assert_eq!(reset, 0);

        let reset = store
            .reap_stale_processing_items(Utc::now() + chrono::Duration::minutes(1))
            .unwrap();
        assert_eq!(reset, 1);
        let loaded = store.get_raw_item(&item.id).unwrap().unwrap();
        assert_eq!(loaded.processing_status, ProcessingStatus::Pending);
    }

    #[test]
    fn exact_lookup_respects_window_and_exclusion() {
        let store = Store::open_in_memory().unwrap();
        let mut item = sample_item(&store, "dated story");
        item.fetched_at = Utc::now() - chrono::Duration::days(10);
        store.insert_raw_item(&item).unwrap();

        let recent_window = Utc::now() - chrono::Duration::days(7);
        let hit = store
            .find_item_by_field(ItemMatchColumn::ContentHash, &item.content_hash, recent_window, None)
            .unwrap();
        assert!(hit.is_none(), "outside the window must not match");

        let wide_window = Utc::now() - chrono::Duration::days(30);
        let hit = store
            .find_item_by_field(ItemMatchColumn::ContentHash, &item.content_hash, wide_window, None)
            .unwrap();
        assert_eq!(hit.as_deref(), Some(item.id.as_str()));

        let excluded = store
            .find_item_by_field(
                ItemMatchColumn::ContentHash,
                &item.content_hash,
                wide_window,
                Some(&item.id),
            )
            .unwrap();
        assert!(excluded.is_none(), "self-exclusion must hide the probe item");
    }
}
