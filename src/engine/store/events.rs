use super::{bytes_to_f32_vec, f32_vec_to_bytes, parse_ts, parse_ts_opt, ts, ts_opt, Store};
use crate::atoms::constants::{ARCHIVE_DAYS, FADING_HOURS};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{Event, EventLifecycle, ExtractedClaims};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

impl Event {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let embedding: Option<Vec<u8>> = row.get(2)?;
        let first_seen: String = row.get(7)?;
        let last_mention: String = row.get(8)?;
        let lifecycle: String = row.get(10)?;
        let who_json: Option<String> = row.get(12)?;
        let categories_json: Option<String> = row.get(16)?;
        let claims_json: Option<String> = row.get(17)?;
        Ok(Event {
            id: row.get(0)?,
            canonical_summary: row.get(1)?,
            embedding: embedding.map(|blob| bytes_to_f32_vec(&blob)),
            embedding_model: row.get(3)?,
            embedding_generated_at: parse_ts_opt(row.get(4)?),
            source_count: row.get(5)?,
            unique_source_count: row.get(6)?,
            first_seen_at: parse_ts(&first_seen).unwrap_or_else(Utc::now),
            last_mention_at: parse_ts(&last_mention).unwrap_or_else(Utc::now),
            confirmed_at: parse_ts_opt(row.get(9)?),
            lifecycle_status: EventLifecycle::parse(&lifecycle)
                .unwrap_or(EventLifecycle::Emerging),
            primary_item_id: row.get(11)?,
            extracted_who: who_json
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default(),
            extracted_what: row.get(13)?,
            extracted_where: row.get(14)?,
            extracted_when: parse_ts_opt(row.get(15)?),
            categories: categories_json
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default(),
            extracted_claims: claims_json.and_then(|json| serde_json::from_str(&json).ok()),
            has_contradictions: row.get::<_, i64>(18)? != 0,
        })
    }
}

const EVENT_COLUMNS: &str = "id, canonical_summary, embedding, embedding_model, \
     embedding_generated_at, source_count, unique_source_count, first_seen_at, \
     last_mention_at, confirmed_at, lifecycle_status, primary_item_id, \
     extracted_who_json, extracted_what, extracted_where, extracted_when, \
     categories_json, extracted_claims_json, has_contradictions";

impl Store {
    // ── Event CRUD ─────────────────────────────────────────────────────

    pub fn insert_event(&self, event: &Event) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (id, canonical_summary, embedding, embedding_model,
                                 embedding_generated_at, source_count, unique_source_count,
                                 first_seen_at, last_mention_at, confirmed_at,
                                 lifecycle_status, primary_item_id, extracted_who_json,
                                 extracted_what, extracted_where, extracted_when,
                                 categories_json, extracted_claims_json, has_contradictions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                event.id,
                event.canonical_summary,
                event.embedding.as_deref().map(f32_vec_to_bytes),
                event.embedding_model,
                ts_opt(event.embedding_generated_at),
                event.source_count,
                event.unique_source_count,
                ts(event.first_seen_at),
                ts(event.last_mention_at),
                ts_opt(event.confirmed_at),
                event.lifecycle_status.as_str(),
                event.primary_item_id,
                serde_json::to_string(&event.extracted_who)?,
                event.extracted_what,
                event.extracted_where,
                ts_opt(event.extracted_when),
                serde_json::to_string(&event.categories)?,
                event
                    .extracted_claims
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                event.has_contradictions as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_event(&self, id: &str) -> EngineResult<Option<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![id], Event::from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Write back the merge-mutable fields of an event.
    pub fn update_event_merge_fields(&self, event: &Event) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE events
             SET canonical_summary = ?2, embedding = ?3, embedding_model = ?4,
                 embedding_generated_at = ?5, source_count = ?6,
                 unique_source_count = ?7, last_mention_at = ?8, confirmed_at = ?9,
                 lifecycle_status = ?10, primary_item_id = ?11
             WHERE id = ?1",
            params![
                event.id,
                event.canonical_summary,
                event.embedding.as_deref().map(f32_vec_to_bytes),
                event.embedding_model,
                ts_opt(event.embedding_generated_at),
                event.source_count,
                event.unique_source_count,
                ts(event.last_mention_at),
                ts_opt(event.confirmed_at),
                event.lifecycle_status.as_str(),
                event.primary_item_id,
            ],
        )?;
        Ok(())
    }

    /// Persist the tier-2 extraction onto an event.
    #[allow(clippy::too_many_arguments)]
    pub fn update_event_extraction(
        &self,
        event_id: &str,
        canonical_summary: &str,
        extracted_who: &[String],
        extracted_what: &str,
        extracted_where: Option<&str>,
        extracted_when: Option<DateTime<Utc>>,
        categories: &[String],
        claims: &ExtractedClaims,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE events
             SET canonical_summary = ?2, extracted_who_json = ?3, extracted_what = ?4,
                 extracted_where = ?5, extracted_when = ?6, categories_json = ?7,
                 extracted_claims_json = ?8
             WHERE id = ?1",
            params![
                event_id,
                canonical_summary,
                serde_json::to_string(extracted_who)?,
                extracted_what,
                extracted_where,
                ts_opt(extracted_when),
                serde_json::to_string(categories)?,
                serde_json::to_string(claims)?,
            ],
        )?;
        Ok(())
    }

    pub fn set_event_lifecycle(
        &self,
        event_id: &str,
        lifecycle: EventLifecycle,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE events SET lifecycle_status = ?2 WHERE id = ?1",
            params![event_id, lifecycle.as_str()],
        )?;
        Ok(())
    }

    pub fn update_event_embedding(
        &self,
        id: &str,
        embedding: &[f32],
        model: &str,
        generated_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE events
             SET embedding = ?2, embedding_model = ?3, embedding_generated_at = ?4
             WHERE id = ?1",
            params![id, f32_vec_to_bytes(embedding), model, ts(generated_at)],
        )?;
        Ok(())
    }

    pub fn events_without_embedding(&self, limit: usize) -> EngineResult<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE embedding IS NULL AND canonical_summary <> ''
             ORDER BY first_seen_at ASC LIMIT ?1"
        ))?;
        let events = stmt
            .query_map(params![limit as i64], Event::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    // ── Item linkage ───────────────────────────────────────────────────

    /// Link an item to an event. Returns false when the item is already
    /// linked (unique constraint on item_id) — the caller re-reads linkage.
    pub fn link_event_item(&self, event_id: &str, item_id: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO event_items (event_id, item_id, added_at)
             VALUES (?1, ?2, ?3)",
            params![event_id, item_id, ts(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    pub fn find_event_id_for_item(&self, item_id: &str) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT event_id FROM event_items WHERE item_id = ?1 LIMIT 1")?;
        let mut rows = stmt.query_map(params![item_id], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn count_event_items(&self, event_id: &str) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM event_items WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_unique_event_sources(&self, event_id: &str) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(DISTINCT i.source_id)
             FROM event_items e JOIN raw_items i ON i.id = e.item_id
             WHERE e.event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// (source_id, source_tier, reporting_type) for every linked item's
    /// source — the input to corroboration scoring.
    pub fn event_source_rows(
        &self,
        event_id: &str,
    ) -> EngineResult<Vec<(String, Option<String>, Option<String>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.source_tier, s.reporting_type
             FROM event_items e
             JOIN raw_items i ON i.id = e.item_id
             JOIN sources s ON s.id = i.source_id
             WHERE e.event_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Latest linked item texts for tier-2 context, newest first.
    pub fn event_context_rows(
        &self,
        event_id: &str,
        max_items: usize,
    ) -> EngineResult<Vec<(Option<String>, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT i.title, i.raw_content
             FROM event_items e JOIN raw_items i ON i.id = e.item_id
             WHERE e.event_id = ?1
             ORDER BY e.added_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![event_id, max_items as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Clustering support ─────────────────────────────────────────────

    /// Candidate (id, embedding) pairs for clustering: events with the same
    /// embedding model mentioned inside the time window.
    pub fn cluster_candidates(
        &self,
        embedding_model: &str,
        window_start: DateTime<Utc>,
    ) -> EngineResult<Vec<(String, Vec<f32>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, embedding FROM events
             WHERE embedding IS NOT NULL AND embedding_model = ?1
               AND last_mention_at >= ?2",
        )?;
        let rows = stmt
            .query_map(params![embedding_model, ts(window_start)], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, bytes_to_f32_vec(&blob)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Events that still lack tier-2 extraction.
    pub fn events_without_extraction(&self, limit: usize) -> EngineResult<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE extracted_what IS NULL
             ORDER BY first_seen_at ASC LIMIT ?1"
        ))?;
        let events = stmt
            .query_map(params![limit as i64], Event::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    // ── Lifecycle decay ────────────────────────────────────────────────

    /// Periodic decay check: confirmed events unmentioned for 48h start
    /// fading; fading events unmentioned for 7d are archived.
    /// Returns (confirmed_to_fading, fading_to_archived).
    pub fn run_event_lifecycle_decay(&self, now: DateTime<Utc>) -> EngineResult<(usize, usize)> {
        let conn = self.conn.lock();
        let fading_threshold = ts(now - Duration::hours(FADING_HOURS));
        let archive_threshold = ts(now - Duration::days(ARCHIVE_DAYS));

        let to_fading = conn.execute(
            "UPDATE events SET lifecycle_status = 'fading'
             WHERE lifecycle_status = 'confirmed' AND last_mention_at < ?1",
            params![fading_threshold],
        )?;
        let to_archived = conn.execute(
            "UPDATE events SET lifecycle_status = 'archived'
             WHERE lifecycle_status = 'fading' AND last_mention_at < ?1",
            params![archive_threshold],
        )?;
        Ok((to_fading, to_archived))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    pub fn sample_event(summary: &str) -> Event {
        let now = Utc::now();
        Event {
            id: Uuid::new_v4().to_string(),
            canonical_summary: summary.to_string(),
            embedding: None,
            embedding_model: None,
            embedding_generated_at: None,
            source_count: 1,
            unique_source_count: 1,
            first_seen_at: now,
            last_mention_at: now,
            confirmed_at: None,
            lifecycle_status: EventLifecycle::Emerging,
            primary_item_id: None,
            extracted_who: Vec::new(),
            extracted_what: None,
            extracted_where: None,
            extracted_when: None,
            categories: Vec::new(),
            extracted_claims: None,
            has_contradictions: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::items::test_support::sample_item;
    use super::test_support::sample_event;
    use super::*;

    #[test]
    fn event_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let mut event = sample_event("Border incident reported");
        event.embedding = Some(vec![0.5, -0.5]);
        event.embedding_model = Some("text-embedding-3-small".into());
        store.insert_event(&event).unwrap();

        let loaded = store.get_event(&event.id).unwrap().unwrap();
        assert_eq!(loaded.canonical_summary, "Border incident reported");
        assert_eq!(loaded.lifecycle_status, EventLifecycle::Emerging);
        assert_eq!(loaded.embedding.as_deref(), Some(&[0.5f32, -0.5][..]));
        assert!(!loaded.has_contradictions);
    }

    #[test]
    fn item_links_are_unique_per_item() {
        let store = Store::open_in_memory().unwrap();
        let event_a = sample_event("Event A");
        let event_b = sample_event("Event B");
        store.insert_event(&event_a).unwrap();
        store.insert_event(&event_b).unwrap();
        let item = sample_item(&store, "shared item");
        store.insert_raw_item(&item).unwrap();

        assert!(store.link_event_item(&event_a.id, &item.id).unwrap());
        // Second link attempt loses the race and reads back the winner.
        assert!(!store.link_event_item(&event_b.id, &item.id).unwrap());
        assert_eq!(
            store.find_event_id_for_item(&item.id).unwrap().as_deref(),
            Some(event_a.id.as_str())
        );
        assert_eq!(store.count_event_items(&event_a.id).unwrap(), 1);
    }

    #[test]
    fn lifecycle_decay_transitions() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        let mut confirmed_stale = sample_event("confirmed, stale");
        confirmed_stale.lifecycle_status = EventLifecycle::Confirmed;
        confirmed_stale.last_mention_at = now - Duration::hours(FADING_HOURS + 1);
        store.insert_event(&confirmed_stale).unwrap();

        let mut fading_old = sample_event("fading, very old");
        fading_old.lifecycle_status = EventLifecycle::Fading;
        fading_old.last_mention_at = now - Duration::days(ARCHIVE_DAYS + 1);
        store.insert_event(&fading_old).unwrap();

        let mut confirmed_fresh = sample_event("confirmed, fresh");
        confirmed_fresh.lifecycle_status = EventLifecycle::Confirmed;
        confirmed_fresh.last_mention_at = now;
        store.insert_event(&confirmed_fresh).unwrap();

        let (to_fading, to_archived) = store.run_event_lifecycle_decay(now).unwrap();
        assert_eq!(to_fading, 1);
        assert_eq!(to_archived, 1);

        let fresh = store.get_event(&confirmed_fresh.id).unwrap().unwrap();
        assert_eq!(fresh.lifecycle_status, EventLifecycle::Confirmed);
    }

    #[test]
    fn extraction_update_persists_claims() {
        let store = Store::open_in_memory().unwrap();
        let event = sample_event("raw summary");
        store.insert_event(&event).unwrap();

        let claims = ExtractedClaims {
            claims: vec!["Claim one".into()],
            trend_impacts: Vec::new(),
        };
        store
            .update_event_extraction(
                &event.id,
                "Refined summary",
                &["Ministry of Defense".to_string()],
                "Force buildup",
                Some("Border region"),
                None,
                &["security".to_string()],
                &claims,
            )
            .unwrap();

        let loaded = store.get_event(&event.id).unwrap().unwrap();
        assert_eq!(loaded.canonical_summary, "Refined summary");
        assert_eq!(loaded.extracted_what.as_deref(), Some("Force buildup"));
        assert_eq!(loaded.extracted_who, vec!["Ministry of Defense".to_string()]);
        assert_eq!(loaded.extracted_claims.unwrap().claims, vec!["Claim one".to_string()]);
        assert!(store.events_without_extraction(10).unwrap().is_empty());
    }
}
