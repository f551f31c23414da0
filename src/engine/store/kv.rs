// Runtime coordination tables: the cross-worker semantic cache, the
// dead-letter list, and a small key/value store for worker heartbeats.

use super::{parse_ts, ts, Store};
use crate::atoms::constants::DEAD_LETTER_MAX_ITEMS;
use crate::atoms::error::EngineResult;
use chrono::{DateTime, Utc};
use rusqlite::params;

impl Store {
    // ── Semantic cache rows ────────────────────────────────────────────

    /// Read a cache entry; expired entries count as misses.
    pub fn semantic_cache_get(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT value, expires_at FROM semantic_cache WHERE cache_key = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![cache_key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        match rows.next() {
            Some(row) => {
                let (value, expires_at) = row?;
                match parse_ts(&expires_at) {
                    Some(expiry) if expiry > now => Ok(Some(value)),
                    _ => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    /// Upsert a cache entry, then trim the stage to `max_entries` by
    /// evicting the least recently touched keys.
    pub fn semantic_cache_put(
        &self,
        cache_key: &str,
        stage: &str,
        value: &str,
        ttl_seconds: i64,
        max_entries: usize,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO semantic_cache (cache_key, stage, value, expires_at, touched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cache_key) DO UPDATE SET
                 value = excluded.value,
                 expires_at = excluded.expires_at,
                 touched_at = excluded.touched_at",
            params![
                cache_key,
                stage,
                value,
                ts(now + chrono::Duration::seconds(ttl_seconds)),
                ts(now),
            ],
        )?;
        tx.execute(
            "DELETE FROM semantic_cache
             WHERE stage = ?1 AND cache_key NOT IN (
                 SELECT cache_key FROM semantic_cache
                 WHERE stage = ?1 ORDER BY touched_at DESC LIMIT ?2
             )",
            params![stage, max_entries as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop expired cache entries. Returns the number removed.
    pub fn semantic_cache_prune(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM semantic_cache WHERE expires_at <= ?1",
            params![ts(now)],
        )?;
        Ok(removed)
    }

    // ── Dead letters ───────────────────────────────────────────────────

    /// Append a dead-letter payload, keeping only the newest entries.
    pub fn push_dead_letter(&self, task_name: &str, payload: &serde_json::Value) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO dead_letters (task_name, payload_json, failed_at)
             VALUES (?1, ?2, ?3)",
            params![task_name, serde_json::to_string(payload)?, ts(Utc::now())],
        )?;
        tx.execute(
            "DELETE FROM dead_letters WHERE id NOT IN (
                 SELECT id FROM dead_letters ORDER BY id DESC LIMIT ?1
             )",
            params![DEAD_LETTER_MAX_ITEMS as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Newest dead letters first.
    pub fn list_dead_letters(
        &self,
        limit: usize,
    ) -> EngineResult<Vec<(String, serde_json::Value)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_name, payload_json FROM dead_letters ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let task: String = row.get(0)?;
                let payload: String = row.get(1)?;
                Ok((task, payload))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|(task, payload)| {
                let value =
                    serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null);
                (task, value)
            })
            .collect())
    }

    // ── Runtime key/value ──────────────────────────────────────────────

    pub fn kv_set(&self, key: &str, value: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO runtime_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> EngineResult<Option<(String, DateTime<Utc>)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT value, updated_at FROM runtime_kv WHERE key = ?1 LIMIT 1")?;
        let mut rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        match rows.next() {
            Some(row) => {
                let (value, updated_at) = row?;
                Ok(Some((value, parse_ts(&updated_at).unwrap_or_else(Utc::now))))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_respects_ttl() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .semantic_cache_put("k1", "tier1", "{\"items\":[]}", 60, 10, now)
            .unwrap();

        assert!(store.semantic_cache_get("k1", now).unwrap().is_some());
        let later = now + chrono::Duration::seconds(61);
        assert!(store.semantic_cache_get("k1", later).unwrap().is_none());
        assert_eq!(store.semantic_cache_prune(later).unwrap(), 1);
    }

    #[test]
    fn cache_trims_to_cardinality_oldest_first() {
        let store = Store::open_in_memory().unwrap();
        let base = Utc::now();
        for i in 0..5 {
            let key = format!("k{i}");
            let touched = base + chrono::Duration::seconds(i);
            store
                .semantic_cache_put(&key, "tier1", "v", 3600, 3, touched)
                .unwrap();
        }
        // Only the three most recently touched keys survive.
        assert!(store.semantic_cache_get("k0", base).unwrap().is_none());
        assert!(store.semantic_cache_get("k1", base).unwrap().is_none());
        assert!(store.semantic_cache_get("k4", base).unwrap().is_some());
    }

    #[test]
    fn dead_letters_are_trimmed_and_newest_first() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..3 {
            store
                .push_dead_letter("process_pending_items", &serde_json::json!({ "run": i }))
                .unwrap();
        }
        let letters = store.list_dead_letters(2).unwrap();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].1["run"], 2);
        assert_eq!(letters[1].1["run"], 1);
    }

    #[test]
    fn kv_upserts() {
        let store = Store::open_in_memory().unwrap();
        store.kv_set("worker:heartbeat", "alive").unwrap();
        store.kv_set("worker:heartbeat", "alive-2").unwrap();
        let (value, _at) = store.kv_get("worker:heartbeat").unwrap().unwrap();
        assert_eq!(value, "alive-2");
        assert!(store.kv_get("missing").unwrap().is_none());
    }
}
