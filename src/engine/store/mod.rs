// Horadus — Engine Store
// All persistent state lives in one SQLite database behind a Mutex'd
// connection. Cross-worker coordination (item claims, budgets, caches,
// dead letters) goes through this store; per-process caches stay in the
// services that own them.
//
// Module layout:
//   schema     — idempotent migrations
//   vectors    — f32 ↔ BLOB codecs
//   sources    — source CRUD + fetch bookkeeping
//   items      — raw item CRUD, claims, reaper, dedup lookups
//   events     — events, item links, context, lifecycle decay
//   trends     — trend CRUD
//   evidence   — trend evidence reads (writes happen inside engine txns)
//   snapshots  — append-only log-odds time series + downsampled history
//   outcomes   — calibration outcome rows
//   usage      — api usage ledger reads
//   feedback   — human feedback + suppression lookup
//   taxonomy   — taxonomy gap audit rows
//   kv         — semantic cache, dead letters, runtime key/value

use crate::atoms::error::EngineResult;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

mod schema;
pub(crate) mod vectors;

mod events;
mod evidence;
mod feedback;
mod items;
mod kv;
mod outcomes;
mod snapshots;
mod sources;
mod taxonomy;
mod trends;
mod usage;

pub use items::ItemMatchColumn;
pub use snapshots::SnapshotBucket;
pub use vectors::{bytes_to_f32_vec, f32_vec_to_bytes};

/// Thread-safe database wrapper.
pub struct Store {
    /// The SQLite connection, protected by a Mutex.
    /// `pub` so engine services can run multi-statement transactions.
    pub conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> EngineResult<Self> {
        info!("[store] Opening engine store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }
}

// ── Timestamp codecs ───────────────────────────────────────────────────────
// Timestamps are stored as fixed-precision RFC-3339 UTC text so that
// lexicographic ordering in SQL matches chronological ordering.

pub(crate) fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_opt(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(ts)
}

pub(crate) fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn parse_ts_opt(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_round_trip_and_sort() {
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 1).unwrap();
        assert_eq!(parse_ts(&ts(early)), Some(early));
        assert!(ts(early) < ts(late));
    }

    #[test]
    fn open_in_memory_runs_migrations_twice() {
        let store = Store::open_in_memory().unwrap();
        // Re-running migrations on an initialized connection must be a no-op.
        let conn = store.conn.lock();
        schema::run_migrations(&conn).unwrap();
    }
}
