use super::{parse_ts, ts, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::types::TrendSnapshot;
use chrono::{DateTime, Utc};
use rusqlite::params;

/// Downsampling granularity for snapshot history reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotBucket {
    Raw,
    Hourly,
    Daily,
}

impl SnapshotBucket {
    /// Prefix length of the RFC-3339 timestamp identifying the bucket.
    fn key_len(&self) -> usize {
        match self {
            // "2026-08-01T07" vs "2026-08-01"
            SnapshotBucket::Hourly => 13,
            SnapshotBucket::Daily => 10,
            SnapshotBucket::Raw => 0,
        }
    }
}

impl Store {
    pub fn insert_snapshot(
        &self,
        trend_id: &str,
        timestamp: DateTime<Utc>,
        log_odds: f64,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trend_snapshots (trend_id, timestamp, log_odds) VALUES (?1, ?2, ?3)",
            params![trend_id, ts(timestamp), log_odds],
        )?;
        Ok(())
    }

    /// Most recent snapshot at or before `at`.
    pub fn latest_snapshot_at_or_before(
        &self,
        trend_id: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<TrendSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trend_id, timestamp, log_odds FROM trend_snapshots
             WHERE trend_id = ?1 AND timestamp <= ?2
             ORDER BY timestamp DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![trend_id, ts(at)], snapshot_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Snapshot history since `since`, downsampled by keeping the latest
    /// snapshot per bucket, ascending by time.
    pub fn snapshot_history(
        &self,
        trend_id: &str,
        since: DateTime<Utc>,
        bucket: SnapshotBucket,
    ) -> EngineResult<Vec<TrendSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trend_id, timestamp, log_odds FROM trend_snapshots
             WHERE trend_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp ASC",
        )?;
        let all = stmt
            .query_map(params![trend_id, ts(since)], snapshot_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if bucket == SnapshotBucket::Raw {
            return Ok(all);
        }

        let key_len = bucket.key_len();
        let mut downsampled: Vec<TrendSnapshot> = Vec::new();
        let mut current_key: Option<String> = None;
        for snapshot in all {
            let key: String = ts(snapshot.timestamp).chars().take(key_len).collect();
            match downsampled.last_mut() {
                // Later snapshot in the same bucket replaces the earlier one.
                Some(last) if current_key.as_deref() == Some(key.as_str()) => *last = snapshot,
                _ => {
                    current_key = Some(key);
                    downsampled.push(snapshot);
                }
            }
        }
        Ok(downsampled)
    }
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrendSnapshot> {
    let timestamp: String = row.get(1)?;
    Ok(TrendSnapshot {
        trend_id: row.get(0)?,
        timestamp: parse_ts(&timestamp).unwrap_or_else(Utc::now),
        log_odds: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::trends::test_support::sample_trend;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn latest_at_or_before_picks_correct_snapshot() {
        let store = Store::open_in_memory().unwrap();
        let trend = sample_trend("snapshot-test");
        store.insert_trend(&trend).unwrap();

        let t0 = Utc.with_ymd_and_hms(2026, 7, 1, 8, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        store.insert_snapshot(&trend.id, t0, -2.0).unwrap();
        store.insert_snapshot(&trend.id, t1, -1.5).unwrap();

        let between = Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap();
        let snap = store
            .latest_snapshot_at_or_before(&trend.id, between)
            .unwrap()
            .unwrap();
        assert_eq!(snap.log_odds, -2.0);

        let before = Utc.with_ymd_and_hms(2026, 6, 30, 0, 0, 0).unwrap();
        assert!(store
            .latest_snapshot_at_or_before(&trend.id, before)
            .unwrap()
            .is_none());
    }

    #[test]
    fn history_downsamples_latest_per_bucket() {
        let store = Store::open_in_memory().unwrap();
        let trend = sample_trend("history-test");
        store.insert_trend(&trend).unwrap();

        let base = Utc.with_ymd_and_hms(2026, 7, 1, 9, 0, 0).unwrap();
        store.insert_snapshot(&trend.id, base, -2.0).unwrap();
        store
            .insert_snapshot(&trend.id, base + chrono::Duration::minutes(30), -1.9)
            .unwrap();
        store
            .insert_snapshot(&trend.id, base + chrono::Duration::hours(2), -1.7)
            .unwrap();

        let hourly = store
            .snapshot_history(&trend.id, base - chrono::Duration::days(1), SnapshotBucket::Hourly)
            .unwrap();
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].log_odds, -1.9); // latest within 09:xx wins
        assert_eq!(hourly[1].log_odds, -1.7);

        let daily = store
            .snapshot_history(&trend.id, base - chrono::Duration::days(1), SnapshotBucket::Daily)
            .unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].log_odds, -1.7);
    }
}
