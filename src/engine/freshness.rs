// Horadus — Source Freshness
//
// SLO evaluation over active collectors: a source is stale when its last
// fetch is older than its collection interval times the alert multiplier
// (floor 60s). Never-fetched sources count as stale. Rows sort stale-first
// by age so the report reads worst-first.

use crate::atoms::error::EngineResult;
use crate::atoms::types::SourceType;
use crate::engine::observability::record_stale_source;
use crate::engine::store::Store;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SourceFreshnessRow {
    pub source_id: String,
    pub source_name: String,
    pub collector: String,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub age_seconds: Option<i64>,
    pub stale_after_seconds: i64,
    pub is_stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFreshnessReport {
    pub checked_at: DateTime<Utc>,
    pub stale_multiplier: f64,
    pub rows: Vec<SourceFreshnessRow>,
}

impl SourceFreshnessReport {
    pub fn stale_count(&self) -> usize {
        self.rows.iter().filter(|row| row.is_stale).count()
    }

    pub fn stale_collectors(&self) -> Vec<String> {
        let mut collectors: Vec<String> = self
            .rows
            .iter()
            .filter(|row| row.is_stale)
            .map(|row| row.collector.clone())
            .collect();
        collectors.sort();
        collectors.dedup();
        collectors
    }
}

#[derive(Debug, Clone)]
pub struct FreshnessIntervals {
    pub rss_minutes: u64,
    pub gdelt_minutes: u64,
    pub stale_multiplier: f64,
}

impl FreshnessIntervals {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        FreshnessIntervals {
            rss_minutes: settings.rss_collection_interval_minutes.max(1),
            gdelt_minutes: settings.gdelt_collection_interval_minutes.max(1),
            stale_multiplier: settings.source_freshness_alert_multiplier.max(1.0),
        }
    }

    fn interval_minutes(&self, source_type: SourceType) -> Option<u64> {
        match source_type {
            SourceType::Rss => Some(self.rss_minutes),
            SourceType::Gdelt => Some(self.gdelt_minutes),
            // Other collectors run on their own cadence; no SLO here.
            SourceType::Telegram | SourceType::Api => None,
        }
    }
}

/// Evaluate freshness for all active rss/gdelt sources.
pub fn build_source_freshness_report(
    store: &Store,
    intervals: &FreshnessIntervals,
    checked_at: DateTime<Utc>,
) -> EngineResult<SourceFreshnessReport> {
    let sources = store.list_active_sources()?;

    let mut rows = Vec::new();
    for source in sources {
        let Some(interval_minutes) = intervals.interval_minutes(source.source_type) else {
            continue;
        };
        let stale_after_seconds =
            ((interval_minutes * 60) as f64 * intervals.stale_multiplier).max(60.0) as i64;

        let (age_seconds, is_stale) = match source.last_fetched_at {
            None => (None, true),
            Some(last_fetched) => {
                let age = (checked_at - last_fetched).num_seconds().max(0);
                (Some(age), age > stale_after_seconds)
            }
        };
        if is_stale {
            record_stale_source(source.source_type.as_str());
        }
        rows.push(SourceFreshnessRow {
            source_id: source.id,
            source_name: source.name,
            collector: source.source_type.as_str().to_string(),
            last_fetched_at: source.last_fetched_at,
            age_seconds,
            stale_after_seconds,
            is_stale,
        });
    }

    rows.sort_by(|a, b| {
        b.is_stale
            .cmp(&a.is_stale)
            .then_with(|| {
                let age_a = a.age_seconds.unwrap_or(a.stale_after_seconds * 1000);
                let age_b = b.age_seconds.unwrap_or(b.stale_after_seconds * 1000);
                age_b.cmp(&age_a)
            })
            .then_with(|| a.source_name.to_lowercase().cmp(&b.source_name.to_lowercase()))
    });

    Ok(SourceFreshnessReport {
        checked_at,
        stale_multiplier: intervals.stale_multiplier,
        rows,
    })
}
