// Horadus — Collector Seam
//
// The core never speaks RSS/GDELT/Telegram wire formats; concrete
// collectors live outside and implement this trait. What the core owns is
// the contract: idempotent raw-item ingestion keyed on the content hash,
// watermark advancement with overlap, and error bookkeeping on sources.

use crate::atoms::error::EngineResult;
use crate::atoms::types::{ProcessingStatus, RawItem, Source};
use crate::engine::dedup::compute_content_hash;
use crate::engine::observability::record_collector_metrics;
use crate::engine::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::warn;
use uuid::Uuid;

/// Summary of one collection pass.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CollectResult {
    pub collector: String,
    pub items_fetched: usize,
    pub items_stored: usize,
    pub items_skipped: usize,
    pub errors: Vec<String>,
}

/// One fetched item before storage normalization.
#[derive(Debug, Clone)]
pub struct FetchedItem {
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub raw_content: String,
    pub language: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// A feed adapter. Concrete types hold their own HTTP and parsing state.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Load per-source configuration from the source's config blob.
    fn load_config(&mut self, source: &Source) -> EngineResult<()>;

    /// Collect every active source of this collector's type.
    async fn collect_all(&self, store: &Store) -> EngineResult<Vec<CollectResult>>;

    /// Collect one source's window.
    async fn collect_one(&self, store: &Store, source: &Source) -> EngineResult<CollectResult>;
}

/// Per-collector ingestion window bounds derived from the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Compute the next collection window: resume from the watermark minus a
/// configured overlap so boundary items are never missed, falling back to
/// one full interval when the source has never been collected.
pub fn next_ingestion_window(
    source: &Source,
    now: DateTime<Utc>,
    interval_minutes: u64,
    overlap_minutes: i64,
) -> IngestionWindow {
    let start = match source.ingestion_window_end_at {
        Some(watermark) => watermark - Duration::minutes(overlap_minutes.max(0)),
        None => now - Duration::minutes(interval_minutes.max(1) as i64),
    };
    IngestionWindow {
        start: start.min(now),
        end: now,
    }
}

/// Store a batch of fetched items for a source. Items whose content hash
/// already exists inside the dedup window are skipped; the watermark only
/// advances when the whole batch stored without a database error.
pub fn ingest_fetched_items(
    store: &Store,
    source: &Source,
    items: &[FetchedItem],
    window: IngestionWindow,
    dedup_window_days: i64,
) -> EngineResult<CollectResult> {
    let collector = source.source_type.as_str().to_string();
    let mut result = CollectResult {
        collector: collector.clone(),
        items_fetched: items.len(),
        ..Default::default()
    };

    let fetched_at = Utc::now();
    for fetched in items {
        let normalized = fetched.raw_content.trim();
        if normalized.is_empty() {
            result.items_skipped += 1;
            continue;
        }
        let item = RawItem {
            id: Uuid::new_v4().to_string(),
            source_id: source.id.clone(),
            external_id: fetched.external_id.clone(),
            url: fetched.url.clone(),
            title: fetched.title.clone(),
            raw_content: normalized.to_string(),
            content_hash: compute_content_hash(normalized),
            language: fetched.language.clone(),
            fetched_at,
            published_at: fetched.published_at,
            embedding: None,
            embedding_model: None,
            embedding_generated_at: None,
            processing_status: ProcessingStatus::Pending,
            error_message: None,
        };
        match store.insert_raw_item_if_new(&item, dedup_window_days) {
            Ok(true) => result.items_stored += 1,
            Ok(false) => result.items_skipped += 1,
            Err(error) => {
                warn!(
                    "[collect] Failed to store item from {}: {}",
                    source.name, error
                );
                result.errors.push(error.to_string());
            }
        }
    }

    if result.errors.is_empty() {
        store.record_source_success(&source.id, fetched_at, window.end)?;
    } else {
        store.record_source_error(
            &source.id,
            result.errors.last().map(String::as_str).unwrap_or("unknown"),
        )?;
    }

    record_collector_metrics(
        &collector,
        result.items_fetched as u64,
        result.items_stored as u64,
        result.items_skipped as u64,
        result.errors.len() as u64,
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::SourceType;
    use crate::engine::testutil::seed_source;

    fn fetched(content: &str) -> FetchedItem {
        FetchedItem {
            external_id: None,
            url: None,
            title: Some("headline".into()),
            raw_content: content.to_string(),
            language: Some("en".into()),
            published_at: None,
        }
    }

    #[test]
    fn window_resumes_from_watermark_with_overlap() {
        let store = Store::open_in_memory().unwrap();
        let source_id = seed_source(&store, "wire", "firsthand");
        let now = Utc::now();

        // Never collected: one full interval back.
        let source = store.get_source(&source_id).unwrap().unwrap();
        let window = next_ingestion_window(&source, now, 30, 5);
        assert_eq!(window.end, now);
        assert_eq!(window.start, now - Duration::minutes(30));

        // With a watermark: overlap back from it.
        let watermark = now - Duration::minutes(10);
        store.record_source_success(&source_id, now, watermark).unwrap();
        let source = store.get_source(&source_id).unwrap().unwrap();
        let window = next_ingestion_window(&source, now, 30, 5);
        let expected = watermark - Duration::minutes(5);
        assert!((window.start - expected).num_milliseconds().abs() < 1);
    }

    #[test]
    fn ingest_skips_duplicates_and_advances_watermark() {
        let store = Store::open_in_memory().unwrap();
        let source_id = seed_source(&store, "wire", "firsthand");
        let source = store.get_source(&source_id).unwrap().unwrap();
        assert_eq!(source.source_type, SourceType::Rss);
        let now = Utc::now();
        let window = IngestionWindow {
            start: now - Duration::minutes(30),
            end: now,
        };

        let items = vec![fetched("story one"), fetched("story one"), fetched("  ")];
        let result = ingest_fetched_items(&store, &source, &items, window, 7).unwrap();
        assert_eq!(result.items_fetched, 3);
        assert_eq!(result.items_stored, 1);
        assert_eq!(result.items_skipped, 2);
        assert!(result.errors.is_empty());

        let source = store.get_source(&source_id).unwrap().unwrap();
        let watermark = source.ingestion_window_end_at.unwrap();
        // Storage truncates to microsecond precision.
        assert!((watermark - window.end).num_milliseconds().abs() < 1);
        assert!(source.last_fetched_at.is_some());
        assert_eq!(source.error_count, 0);
    }
}
