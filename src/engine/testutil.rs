// Shared seed helpers for engine tests. Test-only (gated at the module
// declaration in engine/mod.rs); everything goes through the public Store
// API so the helpers double as smoke coverage for it.

use crate::atoms::types::{
    Direction, Event, EventLifecycle, ProcessingStatus, RawItem, Source, SourceType, Trend,
    TrendIndicator,
};
use crate::engine::dedup::compute_content_hash;
use crate::engine::store::Store;
use chrono::Utc;
use std::collections::BTreeMap;
use uuid::Uuid;

pub(crate) fn seed_source(store: &Store, tier: &str, reporting: &str) -> String {
    let source = Source {
        id: Uuid::new_v4().to_string(),
        name: format!("src-{}", &Uuid::new_v4().to_string()[..8]),
        source_type: SourceType::Rss,
        url: Some("https://example.org/feed".into()),
        credibility_score: 0.8,
        source_tier: Some(tier.to_string()),
        reporting_type: Some(reporting.to_string()),
        is_active: true,
        last_fetched_at: None,
        ingestion_window_end_at: None,
        error_count: 0,
        last_error: None,
        config: serde_json::json!({}),
    };
    store.insert_source(&source).unwrap();
    source.id
}

pub(crate) fn build_item(source_id: &str, content: &str) -> RawItem {
    RawItem {
        id: Uuid::new_v4().to_string(),
        source_id: source_id.to_string(),
        external_id: None,
        url: None,
        title: Some("Seed headline".into()),
        raw_content: content.to_string(),
        content_hash: compute_content_hash(content),
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

/// Insert a pending item (with a fresh source) and return its id.
pub(crate) fn seed_pending_item(store: &Store, content: &str) -> String {
    let source_id = seed_source(store, "wire", "firsthand");
    let item = build_item(&source_id, content);
    store.insert_raw_item(&item).unwrap();
    item.id
}

pub(crate) fn seed_event(store: &Store, summary: &str) -> Event {
    let now = Utc::now();
    let event = Event {
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
    };
    store.insert_event(&event).unwrap();
    event
}

pub(crate) fn seed_trend(store: &Store, identifier: &str) -> Trend {
    let mut indicators = BTreeMap::new();
    indicators.insert(
        "military_movement".to_string(),
        TrendIndicator {
            weight: 0.04,
            direction: Direction::Escalatory,
            decay_half_life_days: None,
            keywords: vec!["troops".into(), "buildup".into()],
        },
    );
    indicators.insert(
        "diplomatic_talks".to_string(),
        TrendIndicator {
            weight: 0.03,
            direction: Direction::DeEscalatory,
            decay_half_life_days: Some(14),
            keywords: vec!["summit".into()],
        },
    );
    let trend = Trend {
        id: Uuid::new_v4().to_string(),
        name: format!("Trend {identifier}"),
        description: None,
        definition: serde_json::json!({ "id": identifier }),
        indicators,
        baseline_log_odds: -2.0,
        current_log_odds: -2.0,
        decay_half_life_days: 30,
        is_active: true,
        updated_at: Utc::now(),
    };
    store.insert_trend(&trend).unwrap();
    trend
}
