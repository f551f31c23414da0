// Horadus — Event Clusterer
//
// Assigns classified items to events: the best active event inside the
// time window with the same embedding model and cosine distance under the
// threshold wins; otherwise a new EMERGING event is created. Linking is
// atomic on the unique item_id constraint — the loser of a concurrent
// insert resolves to the pre-existing linkage. Operator-suppressed events
// (latest feedback mark_noise/invalidate) are never merged into.

use crate::atoms::constants::CANONICAL_SUMMARY_MAX_CHARS;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{Event, EventLifecycle, RawItem};
use crate::engine::credibility::effective_source_credibility;
use crate::engine::lifecycle::on_event_mention;
use crate::engine::observability::record_event_suppression;
use crate::engine::similarity::nearest_neighbors;
use crate::engine::store::Store;
use chrono::{DateTime, Duration, Utc};
use log::info;
use std::sync::Arc;
use uuid::Uuid;

/// Result of clustering one raw item.
#[derive(Debug, Clone)]
pub struct ClusterResult {
    pub item_id: String,
    pub event_id: String,
    pub created: bool,
    pub merged: bool,
    /// The matched event is operator-suppressed; no merge happened.
    pub suppressed: bool,
    pub similarity: Option<f64>,
}

pub struct EventClusterer {
    store: Arc<Store>,
    similarity_threshold: f64,
    time_window_hours: i64,
}

impl EventClusterer {
    pub fn new(store: Arc<Store>, similarity_threshold: f64, time_window_hours: i64) -> Self {
        EventClusterer {
            store,
            similarity_threshold,
            time_window_hours,
        }
    }

    /// Cluster a single raw item into an existing or new event.
    pub fn cluster_item(&self, item: &RawItem) -> EngineResult<ClusterResult> {
        // Re-runs resolve to the existing linkage.
        if let Some(event_id) = self.store.find_event_id_for_item(&item.id)? {
            return Ok(ClusterResult {
                item_id: item.id.clone(),
                event_id,
                created: false,
                merged: true,
                suppressed: false,
                similarity: None,
            });
        }

        let embedding_model = item
            .embedding_model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty());
        let (Some(embedding), Some(embedding_model)) = (item.embedding.as_deref(), embedding_model)
        else {
            return self.create_event_for(item);
        };

        let Some((event_id, similarity)) =
            self.find_matching_event(embedding, embedding_model, item_timestamp(item))?
        else {
            return self.create_event_for(item);
        };

        if let Some(action) = self.store.latest_event_suppression(&event_id)? {
            record_event_suppression(action.as_str(), "clusterer_pre_merge");
            info!(
                "[cluster] Skipping suppressed event before merge: event={} item={} action={}",
                event_id,
                item.id,
                action.as_str()
            );
            return Ok(ClusterResult {
                item_id: item.id.clone(),
                event_id,
                created: false,
                merged: false,
                suppressed: true,
                similarity: Some(similarity),
            });
        }

        if !self.store.link_event_item(&event_id, &item.id)? {
            // Lost a concurrent-insert race; use whatever linkage exists now.
            let resolved = self.store.find_event_id_for_item(&item.id)?;
            let resolved_event_id = resolved.unwrap_or_else(|| event_id.clone());
            if resolved_event_id != event_id {
                info!(
                    "[cluster] Item already linked to a different event, using existing linkage: \
                     item={} requested={} existing={}",
                    item.id, event_id, resolved_event_id
                );
            }
            return Ok(ClusterResult {
                item_id: item.id.clone(),
                event_id: resolved_event_id,
                created: false,
                merged: true,
                suppressed: false,
                similarity: Some(similarity),
            });
        }

        self.merge_into_event(&event_id, item)?;
        Ok(ClusterResult {
            item_id: item.id.clone(),
            event_id,
            created: false,
            merged: true,
            suppressed: false,
            similarity: Some(similarity),
        })
    }

    /// Cluster raw items not yet attached to any event.
    pub fn cluster_unlinked_items(&self, limit: usize) -> EngineResult<Vec<ClusterResult>> {
        let items = self.store.items_without_event(limit)?;
        let mut results = Vec::with_capacity(items.len());
        for item in &items {
            results.push(self.cluster_item(item)?);
        }
        Ok(results)
    }

    fn create_event_for(&self, item: &RawItem) -> EngineResult<ClusterResult> {
        let timestamp = item_timestamp(item);
        let event = Event {
            id: Uuid::new_v4().to_string(),
            canonical_summary: build_canonical_summary(item),
            embedding: item.embedding.clone(),
            embedding_model: item.embedding_model.clone(),
            embedding_generated_at: item.embedding_generated_at,
            source_count: 1,
            unique_source_count: 1,
            first_seen_at: timestamp,
            last_mention_at: timestamp,
            confirmed_at: None,
            lifecycle_status: EventLifecycle::Emerging,
            primary_item_id: Some(item.id.clone()),
            extracted_who: Vec::new(),
            extracted_what: None,
            extracted_where: None,
            extracted_when: None,
            categories: Vec::new(),
            extracted_claims: None,
            has_contradictions: false,
        };
        self.store.insert_event(&event)?;
        self.store.link_event_item(&event.id, &item.id)?;
        Ok(ClusterResult {
            item_id: item.id.clone(),
            event_id: event.id,
            created: true,
            merged: false,
            suppressed: false,
            similarity: None,
        })
    }

    fn find_matching_event(
        &self,
        embedding: &[f32],
        embedding_model: &str,
        reference_time: DateTime<Utc>,
    ) -> EngineResult<Option<(String, f64)>> {
        let window_start = reference_time - Duration::hours(self.time_window_hours);
        let candidates = self.store.cluster_candidates(embedding_model, window_start)?;
        if candidates.is_empty() {
            return Ok(None);
        }
        let neighbors = nearest_neighbors(embedding, &candidates, self.similarity_threshold, 1)?;
        Ok(neighbors
            .into_iter()
            .next()
            .map(|neighbor| (neighbor.entity_id, neighbor.similarity)))
    }

    /// Post-link bookkeeping: counts, summary, primary item, lifecycle.
    fn merge_into_event(&self, event_id: &str, item: &RawItem) -> EngineResult<()> {
        let Some(mut event) = self.store.get_event(event_id)? else {
            return Ok(());
        };

        event.source_count += 1;
        event.canonical_summary = build_canonical_summary(item);
        if event.embedding.is_none() && item.embedding.is_some() {
            event.embedding = item.embedding.clone();
            event.embedding_model = item.embedding_model.clone();
            event.embedding_generated_at = item.embedding_generated_at;
        }

        self.update_primary_item(&mut event, &item.id)?;
        event.unique_source_count = self.store.count_unique_event_sources(event_id)?.max(1);
        on_event_mention(&mut event, item_timestamp(item));

        self.store.update_event_merge_fields(&event)?;
        Ok(())
    }

    /// Replace primary_item_id when the candidate's effective source
    /// credibility is strictly higher.
    fn update_primary_item(&self, event: &mut Event, candidate_item_id: &str) -> EngineResult<()> {
        let Some(current_id) = event.primary_item_id.clone() else {
            event.primary_item_id = Some(candidate_item_id.to_string());
            return Ok(());
        };
        let candidate = self.item_credibility(candidate_item_id)?;
        let current = self.item_credibility(&current_id)?;
        if candidate > current {
            event.primary_item_id = Some(candidate_item_id.to_string());
        }
        Ok(())
    }

    fn item_credibility(&self, item_id: &str) -> EngineResult<f64> {
        Ok(self
            .store
            .item_source_fields(item_id)?
            .map(|(base, tier, reporting)| {
                effective_source_credibility(Some(base), tier.as_deref(), reporting.as_deref())
            })
            .unwrap_or(0.0))
    }
}

fn build_canonical_summary(item: &RawItem) -> String {
    if let Some(title) = item.title.as_deref() {
        let trimmed = title.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let content = item.raw_content.trim();
    let mut cut = CANONICAL_SUMMARY_MAX_CHARS.min(content.len());
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    content[..cut].to_string()
}

fn item_timestamp(item: &RawItem) -> DateTime<Utc> {
    item.published_at.unwrap_or(item.fetched_at)
}
