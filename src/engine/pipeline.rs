// Horadus — Processing Pipeline
//
// Per-item orchestration: claim → language policy → dedup → embed →
// cluster → tier-1 → tier-2 → trend impacts → classified. Every item ends
// a run in exactly one of {classified, noise, pending, error}: budget
// exhaustion reverts the item to pending (recoverable), anything else
// that throws marks it error with a truncated message.

use crate::atoms::constants::ERROR_MESSAGE_MAX_CHARS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    Event, ProcessingStatus, RawItem, TaxonomyGap, TaxonomyGapReason, Trend, TrendImpact,
};
use crate::config::UnsupportedLanguageMode;
use crate::engine::cluster::EventClusterer;
use crate::engine::credibility::effective_source_credibility;
use crate::engine::dedup::{DedupRequest, DeduplicationService};
use crate::engine::embedding::EmbeddingService;
use crate::engine::observability::{record_event_suppression, record_taxonomy_gap};
use crate::engine::store::Store;
use crate::engine::tier1::Tier1Classifier;
use crate::engine::tier2::Tier2Classifier;
use crate::engine::trend::{
    calculate_evidence_delta, corroboration_factor, event_corroboration_score, novelty_factor,
    TrendEngine,
};
use chrono::Utc;
use log::{error, info};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

// ── Run results ────────────────────────────────────────────────────────────

/// Usage and API call metrics across one pipeline run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineUsage {
    pub embedding_api_calls: i64,
    pub tier1_prompt_tokens: i64,
    pub tier1_completion_tokens: i64,
    pub tier1_api_calls: i64,
    pub tier1_estimated_cost_usd: f64,
    pub tier2_prompt_tokens: i64,
    pub tier2_completion_tokens: i64,
    pub tier2_api_calls: i64,
    pub tier2_estimated_cost_usd: f64,
}

/// Result of processing one raw item.
#[derive(Debug, Clone)]
pub struct PipelineItemResult {
    pub item_id: String,
    pub final_status: ProcessingStatus,
    pub event_id: Option<String>,
    pub duplicate: bool,
    pub embedded: bool,
    pub event_created: bool,
    pub event_merged: bool,
    pub suppressed: bool,
    pub tier2_applied: bool,
    pub trend_impacts_seen: usize,
    pub trend_updates: usize,
    pub error_message: Option<String>,
}

impl PipelineItemResult {
    fn terminal(item_id: &str, status: ProcessingStatus) -> Self {
        PipelineItemResult {
            item_id: item_id.to_string(),
            final_status: status,
            event_id: None,
            duplicate: false,
            embedded: false,
            event_created: false,
            event_merged: false,
            suppressed: false,
            tier2_applied: false,
            trend_impacts_seen: 0,
            trend_updates: 0,
            error_message: None,
        }
    }
}

/// Summary metrics for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineRunResult {
    pub scanned: usize,
    pub processed: usize,
    pub classified: usize,
    pub noise: usize,
    pub pending: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub embedded: usize,
    pub events_created: usize,
    pub events_merged: usize,
    pub trend_impacts_seen: usize,
    pub trend_updates: usize,
    pub results: Vec<PipelineItemResult>,
    pub usage: PipelineUsage,
}

impl PipelineRunResult {
    /// Serialize into task-result primitives.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "scanned": self.scanned,
            "processed": self.processed,
            "classified": self.classified,
            "noise": self.noise,
            "pending": self.pending,
            "duplicates": self.duplicates,
            "errors": self.errors,
            "embedded": self.embedded,
            "events_created": self.events_created,
            "events_merged": self.events_merged,
            "trend_impacts_seen": self.trend_impacts_seen,
            "trend_updates": self.trend_updates,
            "embedding_api_calls": self.usage.embedding_api_calls,
            "tier1_prompt_tokens": self.usage.tier1_prompt_tokens,
            "tier1_completion_tokens": self.usage.tier1_completion_tokens,
            "tier1_api_calls": self.usage.tier1_api_calls,
            "tier1_estimated_cost_usd": self.usage.tier1_estimated_cost_usd,
            "tier2_prompt_tokens": self.usage.tier2_prompt_tokens,
            "tier2_completion_tokens": self.usage.tier2_completion_tokens,
            "tier2_api_calls": self.usage.tier2_api_calls,
            "tier2_estimated_cost_usd": self.usage.tier2_estimated_cost_usd,
        })
    }
}

/// Language handling configured from settings.
#[derive(Debug, Clone)]
pub struct LanguagePolicy {
    pub supported: Vec<String>,
    pub mode: UnsupportedLanguageMode,
}

impl LanguagePolicy {
    /// None = proceed; Some(mode) = apply that mode to this item.
    /// Items without a language tag proceed (there is nothing to check).
    fn decide(&self, language: Option<&str>) -> Option<UnsupportedLanguageMode> {
        let language = language?.trim().to_lowercase();
        if language.is_empty() || self.supported.is_empty() {
            return None;
        }
        if self.supported.iter().any(|supported| *supported == language) {
            None
        } else {
            Some(self.mode)
        }
    }
}

struct ItemExecution {
    result: PipelineItemResult,
    usage: PipelineUsage,
}

// ── Pipeline ───────────────────────────────────────────────────────────────

pub struct ProcessingPipeline {
    store: Arc<Store>,
    dedup: DeduplicationService,
    embedding: Arc<EmbeddingService>,
    clusterer: EventClusterer,
    tier1: Tier1Classifier,
    tier2: Tier2Classifier,
    trend_engine: TrendEngine,
    language_policy: LanguagePolicy,
}

impl ProcessingPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        dedup: DeduplicationService,
        embedding: Arc<EmbeddingService>,
        clusterer: EventClusterer,
        tier1: Tier1Classifier,
        tier2: Tier2Classifier,
        trend_engine: TrendEngine,
        language_policy: LanguagePolicy,
    ) -> Self {
        ProcessingPipeline {
            store,
            dedup,
            embedding,
            clusterer,
            tier1,
            tier2,
            trend_engine,
            language_policy,
        }
    }

    /// Claim and process up to `limit` pending items.
    pub async fn process_pending_items(&self, limit: usize) -> EngineResult<PipelineRunResult> {
        let items = self.store.claim_pending_items(limit)?;
        self.process_items(items, None).await
    }

    /// Process explicit items through the pipeline.
    pub async fn process_items(
        &self,
        items: Vec<RawItem>,
        trends: Option<Vec<Trend>>,
    ) -> EngineResult<PipelineRunResult> {
        if items.is_empty() {
            return Ok(PipelineRunResult::default());
        }
        let trends = match trends {
            Some(trends) if !trends.is_empty() => trends,
            _ => self.store.list_active_trends()?,
        };
        if trends.is_empty() {
            return Err(EngineError::validation(
                "no active trends available for the processing pipeline",
            ));
        }
        let trend_lookup: BTreeMap<String, &Trend> = trends
            .iter()
            .map(|trend| (trend.identifier(), trend))
            .collect();

        let mut run = PipelineRunResult {
            scanned: items.len(),
            ..Default::default()
        };
        for item in &items {
            let execution = self.process_one(item, &trends, &trend_lookup).await;
            absorb_usage(&mut run.usage, &execution.usage);
            let result = execution.result;

            match result.final_status {
                ProcessingStatus::Error => run.errors += 1,
                ProcessingStatus::Pending => {
                    run.pending += 1;
                    run.processed += 1;
                }
                status => {
                    run.processed += 1;
                    if status == ProcessingStatus::Classified {
                        run.classified += 1;
                    }
                    if status == ProcessingStatus::Noise {
                        run.noise += 1;
                    }
                }
            }
            if result.duplicate {
                run.duplicates += 1;
            }
            if result.embedded {
                run.embedded += 1;
            }
            if result.event_created {
                run.events_created += 1;
            }
            if result.event_merged {
                run.events_merged += 1;
            }
            run.trend_impacts_seen += result.trend_impacts_seen;
            run.trend_updates += result.trend_updates;
            run.results.push(result);
        }

        info!(
            "[pipeline] Run complete: scanned={} classified={} noise={} pending={} errors={} \
             events_created={} events_merged={} trend_updates={}",
            run.scanned,
            run.classified,
            run.noise,
            run.pending,
            run.errors,
            run.events_created,
            run.events_merged,
            run.trend_updates,
        );
        Ok(run)
    }

    /// One item, with error containment at the item boundary.
    async fn process_one(
        &self,
        item: &RawItem,
        trends: &[Trend],
        trend_lookup: &BTreeMap<String, &Trend>,
    ) -> ItemExecution {
        let mut usage = PipelineUsage::default();
        match self.run_item_steps(item, trends, trend_lookup, &mut usage).await {
            Ok(result) => ItemExecution { result, usage },
            Err(err) if err.is_budget_exceeded() => {
                // Recoverable: the item goes back to pending untouched.
                let revert = self
                    .store
                    .set_item_status(&item.id, ProcessingStatus::Pending, None);
                if let Err(revert_err) = revert {
                    error!(
                        "[pipeline] Failed to revert item {} to pending: {}",
                        item.id, revert_err
                    );
                }
                info!("[pipeline] Budget exhausted, deferring item {}", item.id);
                ItemExecution {
                    result: PipelineItemResult::terminal(&item.id, ProcessingStatus::Pending),
                    usage,
                }
            }
            Err(err) => {
                let message = truncate_error(&err.to_string());
                let _ = self.store.set_item_status(
                    &item.id,
                    ProcessingStatus::Error,
                    Some(&message),
                );
                error!("[pipeline] Item {} failed: {}", item.id, message);
                let mut result = PipelineItemResult::terminal(&item.id, ProcessingStatus::Error);
                result.error_message = Some(message);
                ItemExecution { result, usage }
            }
        }
    }

    async fn run_item_steps(
        &self,
        item: &RawItem,
        trends: &[Trend],
        trend_lookup: &BTreeMap<String, &Trend>,
        usage: &mut PipelineUsage,
    ) -> EngineResult<PipelineItemResult> {
        self.store
            .set_item_status(&item.id, ProcessingStatus::Processing, None)?;

        // ── Language policy ──────────────────────────────────────────
        if let Some(mode) = self.language_policy.decide(item.language.as_deref()) {
            let language = item.language.as_deref().unwrap_or("unknown");
            let reason = format!("unsupported language: {language}");
            let status = match mode {
                UnsupportedLanguageMode::Skip => ProcessingStatus::Noise,
                UnsupportedLanguageMode::Defer => ProcessingStatus::Pending,
            };
            self.store.set_item_status(&item.id, status, Some(&reason))?;
            return Ok(PipelineItemResult::terminal(&item.id, status));
        }

        // ── Dedup (self-excluding, so re-runs stay idempotent) ───────
        let duplicate = self.dedup.find_duplicate(&DedupRequest {
            external_id: item.external_id.as_deref(),
            url: item.url.as_deref(),
            content_hash: Some(&item.content_hash),
            embedding: item.embedding.as_deref(),
            embedding_model: item.embedding_model.as_deref(),
            exclude_item_id: Some(&item.id),
        })?;
        if duplicate.is_duplicate {
            self.store
                .set_item_status(&item.id, ProcessingStatus::Noise, None)?;
            let mut result = PipelineItemResult::terminal(&item.id, ProcessingStatus::Noise);
            result.duplicate = true;
            return Ok(result);
        }

        let raw_content = item.raw_content.trim();
        if raw_content.is_empty() {
            return Err(EngineError::validation(
                "raw_content must not be empty for pipeline processing",
            ));
        }

        // ── Embedding backfill ───────────────────────────────────────
        let mut working_item = item.clone();
        let mut embedded = false;
        if working_item.embedding.is_none() {
            let (mut vectors, _cache_hits, api_calls) = self
                .embedding
                .embed_texts(&[raw_content.to_string()])
                .await?;
            let vector = vectors.remove(0);
            let generated_at = Utc::now();
            self.store.update_item_embedding(
                &working_item.id,
                &vector,
                self.embedding.model(),
                generated_at,
            )?;
            working_item.embedding = Some(vector);
            working_item.embedding_model = Some(self.embedding.model().to_string());
            working_item.embedding_generated_at = Some(generated_at);
            usage.embedding_api_calls += api_calls as i64;
            embedded = true;
        }

        // ── Clustering ───────────────────────────────────────────────
        let cluster = self.clusterer.cluster_item(&working_item)?;
        if cluster.suppressed {
            record_event_suppression("suppressed", "pipeline_post_cluster");
            let reason = "event suppressed by operator feedback";
            self.store
                .set_item_status(&item.id, ProcessingStatus::Noise, Some(reason))?;
            let mut result = PipelineItemResult::terminal(&item.id, ProcessingStatus::Noise);
            result.event_id = Some(cluster.event_id);
            result.embedded = embedded;
            result.suppressed = true;
            return Ok(result);
        }

        // ── Tier-1 relevance ─────────────────────────────────────────
        let (tier1_results, tier1_usage) = self
            .tier1
            .classify_items(std::slice::from_ref(&working_item), trends)
            .await?;
        usage.tier1_prompt_tokens += tier1_usage.prompt_tokens;
        usage.tier1_completion_tokens += tier1_usage.completion_tokens;
        usage.tier1_api_calls += tier1_usage.api_calls;
        usage.tier1_estimated_cost_usd += tier1_usage.estimated_cost_usd;
        let tier1_result = tier1_results.into_iter().next().ok_or_else(|| {
            EngineError::validation("tier-1 returned no result for single-item call")
        })?;

        if !tier1_result.should_queue_tier2 {
            self.store
                .set_item_status(&item.id, ProcessingStatus::Noise, None)?;
            let mut result = PipelineItemResult::terminal(&item.id, ProcessingStatus::Noise);
            result.event_id = Some(cluster.event_id);
            result.embedded = embedded;
            result.event_created = cluster.created;
            result.event_merged = cluster.merged && !cluster.created;
            return Ok(result);
        }

        // ── Tier-2 extraction ────────────────────────────────────────
        let event = self
            .store
            .get_event(&cluster.event_id)?
            .ok_or_else(|| {
                EngineError::not_found(format!("event '{}' after clustering", cluster.event_id))
            })?;
        let (tier2_result, tier2_usage) = self.tier2.classify_event(&event, trends).await?;
        usage.tier2_prompt_tokens += tier2_usage.prompt_tokens;
        usage.tier2_completion_tokens += tier2_usage.completion_tokens;
        usage.tier2_api_calls += tier2_usage.api_calls;
        usage.tier2_estimated_cost_usd += tier2_usage.estimated_cost_usd;

        // ── Trend impacts ────────────────────────────────────────────
        let event = self
            .store
            .get_event(&cluster.event_id)?
            .ok_or_else(|| EngineError::not_found(format!("event '{}'", cluster.event_id)))?;
        let (impacts_seen, updates) = self
            .apply_trend_impacts(&event, &tier2_result.trend_impacts, trend_lookup)?;

        self.store
            .set_item_status(&item.id, ProcessingStatus::Classified, None)?;
        Ok(PipelineItemResult {
            item_id: item.id.clone(),
            final_status: ProcessingStatus::Classified,
            event_id: Some(cluster.event_id),
            duplicate: false,
            embedded,
            event_created: cluster.created,
            event_merged: cluster.merged && !cluster.created,
            suppressed: false,
            tier2_applied: true,
            trend_impacts_seen: impacts_seen,
            trend_updates: updates,
            error_message: None,
        })
    }

    /// Convert declared impacts into evidence, capturing taxonomy gaps for
    /// unknown identifiers instead of failing the item.
    fn apply_trend_impacts(
        &self,
        event: &Event,
        impacts: &[TrendImpact],
        trend_lookup: &BTreeMap<String, &Trend>,
    ) -> EngineResult<(usize, usize)> {
        if impacts.is_empty() {
            return Ok((0, 0));
        }

        let source_rows = self.store.event_source_rows(&event.id)?;
        let corroboration = corroboration_factor(event_corroboration_score(
            &source_rows,
            event.unique_source_count,
            event.has_contradictions,
        ));
        let credibility = self.event_credibility(&source_rows);
        let reference_time = event.extracted_when.unwrap_or(event.first_seen_at);
        let evidence_age_days =
            ((Utc::now() - reference_time).num_seconds() as f64 / 86_400.0).max(0.0);

        let mut updates = 0usize;
        for impact in impacts {
            let Some(trend) = trend_lookup.get(&impact.trend_id) else {
                self.record_gap(TaxonomyGapReason::UnknownTrendId, impact, &event.id)?;
                continue;
            };
            let Some(indicator) = trend.indicators.get(&impact.signal_type) else {
                self.record_gap(TaxonomyGapReason::UnknownSignalType, impact, &event.id)?;
                continue;
            };

            let half_life = indicator
                .decay_half_life_days
                .unwrap_or(trend.decay_half_life_days)
                .max(1) as f64;
            let novelty =
                novelty_factor(self.store.count_prior_evidence(&trend.id, &event.id)?);
            let factors = calculate_evidence_delta(
                indicator.weight,
                impact.severity,
                impact.confidence,
                credibility,
                corroboration,
                novelty,
                evidence_age_days,
                half_life,
                impact.direction,
            );
            self.trend_engine.apply_evidence(
                &trend.id,
                &event.id,
                &impact.signal_type,
                &factors,
                impact.rationale.as_deref(),
            )?;
            updates += 1;
        }
        Ok((impacts.len(), updates))
    }

    /// Mean effective credibility across the event's linked sources.
    fn event_credibility(&self, source_rows: &[(String, Option<String>, Option<String>)]) -> f64 {
        if source_rows.is_empty() {
            return crate::atoms::constants::DEFAULT_SOURCE_CREDIBILITY;
        }
        let mut total = 0.0;
        let mut counted = 0usize;
        for (source_id, tier, reporting) in source_rows {
            let base = self
                .store
                .get_source(source_id)
                .ok()
                .flatten()
                .map(|source| source.credibility_score);
            total += effective_source_credibility(base, tier.as_deref(), reporting.as_deref());
            counted += 1;
        }
        total / counted as f64
    }

    fn record_gap(
        &self,
        reason: TaxonomyGapReason,
        impact: &TrendImpact,
        event_id: &str,
    ) -> EngineResult<()> {
        record_taxonomy_gap(reason.as_str());
        self.store.insert_taxonomy_gap(&TaxonomyGap {
            id: Uuid::new_v4().to_string(),
            reason,
            trend_id: impact.trend_id.clone(),
            signal_type: Some(impact.signal_type.clone()),
            event_id: Some(event_id.to_string()),
            payload: serde_json::to_value(impact)?,
            created_at: Utc::now(),
        })
    }
}

fn absorb_usage(total: &mut PipelineUsage, part: &PipelineUsage) {
    total.embedding_api_calls += part.embedding_api_calls;
    total.tier1_prompt_tokens += part.tier1_prompt_tokens;
    total.tier1_completion_tokens += part.tier1_completion_tokens;
    total.tier1_api_calls += part.tier1_api_calls;
    total.tier1_estimated_cost_usd += part.tier1_estimated_cost_usd;
    total.tier2_prompt_tokens += part.tier2_prompt_tokens;
    total.tier2_completion_tokens += part.tier2_completion_tokens;
    total.tier2_api_calls += part.tier2_api_calls;
    total.tier2_estimated_cost_usd += part.tier2_estimated_cost_usd;
}

fn truncate_error(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_MAX_CHARS {
        return message.to_string();
    }
    let mut cut = ERROR_MESSAGE_MAX_CHARS;
    while cut > 0 && !message.is_char_boundary(cut) {
        cut -= 1;
    }
    message[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::LlmTier;
    use crate::config::UrlQueryMode;
    use crate::engine::cost::{CostLimits, CostTracker};
    use crate::engine::embedding::test_support::FakeEmbeddingBackend;
    use crate::engine::llm::failover::{ChatFailoverInvoker, ChatRoute, RetryPolicy};
    use crate::engine::llm::provider::test_support::ScriptedChatBackend;
    use crate::engine::testutil::{build_item, seed_source, seed_trend};
    use serde_json::json;

    struct Fixture {
        store: Arc<Store>,
        pipeline: ProcessingPipeline,
        tracker: Arc<CostTracker>,
        tier1_backend: Arc<ScriptedChatBackend>,
        tier2_backend: Arc<ScriptedChatBackend>,
    }

    fn fixture(
        tier1_responses: Vec<EngineResult<crate::engine::llm::provider::ChatCompletion>>,
        tier2_responses: Vec<EngineResult<crate::engine::llm::provider::ChatCompletion>>,
        limits: CostLimits,
        mode: UnsupportedLanguageMode,
    ) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tracker = Arc::new(CostTracker::new(Arc::clone(&store), limits));

        let embedding_backend = Arc::new(FakeEmbeddingBackend::new(8));
        let embedding = Arc::new(EmbeddingService::new(
            Arc::clone(&store),
            embedding_backend,
            Arc::clone(&tracker),
            "fake-embed",
            8,
            32,
            64,
        ));

        let tier1_backend = Arc::new(ScriptedChatBackend::new(tier1_responses));
        let tier1 = Tier1Classifier::new(
            Arc::clone(&store),
            ChatFailoverInvoker::new(
                "tier1",
                ChatRoute::new("openai", "gpt-4.1-nano", tier1_backend.clone()),
                None,
                RetryPolicy {
                    max_attempts: 1,
                    backoff_seconds: 0.0,
                },
            ),
            Arc::clone(&tracker),
            None,
            5,
            10,
        );

        let tier2_backend = Arc::new(ScriptedChatBackend::new(tier2_responses));
        let tier2 = Tier2Classifier::new(
            Arc::clone(&store),
            ChatFailoverInvoker::new(
                "tier2",
                ChatRoute::new("openai", "gpt-4o-mini", tier2_backend.clone()),
                None,
                RetryPolicy {
                    max_attempts: 1,
                    backoff_seconds: 0.0,
                },
            ),
            Arc::clone(&tracker),
            None,
        );

        let pipeline = ProcessingPipeline::new(
            Arc::clone(&store),
            DeduplicationService::new(Arc::clone(&store), 0.92, 7, UrlQueryMode::StripAll),
            embedding,
            EventClusterer::new(Arc::clone(&store), 0.88, 48),
            tier1,
            tier2,
            TrendEngine::new(Arc::clone(&store)),
            LanguagePolicy {
                supported: vec!["en".into()],
                mode,
            },
        );

        Fixture {
            store,
            pipeline,
            tracker,
            tier1_backend,
            tier2_backend,
        }
    }

    fn open_limits() -> CostLimits {
        CostLimits {
            tier1_max_daily_calls: 0,
            tier2_max_daily_calls: 0,
            embedding_max_daily_calls: 0,
            daily_cost_limit_usd: 0.0,
            cost_alert_threshold_pct: 0,
        }
    }

    fn tier1_queue_response(item_id: &str, score: i64) -> EngineResult<crate::engine::llm::provider::ChatCompletion> {
        Ok(ScriptedChatBackend::completion(
            &json!({
                "items": [{
                    "item_id": item_id,
                    "trend_scores": [
                        { "trend_id": "eu-russia", "relevance_score": score },
                        { "trend_id": "us-china", "relevance_score": 1 },
                    ]
                }]
            })
            .to_string(),
            "gpt-4.1-nano",
        ))
    }

    fn tier2_response_with_impact() -> EngineResult<crate::engine::llm::provider::ChatCompletion> {
        Ok(ScriptedChatBackend::completion(
            &json!({
                "summary": "Force buildup confirmed near border",
                "extracted_who": ["Defense ministry"],
                "extracted_what": "Armored units moved forward",
                "extracted_where": "Border district",
                "extracted_when": null,
                "claims": ["Rail movement observed"],
                "categories": ["military"],
                "trend_impacts": [{
                    "trend_id": "eu-russia",
                    "signal_type": "military_movement",
                    "direction": "escalatory",
                    "severity": 0.8,
                    "confidence": 0.9,
                    "rationale": "Visible force buildup pattern"
                }]
            })
            .to_string(),
            "gpt-4o-mini",
        ))
    }

    fn seed_claimed_item(store: &Store, content: &str) -> RawItem {
        let source = seed_source(store, "wire", "firsthand");
        let item = build_item(&source, content);
        store.insert_raw_item(&item).unwrap();
        store.claim_pending_items(10).unwrap();
        store.get_raw_item(&item.id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn full_run_classifies_and_applies_impacts() {
        let fx = fixture(vec![], vec![], open_limits(), UnsupportedLanguageMode::Skip);
        let trend = seed_trend(&fx.store, "eu-russia");
        seed_trend(&fx.store, "us-china");
        let item = seed_claimed_item(&fx.store, "large troop buildup at the border");

        // Scripted responses need the concrete item id, so push them now.
        let fx = {
            let mut fx = fx;
            fx.tier1_backend = Arc::new(ScriptedChatBackend::new(vec![tier1_queue_response(
                &item.id, 9,
            )]));
            fx.tier2_backend = Arc::new(ScriptedChatBackend::new(vec![tier2_response_with_impact()]));
            fx.pipeline.tier1 = Tier1Classifier::new(
                Arc::clone(&fx.store),
                ChatFailoverInvoker::new(
                    "tier1",
                    ChatRoute::new("openai", "gpt-4.1-nano", fx.tier1_backend.clone()),
                    None,
                    RetryPolicy { max_attempts: 1, backoff_seconds: 0.0 },
                ),
                Arc::clone(&fx.tracker),
                None,
                5,
                10,
            );
            fx.pipeline.tier2 = Tier2Classifier::new(
                Arc::clone(&fx.store),
                ChatFailoverInvoker::new(
                    "tier2",
                    ChatRoute::new("openai", "gpt-4o-mini", fx.tier2_backend.clone()),
                    None,
                    RetryPolicy { max_attempts: 1, backoff_seconds: 0.0 },
                ),
                Arc::clone(&fx.tracker),
                None,
            );
            fx
        };

        let run = fx
            .pipeline
            .process_items(vec![item.clone()], None)
            .await
            .unwrap();
        assert_eq!(run.scanned, 1);
        assert_eq!(run.classified, 1);
        assert_eq!(run.errors, 0);
        assert_eq!(run.embedded, 1);
        assert_eq!(run.events_created, 1);
        assert_eq!(run.trend_impacts_seen, 1);
        assert_eq!(run.trend_updates, 1);
        assert!(run.usage.tier1_api_calls == 1 && run.usage.tier2_api_calls == 1);

        let loaded = fx.store.get_raw_item(&item.id).unwrap().unwrap();
        assert_eq!(loaded.processing_status, ProcessingStatus::Classified);

        // The trend moved up and an evidence row exists.
        let trend_after = fx.store.get_trend(&trend.id).unwrap().unwrap();
        assert!(trend_after.current_log_odds > trend.current_log_odds);
        let event_id = run.results[0].event_id.clone().unwrap();
        let evidence = fx.store.list_event_evidence(&event_id).unwrap();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].signal_type, "military_movement");
        assert_eq!(evidence[0].reasoning.as_deref(), Some("Visible force buildup pattern"));
    }

    #[tokio::test]
    async fn duplicate_items_become_noise_without_llm_calls() {
        let fx = fixture(vec![], vec![], open_limits(), UnsupportedLanguageMode::Skip);
        seed_trend(&fx.store, "eu-russia");

        let original = seed_claimed_item(&fx.store, "identical wire copy");
        fx.store
            .set_item_status(&original.id, ProcessingStatus::Classified, None)
            .unwrap();
        // Second item with the same content hash.
        let source = seed_source(&fx.store, "wire", "firsthand");
        let duplicate = build_item(&source, "identical wire copy");
        fx.store.insert_raw_item(&duplicate).unwrap();
        let claimed = fx.store.claim_pending_items(10).unwrap();

        let run = fx.pipeline.process_items(claimed, None).await.unwrap();
        assert_eq!(run.duplicates, 1);
        assert_eq!(run.noise, 1);
        assert_eq!(fx.tier1_backend.calls(), 0);
        let loaded = fx.store.get_raw_item(&duplicate.id).unwrap().unwrap();
        assert_eq!(loaded.processing_status, ProcessingStatus::Noise);
    }

    #[tokio::test]
    async fn unsupported_language_skips_or_defers() {
        for (mode, expected) in [
            (UnsupportedLanguageMode::Skip, ProcessingStatus::Noise),
            (UnsupportedLanguageMode::Defer, ProcessingStatus::Pending),
        ] {
            let fx = fixture(vec![], vec![], open_limits(), mode);
            seed_trend(&fx.store, "eu-russia");
            let source = seed_source(&fx.store, "wire", "firsthand");
            let mut item = build_item(&source, "содержание на русском");
            item.language = Some("ru".into());
            fx.store.insert_raw_item(&item).unwrap();
            let claimed = fx.store.claim_pending_items(10).unwrap();

            let run = fx.pipeline.process_items(claimed, None).await.unwrap();
            assert_eq!(run.errors, 0);
            let loaded = fx.store.get_raw_item(&item.id).unwrap().unwrap();
            assert_eq!(loaded.processing_status, expected);
            assert!(loaded.error_message.unwrap().contains("unsupported language"));
            assert_eq!(fx.tier1_backend.calls(), 0);
        }
    }

    #[tokio::test]
    async fn tier1_budget_exhaustion_reverts_to_pending() {
        let limits = CostLimits {
            tier1_max_daily_calls: 1,
            tier2_max_daily_calls: 0,
            embedding_max_daily_calls: 0,
            daily_cost_limit_usd: 0.0,
            cost_alert_threshold_pct: 0,
        };
        let fx = fixture(vec![], vec![], limits, UnsupportedLanguageMode::Skip);
        seed_trend(&fx.store, "eu-russia");
        // Today's tier-1 budget is already spent.
        fx.tracker.record_usage(LlmTier::Tier1, 1, 1).unwrap();

        let item = seed_claimed_item(&fx.store, "fresh geopolitics item");
        let run = fx.pipeline.process_items(vec![item.clone()], None).await.unwrap();
        assert_eq!(run.errors, 0);
        assert_eq!(run.pending, 1);
        assert_eq!(fx.tier1_backend.calls(), 0, "no tier-1 API call was made");

        let loaded = fx.store.get_raw_item(&item.id).unwrap().unwrap();
        assert_eq!(loaded.processing_status, ProcessingStatus::Pending);
        assert!(loaded.error_message.is_none());
    }

    #[tokio::test]
    async fn tier1_noise_stops_before_tier2() {
        let fx = fixture(vec![], vec![], open_limits(), UnsupportedLanguageMode::Skip);
        seed_trend(&fx.store, "eu-russia");
        seed_trend(&fx.store, "us-china");
        let item = seed_claimed_item(&fx.store, "local sports roundup");

        let fx = {
            let mut fx = fx;
            fx.tier1_backend =
                Arc::new(ScriptedChatBackend::new(vec![tier1_queue_response(&item.id, 1)]));
            fx.pipeline.tier1 = Tier1Classifier::new(
                Arc::clone(&fx.store),
                ChatFailoverInvoker::new(
                    "tier1",
                    ChatRoute::new("openai", "gpt-4.1-nano", fx.tier1_backend.clone()),
                    None,
                    RetryPolicy { max_attempts: 1, backoff_seconds: 0.0 },
                ),
                Arc::clone(&fx.tracker),
                None,
                5,
                10,
            );
            fx
        };

        let run = fx.pipeline.process_items(vec![item.clone()], None).await.unwrap();
        assert_eq!(run.noise, 1);
        assert_eq!(fx.tier2_backend.calls(), 0);
        // The event still exists (clustering happened before tier-1).
        assert!(run.results[0].event_id.is_some());
    }

    #[tokio::test]
    async fn unknown_signal_type_records_taxonomy_gap() {
        let fx = fixture(vec![], vec![], open_limits(), UnsupportedLanguageMode::Skip);
        let trend = seed_trend(&fx.store, "eu-russia");
        let item = seed_claimed_item(&fx.store, "odd signal content");

        let tier2_unknown_signal = Ok(ScriptedChatBackend::completion(
            &json!({
                "summary": "Event summary",
                "extracted_who": [],
                "extracted_what": "Something happened",
                "extracted_where": null,
                "extracted_when": null,
                "claims": [],
                "categories": [],
                "trend_impacts": [{
                    "trend_id": "eu-russia",
                    "signal_type": "unknown_signal",
                    "direction": "escalatory",
                    "severity": 0.7,
                    "confidence": 0.8
                }]
            })
            .to_string(),
            "gpt-4o-mini",
        ));

        let fx = {
            let mut fx = fx;
            fx.tier1_backend = Arc::new(ScriptedChatBackend::new(vec![{
                Ok(ScriptedChatBackend::completion(
                    &json!({
                        "items": [{
                            "item_id": item.id,
                            "trend_scores": [
                                { "trend_id": "eu-russia", "relevance_score": 8 }
                            ]
                        }]
                    })
                    .to_string(),
                    "gpt-4.1-nano",
                ))
            }]));
            fx.tier2_backend = Arc::new(ScriptedChatBackend::new(vec![tier2_unknown_signal]));
            fx.pipeline.tier1 = Tier1Classifier::new(
                Arc::clone(&fx.store),
                ChatFailoverInvoker::new(
                    "tier1",
                    ChatRoute::new("openai", "gpt-4.1-nano", fx.tier1_backend.clone()),
                    None,
                    RetryPolicy { max_attempts: 1, backoff_seconds: 0.0 },
                ),
                Arc::clone(&fx.tracker),
                None,
                5,
                10,
            );
            fx.pipeline.tier2 = Tier2Classifier::new(
                Arc::clone(&fx.store),
                ChatFailoverInvoker::new(
                    "tier2",
                    ChatRoute::new("openai", "gpt-4o-mini", fx.tier2_backend.clone()),
                    None,
                    RetryPolicy { max_attempts: 1, backoff_seconds: 0.0 },
                ),
                Arc::clone(&fx.tracker),
                None,
            );
            fx
        };

        let run = fx.pipeline.process_items(vec![item], None).await.unwrap();
        assert_eq!(run.classified, 1);
        assert_eq!(run.trend_impacts_seen, 1);
        assert_eq!(run.trend_updates, 0, "unknown signal must not move the trend");

        let gaps = fx.store.list_taxonomy_gaps(10).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].reason, TaxonomyGapReason::UnknownSignalType);
        assert_eq!(gaps[0].signal_type.as_deref(), Some("unknown_signal"));

        let trend_after = fx.store.get_trend(&trend.id).unwrap().unwrap();
        assert_eq!(trend_after.current_log_odds, trend.current_log_odds);
    }
}
