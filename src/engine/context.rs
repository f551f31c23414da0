// Horadus — Engine Context
//
// Explicit dependency wiring: every service is constructed once at process
// start from Settings and handed down as part of this context. No module
// holds global mutable state; cross-worker coordination goes through the
// shared store.

use crate::atoms::error::EngineResult;
use crate::config::Settings;
use crate::engine::calibration::{CalibrationService, DriftThresholds};
use crate::engine::cluster::EventClusterer;
use crate::engine::cost::{CostLimits, CostTracker};
use crate::engine::dedup::DeduplicationService;
use crate::engine::embedding::{EmbeddingService, HttpEmbeddingBackend};
use crate::engine::freshness::FreshnessIntervals;
use crate::engine::llm::failover::{ChatFailoverInvoker, ChatRoute, RetryPolicy};
use crate::engine::llm::provider::{ApiMode, HttpChatBackend};
use crate::engine::pipeline::{LanguagePolicy, ProcessingPipeline};
use crate::engine::semantic_cache::{SemanticCache, SemanticCacheConfig};
use crate::engine::store::Store;
use crate::engine::tier1::Tier1Classifier;
use crate::engine::tier2::Tier2Classifier;
use crate::engine::trend::TrendEngine;
use crate::engine::webhook::{DriftAlertWebhookNotifier, WebhookConfig};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub struct EngineContext {
    pub settings: Settings,
    pub store: Arc<Store>,
    pub cost_tracker: Arc<CostTracker>,
    pub embedding: Arc<EmbeddingService>,
    pub pipeline: ProcessingPipeline,
    pub trend_engine: TrendEngine,
    pub calibration: CalibrationService,
    pub drift_thresholds: DriftThresholds,
    pub drift_notifier: DriftAlertWebhookNotifier,
    pub freshness: FreshnessIntervals,
    /// Cooperative shutdown flag checked between retries and loop ticks.
    pub shutdown: Arc<AtomicBool>,
}

impl EngineContext {
    /// Open the store at the configured path and wire every service.
    pub fn from_settings(settings: Settings) -> EngineResult<Arc<Self>> {
        let store = Arc::new(Store::open(&settings.database_path)?);
        Self::with_store(settings, store)
    }

    /// Wire services over an existing store (tests use the in-memory one).
    pub fn with_store(settings: Settings, store: Arc<Store>) -> EngineResult<Arc<Self>> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let cost_tracker = Arc::new(CostTracker::new(
            Arc::clone(&store),
            CostLimits::from_settings(&settings),
        ));

        let embedding_backend = Arc::new(HttpEmbeddingBackend::new(
            settings.embedding_base_url.clone(),
            settings.openai_api_key.clone(),
        ));
        let embedding = Arc::new(EmbeddingService::new(
            Arc::clone(&store),
            embedding_backend,
            Arc::clone(&cost_tracker),
            settings.embedding_model.clone(),
            settings.embedding_dimensions,
            settings.embedding_batch_size,
            settings.embedding_cache_max_size,
        ));

        let semantic_cache = Arc::new(SemanticCache::new(
            Arc::clone(&store),
            SemanticCacheConfig::from_settings(&settings),
        ));

        let retry_policy = RetryPolicy::new(
            settings.llm_route_retry_attempts.max(1),
            settings.llm_route_retry_backoff_seconds.max(0.0),
        )?;

        let tier1 = Tier1Classifier::new(
            Arc::clone(&store),
            Self::build_invoker(
                &settings,
                "tier1",
                &settings.llm_tier1_model,
                settings.llm_tier1_secondary_model.as_deref(),
                retry_policy.clone(),
                &shutdown,
            ),
            Arc::clone(&cost_tracker),
            Some(Arc::clone(&semantic_cache)),
            settings.tier1_relevance_threshold,
            settings.llm_tier1_batch_size,
        )
        .with_max_payload_tokens(settings.llm_max_payload_tokens);
        let tier2 = Tier2Classifier::new(
            Arc::clone(&store),
            Self::build_invoker(
                &settings,
                "tier2",
                &settings.llm_tier2_model,
                settings.llm_tier2_secondary_model.as_deref(),
                retry_policy,
                &shutdown,
            ),
            Arc::clone(&cost_tracker),
            Some(Arc::clone(&semantic_cache)),
        )
        .with_max_payload_tokens(settings.llm_max_payload_tokens);

        let pipeline = ProcessingPipeline::new(
            Arc::clone(&store),
            DeduplicationService::new(
                Arc::clone(&store),
                settings.dedup_similarity_threshold,
                settings.dedup_window_days,
                settings.url_query_mode,
            ),
            Arc::clone(&embedding),
            EventClusterer::new(
                Arc::clone(&store),
                settings.cluster_similarity_threshold,
                settings.cluster_time_window_hours,
            ),
            tier1,
            tier2,
            TrendEngine::new(Arc::clone(&store)),
            LanguagePolicy {
                supported: settings.supported_languages.clone(),
                mode: settings.unsupported_language_mode,
            },
        );

        let context = EngineContext {
            drift_thresholds: DriftThresholds::from_settings(&settings),
            drift_notifier: DriftAlertWebhookNotifier::new(WebhookConfig::from_settings(
                &settings,
            )),
            freshness: FreshnessIntervals::from_settings(&settings),
            trend_engine: TrendEngine::new(Arc::clone(&store)),
            calibration: CalibrationService::new(Arc::clone(&store)),
            cost_tracker,
            embedding,
            pipeline,
            store,
            settings,
            shutdown,
        };
        Ok(Arc::new(context))
    }

    fn build_invoker(
        settings: &Settings,
        stage: &str,
        primary_model: &str,
        secondary_model: Option<&str>,
        retry_policy: RetryPolicy,
        shutdown: &Arc<AtomicBool>,
    ) -> ChatFailoverInvoker {
        let primary_backend = Arc::new(HttpChatBackend::new(
            "openai",
            settings.llm_base_url.clone(),
            settings.openai_api_key.clone(),
            ApiMode::ChatCompletions,
            settings.llm_request_timeout_seconds,
        ));
        let primary = ChatRoute::new("openai", primary_model, primary_backend);

        let secondary = match (secondary_model, settings.llm_secondary_base_url.as_deref()) {
            (Some(model), Some(base_url)) => {
                let api_key = settings
                    .llm_secondary_api_key
                    .clone()
                    .unwrap_or_else(|| settings.openai_api_key.clone());
                let backend = Arc::new(HttpChatBackend::new(
                    "secondary",
                    base_url,
                    api_key,
                    ApiMode::ChatCompletions,
                    settings.llm_request_timeout_seconds,
                ));
                Some(ChatRoute::new("secondary", model, backend))
            }
            _ => None,
        };

        ChatFailoverInvoker::new(stage, primary, secondary, retry_policy)
            .with_cancellation(Arc::clone(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wires_from_default_settings() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let context = EngineContext::with_store(Settings::default(), store).unwrap();
        assert!(!context.shutdown.load(std::sync::atomic::Ordering::Relaxed));
        // Budget tracker is live and reports an active day.
        let summary = context.cost_tracker.get_daily_summary().unwrap();
        assert_eq!(summary.status, "active");
    }
}
