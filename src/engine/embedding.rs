// Horadus — Embedding Service
//
// Batched vector generation with an in-process LRU keyed by sha256 of the
// normalized text. Cache misses are deduplicated, grouped into batches, and
// sent through the provider behind a budget check; responses are validated
// strictly (index alignment, exact dimension, finite values) before
// anything is cached or persisted.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::LlmTier;
use crate::engine::cost::CostTracker;
use crate::engine::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use log::info;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ── Provider seam ──────────────────────────────────────────────────────────

/// One provider response: vectors in input order plus prompt token usage.
#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub vectors: Vec<Vec<f32>>,
    pub prompt_tokens: i64,
}

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, model: &str, inputs: &[String]) -> EngineResult<EmbeddingResponse>;
}

/// OpenAI-compatible embeddings endpoint: POST /v1/embeddings.
pub struct HttpEmbeddingBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpEmbeddingBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpEmbeddingBackend {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    async fn embed(&self, model: &str, inputs: &[String]) -> EngineResult<EmbeddingResponse> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({ "model": model, "input": inputs });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                "embeddings",
                Some(status.as_u16()),
                detail,
            ));
        }

        let payload: Value = response.json().await?;
        let data = payload["data"]
            .as_array()
            .ok_or_else(|| EngineError::validation("embedding response missing data list"))?;

        // Order by the provider-reported index, not array position.
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for (fallback_index, item) in data.iter().enumerate() {
            let index = item["index"].as_u64().map(|i| i as usize).unwrap_or(fallback_index);
            let raw = item["embedding"]
                .as_array()
                .ok_or_else(|| EngineError::validation("embedding response missing vector"))?;
            let mut vector = Vec::with_capacity(raw.len());
            for value in raw {
                let value = value
                    .as_f64()
                    .ok_or_else(|| EngineError::validation("embedding vector has non-numeric value"))?;
                vector.push(value as f32);
            }
            indexed.push((index, vector));
        }
        indexed.sort_by_key(|(index, _)| *index);
        let vectors = indexed.into_iter().map(|(_, vector)| vector).collect();

        let usage = &payload["usage"];
        let prompt_tokens = usage["prompt_tokens"]
            .as_i64()
            .filter(|tokens| *tokens > 0)
            .or_else(|| usage["total_tokens"].as_i64())
            .unwrap_or(0);

        Ok(EmbeddingResponse {
            vectors,
            prompt_tokens,
        })
    }
}

// ── LRU cache ──────────────────────────────────────────────────────────────

/// Small process-local LRU: map + recency list. Not shared across workers.
struct LruCache {
    map: HashMap<String, Vec<f32>>,
    order: Vec<String>,
    capacity: usize,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        LruCache {
            map: HashMap::new(),
            order: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        let value = self.map.get(key)?.clone();
        self.touch(key);
        Some(value)
    }

    fn put(&mut self, key: String, value: Vec<f32>) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push(key.clone());
        }
        self.touch(&key);
        while self.map.len() > self.capacity {
            let evicted = self.order.remove(0);
            self.map.remove(&evicted);
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(position);
            self.order.push(key);
        }
    }
}

// ── Service ────────────────────────────────────────────────────────────────

/// Summary metrics for one persistence run.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingRunResult {
    pub entity_type: &'static str,
    pub scanned: usize,
    pub embedded: usize,
    pub cache_hits: usize,
    pub api_calls: usize,
}

pub struct EmbeddingService {
    store: Arc<Store>,
    backend: Arc<dyn EmbeddingBackend>,
    cost_tracker: Arc<CostTracker>,
    model: String,
    dimensions: usize,
    batch_size: usize,
    cache: Mutex<LruCache>,
}

impl EmbeddingService {
    pub fn new(
        store: Arc<Store>,
        backend: Arc<dyn EmbeddingBackend>,
        cost_tracker: Arc<CostTracker>,
        model: impl Into<String>,
        dimensions: usize,
        batch_size: usize,
        cache_max_size: usize,
    ) -> Self {
        EmbeddingService {
            store,
            backend,
            cost_tracker,
            model: model.into(),
            dimensions,
            batch_size: batch_size.max(1),
            cache: Mutex::new(LruCache::new(cache_max_size)),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a single embedding.
    pub async fn embed_text(&self, text: &str) -> EngineResult<Vec<f32>> {
        let (mut vectors, _hits, _calls) = self.embed_texts(&[text.to_string()]).await?;
        Ok(vectors.remove(0))
    }

    /// Generate embeddings for multiple texts with cache reuse.
    /// Returns (vectors in input order, cache_hits, api_calls).
    pub async fn embed_texts(
        &self,
        texts: &[String],
    ) -> EngineResult<(Vec<Vec<f32>>, usize, usize)> {
        if texts.is_empty() {
            return Ok((Vec::new(), 0, 0));
        }

        let normalized: Vec<String> = texts
            .iter()
            .map(|text| normalize_text(text))
            .collect::<EngineResult<_>>()?;

        let mut results: Vec<Option<Vec<f32>>> = vec![None; normalized.len()];
        let mut cache_hits = 0usize;
        // key → input positions awaiting that vector, insertion-ordered
        let mut miss_keys: Vec<String> = Vec::new();
        let mut miss_positions: HashMap<String, Vec<usize>> = HashMap::new();
        let mut miss_texts: HashMap<String, String> = HashMap::new();

        {
            let mut cache = self.cache.lock();
            for (position, text) in normalized.iter().enumerate() {
                let key = cache_key(text);
                if let Some(vector) = cache.get(&key) {
                    results[position] = Some(vector);
                    cache_hits += 1;
                    continue;
                }
                if !miss_positions.contains_key(&key) {
                    miss_keys.push(key.clone());
                    miss_texts.insert(key.clone(), text.clone());
                }
                miss_positions.entry(key).or_default().push(position);
            }
        }

        let mut api_calls = 0usize;
        for chunk in miss_keys.chunks(self.batch_size) {
            let inputs: Vec<String> = chunk.iter().map(|key| miss_texts[key].clone()).collect();
            let vectors = self.request_embeddings(&inputs).await?;
            api_calls += 1;

            let mut cache = self.cache.lock();
            for (key, vector) in chunk.iter().zip(vectors) {
                cache.put(key.clone(), vector.clone());
                for position in &miss_positions[key] {
                    results[*position] = Some(vector.clone());
                }
            }
        }

        let finalized: Vec<Vec<f32>> = results.into_iter().flatten().collect();
        if finalized.len() != texts.len() {
            return Err(EngineError::validation(
                "embedding generation failed to produce vectors for all inputs",
            ));
        }
        Ok((finalized, cache_hits, api_calls))
    }

    /// Generate and persist embeddings for raw items missing vectors.
    pub async fn embed_raw_items_without_embedding(
        &self,
        limit: usize,
    ) -> EngineResult<EmbeddingRunResult> {
        let items = self.store.items_without_embedding(limit)?;
        if items.is_empty() {
            return Ok(EmbeddingRunResult {
                entity_type: "raw_items",
                ..Default::default()
            });
        }

        let texts: Vec<String> = items.iter().map(|item| item.raw_content.clone()).collect();
        let (vectors, cache_hits, api_calls) = self.embed_texts(&texts).await?;
        let generated_at = Utc::now();
        for (item, vector) in items.iter().zip(&vectors) {
            self.store
                .update_item_embedding(&item.id, vector, &self.model, generated_at)?;
        }
        info!(
            "[embedding] Embedded raw items: count={} cache_hits={} api_calls={}",
            items.len(),
            cache_hits,
            api_calls
        );
        Ok(EmbeddingRunResult {
            entity_type: "raw_items",
            scanned: items.len(),
            embedded: items.len(),
            cache_hits,
            api_calls,
        })
    }

    /// Generate and persist embeddings for events missing vectors.
    pub async fn embed_events_without_embedding(
        &self,
        limit: usize,
    ) -> EngineResult<EmbeddingRunResult> {
        let events = self.store.events_without_embedding(limit)?;
        if events.is_empty() {
            return Ok(EmbeddingRunResult {
                entity_type: "events",
                ..Default::default()
            });
        }

        let texts: Vec<String> = events
            .iter()
            .map(|event| event.canonical_summary.clone())
            .collect();
        let (vectors, cache_hits, api_calls) = self.embed_texts(&texts).await?;
        let generated_at = Utc::now();
        for (event, vector) in events.iter().zip(&vectors) {
            self.store
                .update_event_embedding(&event.id, vector, &self.model, generated_at)?;
        }
        info!(
            "[embedding] Embedded events: count={} cache_hits={} api_calls={}",
            events.len(),
            cache_hits,
            api_calls
        );
        Ok(EmbeddingRunResult {
            entity_type: "events",
            scanned: events.len(),
            embedded: events.len(),
            cache_hits,
            api_calls,
        })
    }

    /// One budget-checked provider call, with strict response validation.
    async fn request_embeddings(&self, inputs: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        self.cost_tracker.ensure_within_budget(LlmTier::Embedding)?;
        let response = self.backend.embed(&self.model, inputs).await?;

        if response.vectors.len() != inputs.len() {
            return Err(EngineError::validation(format!(
                "embedding response size mismatch: expected {}, got {}",
                inputs.len(),
                response.vectors.len()
            )));
        }
        for vector in &response.vectors {
            if vector.len() != self.dimensions {
                return Err(EngineError::validation(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimensions,
                    vector.len()
                )));
            }
            if vector.iter().any(|value| !value.is_finite()) {
                return Err(EngineError::validation(
                    "embedding vector contains non-finite value",
                ));
            }
        }

        self.cost_tracker
            .record_usage(LlmTier::Embedding, response.prompt_tokens, 0)?;
        Ok(response.vectors)
    }
}

fn normalize_text(text: &str) -> EngineResult<String> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Err(EngineError::validation("embedding input text must not be empty"));
    }
    Ok(normalized)
}

fn cache_key(normalized_text: &str) -> String {
    let digest = Sha256::digest(normalized_text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Deterministic backend: hashes each input into a small vector and
    /// counts calls. Optionally misbehaves for validation tests.
    pub struct FakeEmbeddingBackend {
        pub dimensions: usize,
        pub calls: Mutex<Vec<Vec<String>>>,
        pub corrupt_dimension: bool,
    }

    impl FakeEmbeddingBackend {
        pub fn new(dimensions: usize) -> Self {
            FakeEmbeddingBackend {
                dimensions,
                calls: Mutex::new(Vec::new()),
                corrupt_dimension: false,
            }
        }

        pub fn vector_for(&self, text: &str) -> Vec<f32> {
            let digest = Sha256::digest(text.as_bytes());
            (0..self.dimensions)
                .map(|i| digest[i % digest.len()] as f32 / 255.0)
                .collect()
        }
    }

    #[async_trait]
    impl EmbeddingBackend for FakeEmbeddingBackend {
        async fn embed(&self, _model: &str, inputs: &[String]) -> EngineResult<EmbeddingResponse> {
            self.calls.lock().push(inputs.to_vec());
            let dims = if self.corrupt_dimension {
                self.dimensions + 1
            } else {
                self.dimensions
            };
            let vectors = inputs
                .iter()
                .map(|text| {
                    let digest = Sha256::digest(text.as_bytes());
                    (0..dims).map(|i| digest[i % digest.len()] as f32 / 255.0).collect()
                })
                .collect();
            Ok(EmbeddingResponse {
                vectors,
                prompt_tokens: inputs.len() as i64 * 8,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeEmbeddingBackend;
    use super::*;
    use crate::engine::cost::{CostLimits, CostTracker};

    fn tracker(store: &Arc<Store>, embedding_calls: i64) -> Arc<CostTracker> {
        Arc::new(CostTracker::new(
            Arc::clone(store),
            CostLimits {
                tier1_max_daily_calls: 0,
                tier2_max_daily_calls: 0,
                embedding_max_daily_calls: embedding_calls,
                daily_cost_limit_usd: 0.0,
                cost_alert_threshold_pct: 0,
            },
        ))
    }

    fn service(
        store: Arc<Store>,
        backend: Arc<FakeEmbeddingBackend>,
        batch_size: usize,
        cache_size: usize,
    ) -> EmbeddingService {
        let tracker = tracker(&store, 0);
        EmbeddingService::new(store, backend, tracker, "fake-embed", 8, batch_size, cache_size)
    }

    #[tokio::test]
    async fn caches_and_deduplicates_inputs() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let backend = Arc::new(FakeEmbeddingBackend::new(8));
        let service = service(store, backend.clone(), 32, 16);

        let texts = vec![
            "alpha story".to_string(),
            "beta  story".to_string(),
            "alpha   story".to_string(), // same after whitespace normalization
        ];
        let (vectors, cache_hits, api_calls) = service.embed_texts(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[2]);
        assert_eq!(cache_hits, 0);
        assert_eq!(api_calls, 1);
        // Only two unique texts were sent.
        assert_eq!(backend.calls.lock()[0].len(), 2);

        // Second pass is fully cached.
        let (_vectors, cache_hits, api_calls) = service.embed_texts(&texts).await.unwrap();
        assert_eq!(cache_hits, 3);
        assert_eq!(api_calls, 0);
    }

    #[tokio::test]
    async fn batches_misses_by_configured_size() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let backend = Arc::new(FakeEmbeddingBackend::new(8));
        let service = service(store, backend.clone(), 2, 64);

        let texts: Vec<String> = (0..5).map(|i| format!("text number {i}")).collect();
        let (_vectors, _hits, api_calls) = service.embed_texts(&texts).await.unwrap();
        assert_eq!(api_calls, 3); // 2 + 2 + 1
        let sizes: Vec<usize> = backend.calls.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn rejects_empty_input_and_bad_dimensions() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let backend = Arc::new(FakeEmbeddingBackend::new(8));
        let service = service(store.clone(), backend, 32, 16);
        assert!(service.embed_texts(&["   ".to_string()]).await.is_err());

        let mut bad_backend = FakeEmbeddingBackend::new(8);
        bad_backend.corrupt_dimension = true;
        let tracker = tracker(&store, 0);
        let bad_service = EmbeddingService::new(
            store,
            Arc::new(bad_backend),
            tracker,
            "fake-embed",
            8,
            32,
            16,
        );
        let error = bad_service
            .embed_texts(&["some text".to_string()])
            .await
            .unwrap_err();
        assert!(error.to_string().contains("dimension mismatch"));
    }

    #[tokio::test]
    async fn budget_denial_blocks_provider_call() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let backend = Arc::new(FakeEmbeddingBackend::new(8));
        let tracker = tracker(&store, 1);
        tracker.record_usage(LlmTier::Embedding, 1, 0).unwrap();
        let service =
            EmbeddingService::new(store, backend.clone(), tracker, "fake-embed", 8, 32, 16);

        let error = service
            .embed_texts(&["fresh text".to_string()])
            .await
            .unwrap_err();
        assert!(error.is_budget_exceeded());
        assert!(backend.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn persists_missing_item_embeddings() {
        use crate::engine::store::Store;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let backend = Arc::new(FakeEmbeddingBackend::new(8));
        let service = service(store.clone(), backend, 32, 16);

        let item = crate::engine::testutil::seed_pending_item(&store, "needs embedding");
        let run = service.embed_raw_items_without_embedding(10).await.unwrap();
        assert_eq!(run.embedded, 1);
        assert_eq!(run.api_calls, 1);

        let loaded = store.get_raw_item(&item).unwrap().unwrap();
        assert_eq!(loaded.embedding.unwrap().len(), 8);
        assert_eq!(loaded.embedding_model.as_deref(), Some("fake-embed"));
        assert!(loaded.embedding_generated_at.is_some());
    }

    #[tokio::test]
    async fn lru_evicts_oldest_entries() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let backend = Arc::new(FakeEmbeddingBackend::new(8));
        let service = service(store, backend.clone(), 32, 2);

        for text in ["one", "two", "three"] {
            service.embed_text(text).await.unwrap();
        }
        // "one" was evicted (capacity 2) → re-embedding it calls the API.
        let before = backend.calls.lock().len();
        service.embed_text("one").await.unwrap();
        assert_eq!(backend.calls.lock().len(), before + 1);
        // "three" is still cached.
        service.embed_text("three").await.unwrap();
        assert_eq!(backend.calls.lock().len(), before + 1);
    }
}
