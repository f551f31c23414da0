// Horadus — LLM Semantic Cache
//
// Optional cross-worker cache for tier-1/tier-2 JSON outputs, shared
// through the store. Keys bind the stage, model, prompt template hash, and
// a canonical payload hash, so any change to prompt or payload misses.
// When the backend errors, the cache degrades to bypass for a short window
// instead of failing the pipeline.

use crate::atoms::constants::SEMANTIC_CACHE_DEGRADE_SECONDS;
use crate::engine::observability::record_semantic_cache_lookup;
use crate::engine::store::Store;
use chrono::{DateTime, Duration, Utc};
use log::warn;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    pub enabled: bool,
    pub ttl_seconds: i64,
    pub max_entries: usize,
    pub prefix: String,
}

impl SemanticCacheConfig {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        SemanticCacheConfig {
            enabled: settings.llm_semantic_cache_enabled,
            ttl_seconds: settings.llm_semantic_cache_ttl_seconds.max(1),
            max_entries: settings.llm_semantic_cache_max_entries.max(1),
            prefix: settings.llm_semantic_cache_prefix.clone(),
        }
    }
}

pub struct SemanticCache {
    store: Arc<Store>,
    config: SemanticCacheConfig,
    degraded_until: Mutex<Option<DateTime<Utc>>>,
}

impl SemanticCache {
    pub fn new(store: Arc<Store>, config: SemanticCacheConfig) -> Self {
        SemanticCache {
            store,
            config,
            degraded_until: Mutex::new(None),
        }
    }

    /// `<prefix>:<stage>:v1:<model>:<sha256(prompt)>:<sha256(payload)>`
    pub fn build_cache_key(
        prefix: &str,
        stage: &str,
        model: &str,
        prompt_template: &str,
        payload: &serde_json::Value,
    ) -> String {
        let prompt_hash = sha256_hex(prompt_template.trim().as_bytes());
        let payload_hash = sha256_hex(canonical_json(payload).as_bytes());
        format!("{prefix}:{stage}:v1:{}:{prompt_hash}:{payload_hash}", model.trim())
    }

    pub fn get(
        &self,
        stage: &str,
        model: &str,
        prompt_template: &str,
        payload: &serde_json::Value,
    ) -> Option<String> {
        if !self.config.enabled || self.is_degraded() {
            return None;
        }
        let key =
            Self::build_cache_key(&self.config.prefix, stage, model, prompt_template, payload);
        match self.store.semantic_cache_get(&key, Utc::now()) {
            Ok(Some(value)) if !value.trim().is_empty() => {
                record_semantic_cache_lookup(stage, true);
                Some(value)
            }
            Ok(_) => {
                record_semantic_cache_lookup(stage, false);
                None
            }
            Err(_) => {
                self.degrade(stage);
                record_semantic_cache_lookup(stage, false);
                None
            }
        }
    }

    pub fn set(
        &self,
        stage: &str,
        model: &str,
        prompt_template: &str,
        payload: &serde_json::Value,
        value: &str,
    ) {
        if !self.config.enabled || self.is_degraded() {
            return;
        }
        let key =
            Self::build_cache_key(&self.config.prefix, stage, model, prompt_template, payload);
        if self
            .store
            .semantic_cache_put(
                &key,
                stage,
                value,
                self.config.ttl_seconds,
                self.config.max_entries,
                Utc::now(),
            )
            .is_err()
        {
            self.degrade(stage);
        }
    }

    fn is_degraded(&self) -> bool {
        matches!(*self.degraded_until.lock(), Some(until) if Utc::now() < until)
    }

    fn degrade(&self, stage: &str) {
        warn!(
            "[semantic-cache] Backend unavailable, bypassing: stage={} retry_after={}s",
            stage, SEMANTIC_CACHE_DEGRADE_SECONDS
        );
        *self.degraded_until.lock() =
            Some(Utc::now() + Duration::seconds(SEMANTIC_CACHE_DEGRADE_SECONDS));
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Canonical JSON serialization: object keys sorted recursively so the same
/// logical payload always hashes identically.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(key.clone()),
                        canonical_json(&map[key])
                    )
                })
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        serde_json::Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", entries.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(enabled: bool) -> SemanticCache {
        SemanticCache::new(
            Arc::new(Store::open_in_memory().unwrap()),
            SemanticCacheConfig {
                enabled,
                ttl_seconds: 60,
                max_entries: 8,
                prefix: "horadus:llm_semantic_cache".into(),
            },
        )
    }

    #[test]
    fn key_is_stable_across_key_order() {
        let a = json!({ "b": 1, "a": [1, 2] });
        let b = json!({ "a": [1, 2], "b": 1 });
        let key_a = SemanticCache::build_cache_key("p", "tier1", "m", "prompt", &a);
        let key_b = SemanticCache::build_cache_key("p", "tier1", "m", "prompt", &b);
        assert_eq!(key_a, key_b);
        assert!(key_a.starts_with("p:tier1:v1:m:"));

        let different_payload =
            SemanticCache::build_cache_key("p", "tier1", "m", "prompt", &json!({ "a": 2 }));
        assert_ne!(key_a, different_payload);
        let different_prompt =
            SemanticCache::build_cache_key("p", "tier1", "m", "other prompt", &a);
        assert_ne!(key_a, different_prompt);
    }

    #[test]
    fn round_trip_when_enabled() {
        let cache = cache(true);
        let payload = json!({ "items": ["x"] });
        assert!(cache.get("tier1", "m", "prompt", &payload).is_none());
        cache.set("tier1", "m", "prompt", &payload, "{\"items\":[]}");
        assert_eq!(
            cache.get("tier1", "m", "prompt", &payload).as_deref(),
            Some("{\"items\":[]}")
        );
    }

    #[test]
    fn disabled_cache_is_inert() {
        let cache = cache(false);
        let payload = json!({});
        cache.set("tier1", "m", "prompt", &payload, "value");
        assert!(cache.get("tier1", "m", "prompt", &payload).is_none());
    }
}
