// Horadus — Deduplication Service
//
// Duplicate detection for incoming raw items. Checks are ordered and
// short-circuit on the first hit: external_id → normalized url →
// content_hash → embedding similarity. All lookups are bounded to a
// rolling fetched_at window, and the probe item can exclude itself so
// re-runs stay idempotent.

use crate::atoms::error::{EngineError, EngineResult};
use crate::config::UrlQueryMode;
use crate::engine::similarity::{cosine_similarity, max_distance_for_similarity};
use crate::engine::store::{ItemMatchColumn, Store};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use url::Url;

/// How a duplicate was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    ExternalId,
    Url,
    ContentHash,
    Embedding,
}

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReason::ExternalId => "external_id",
            MatchReason::Url => "url",
            MatchReason::ContentHash => "content_hash",
            MatchReason::Embedding => "embedding",
        }
    }
}

/// Result of a duplicate lookup.
#[derive(Debug, Clone, Default)]
pub struct DedupResult {
    pub is_duplicate: bool,
    pub matched_item_id: Option<String>,
    pub match_reason: Option<MatchReason>,
    pub similarity: Option<f64>,
}

/// One duplicate probe.
#[derive(Debug, Clone, Default)]
pub struct DedupRequest<'a> {
    pub external_id: Option<&'a str>,
    pub url: Option<&'a str>,
    pub content_hash: Option<&'a str>,
    pub embedding: Option<&'a [f32]>,
    pub embedding_model: Option<&'a str>,
    pub exclude_item_id: Option<&'a str>,
}

/// Query params dropped in `keep_non_tracking` mode.
const TRACKING_PARAM_PREFIXES: [&str; 1] = ["utm_"];
const TRACKING_PARAMS: [&str; 4] = ["fbclid", "gclid", "ref", "source"];

pub struct DeduplicationService {
    store: Arc<Store>,
    similarity_threshold: f64,
    window_days: i64,
    query_mode: UrlQueryMode,
}

impl DeduplicationService {
    pub fn new(
        store: Arc<Store>,
        similarity_threshold: f64,
        window_days: i64,
        query_mode: UrlQueryMode,
    ) -> Self {
        DeduplicationService {
            store,
            similarity_threshold,
            window_days,
            query_mode,
        }
    }

    /// Return duplicate match details for a candidate item.
    pub fn find_duplicate(&self, request: &DedupRequest<'_>) -> EngineResult<DedupResult> {
        max_distance_for_similarity(self.similarity_threshold)?;
        let window_start = Utc::now() - Duration::days(self.window_days);

        if let Some(external_id) = non_empty(request.external_id) {
            if let Some(matched) = self.store.find_item_by_field(
                ItemMatchColumn::ExternalId,
                external_id,
                window_start,
                request.exclude_item_id,
            )? {
                return Ok(matched_result(matched, MatchReason::ExternalId, None));
            }
        }

        if let Some(raw_url) = non_empty(request.url) {
            if let Some(normalized) = normalize_url(raw_url, self.query_mode) {
                if let Some(matched) = self.store.find_item_by_field(
                    ItemMatchColumn::Url,
                    &normalized,
                    window_start,
                    request.exclude_item_id,
                )? {
                    return Ok(matched_result(matched, MatchReason::Url, None));
                }
            }
        }

        if let Some(content_hash) = non_empty(request.content_hash) {
            if let Some(matched) = self.store.find_item_by_field(
                ItemMatchColumn::ContentHash,
                content_hash,
                window_start,
                request.exclude_item_id,
            )? {
                return Ok(matched_result(matched, MatchReason::ContentHash, None));
            }
        }

        if let Some(embedding) = request.embedding {
            if embedding.is_empty() {
                return Err(EngineError::validation("embedding must not be empty"));
            }
            let Some(model) = non_empty(request.embedding_model) else {
                return Err(EngineError::validation(
                    "embedding_model is required for embedding dedup",
                ));
            };
            let candidates = self.store.embedding_dedup_candidates(
                model,
                window_start,
                request.exclude_item_id,
            )?;
            if let Some((matched, similarity)) = self.best_embedding_match(embedding, &candidates)
            {
                return Ok(matched_result(
                    matched,
                    MatchReason::Embedding,
                    Some(similarity),
                ));
            }
        }

        Ok(DedupResult::default())
    }

    /// Convenience wrapper returning only duplicate status.
    pub fn is_duplicate(&self, request: &DedupRequest<'_>) -> EngineResult<bool> {
        Ok(self.find_duplicate(request)?.is_duplicate)
    }

    /// Lowest-distance candidate at or above the similarity threshold,
    /// tie broken by item id so results are stable.
    fn best_embedding_match(
        &self,
        embedding: &[f32],
        candidates: &[(String, Vec<f32>)],
    ) -> Option<(String, f64)> {
        let mut best: Option<(String, f64)> = None;
        for (item_id, candidate) in candidates {
            let similarity = cosine_similarity(embedding, candidate);
            if similarity < self.similarity_threshold {
                continue;
            }
            let replace = match &best {
                None => true,
                Some((best_id, best_similarity)) => {
                    similarity > *best_similarity
                        || (similarity == *best_similarity && item_id < best_id)
                }
            };
            if replace {
                best = Some((item_id.clone(), similarity));
            }
        }
        best
    }
}

fn matched_result(
    matched_item_id: String,
    reason: MatchReason,
    similarity: Option<f64>,
) -> DedupResult {
    DedupResult {
        is_duplicate: true,
        matched_item_id: Some(matched_item_id),
        match_reason: Some(reason),
        similarity,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// ── URL normalization ──────────────────────────────────────────────────────

/// Normalize a URL for exact matching: lowercase scheme/host, strip `www.`,
/// drop default ports and fragments, trim the trailing slash. Query handling
/// depends on the mode: drop entirely, or keep non-tracking params sorted.
/// Returns None for unparseable or non-http(s)-shaped inputs.
pub fn normalize_url(raw: &str, query_mode: UrlQueryMode) -> Option<String> {
    let parsed = Url::parse(raw.trim()).ok()?;
    let scheme = parsed.scheme().to_lowercase();
    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        return None;
    }

    let default_port = match scheme.as_str() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    let port_suffix = match parsed.port() {
        Some(port) if Some(port) != default_port => format!(":{port}"),
        _ => String::new(),
    };

    let path = parsed.path().trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    let query_suffix = match query_mode {
        UrlQueryMode::StripAll => String::new(),
        UrlQueryMode::KeepNonTracking => {
            let mut pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(key, _)| !is_tracking_param(key))
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            if pairs.is_empty() {
                String::new()
            } else {
                pairs.sort();
                let joined = pairs
                    .iter()
                    .map(|(key, value)| {
                        if value.is_empty() {
                            key.clone()
                        } else {
                            format!("{key}={value}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("&");
                format!("?{joined}")
            }
        }
    };

    Some(format!("{scheme}://{host}{port_suffix}{path}{query_suffix}"))
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_lowercase();
    TRACKING_PARAM_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
        || TRACKING_PARAMS.iter().any(|param| key == *param)
}

/// SHA-256 hash of normalized content, hex-encoded — the exact-dedup key.
pub fn compute_content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::ProcessingStatus;
    use crate::engine::store::Store;

    fn service(store: Arc<Store>) -> DeduplicationService {
        DeduplicationService::new(store, 0.92, 7, UrlQueryMode::StripAll)
    }

    fn insert_item(
        store: &Store,
        content: &str,
        external_id: Option<&str>,
        url: Option<&str>,
    ) -> String {
        use crate::atoms::types::{RawItem, Source, SourceType};
        let source = Source {
            id: uuid::Uuid::new_v4().to_string(),
            name: "dedup-source".into(),
            source_type: SourceType::Rss,
            url: None,
            credibility_score: 0.8,
            source_tier: None,
            reporting_type: None,
            is_active: true,
            last_fetched_at: None,
            ingestion_window_end_at: None,
            error_count: 0,
            last_error: None,
            config: serde_json::json!({}),
        };
        store.insert_source(&source).unwrap();
        let item = RawItem {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source.id,
            external_id: external_id.map(str::to_string),
            url: url.map(str::to_string),
            title: None,
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
        };
        store.insert_raw_item(&item).unwrap();
        item.id
    }

    #[test]
    fn checks_short_circuit_in_order() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let by_external = insert_item(&store, "story one", Some("ext-1"), None);
        let by_hash = insert_item(&store, "story two", None, None);

        let service = service(store);
        // external_id hit wins even though a content hash also matches
        // another row.
        let result = service
            .find_duplicate(&DedupRequest {
                external_id: Some("ext-1"),
                content_hash: Some(&compute_content_hash("story two")),
                ..Default::default()
            })
            .unwrap();
        assert!(result.is_duplicate);
        assert_eq!(result.match_reason, Some(MatchReason::ExternalId));
        assert_eq!(result.matched_item_id.as_deref(), Some(by_external.as_str()));

        let result = service
            .find_duplicate(&DedupRequest {
                content_hash: Some(&compute_content_hash("story two")),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.match_reason, Some(MatchReason::ContentHash));
        assert_eq!(result.matched_item_id.as_deref(), Some(by_hash.as_str()));
    }

    #[test]
    fn embedding_match_requires_same_model_and_picks_best() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let near = insert_item(&store, "embedding near", None, None);
        let far = insert_item(&store, "embedding far", None, None);
        store
            .update_item_embedding(&near, &[1.0, 0.0, 0.0], "model-a", Utc::now())
            .unwrap();
        store
            .update_item_embedding(&far, &[0.95, 0.3, 0.1], "model-a", Utc::now())
            .unwrap();

        let service = service(store.clone());
        let probe = [1.0f32, 0.01, 0.0];

        let result = service
            .find_duplicate(&DedupRequest {
                embedding: Some(&probe),
                embedding_model: Some("model-a"),
                ..Default::default()
            })
            .unwrap();
        assert!(result.is_duplicate);
        assert_eq!(result.match_reason, Some(MatchReason::Embedding));
        assert_eq!(result.matched_item_id.as_deref(), Some(near.as_str()));
        assert!(result.similarity.unwrap() > 0.99);

        // Different stored model: no candidates, no duplicate.
        let result = service
            .find_duplicate(&DedupRequest {
                embedding: Some(&probe),
                embedding_model: Some("model-b"),
                ..Default::default()
            })
            .unwrap();
        assert!(!result.is_duplicate);
    }

    #[test]
    fn exclude_item_id_hides_self() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let item_id = insert_item(&store, "self match", None, None);
        let service = service(store);
        let hash = compute_content_hash("self match");

        let result = service
            .find_duplicate(&DedupRequest {
                content_hash: Some(&hash),
                exclude_item_id: Some(&item_id),
                ..Default::default()
            })
            .unwrap();
        assert!(!result.is_duplicate);
    }

    #[test]
    fn url_normalization_rules() {
        let mode = UrlQueryMode::StripAll;
        assert_eq!(
            normalize_url("HTTPS://WWW.Example.COM:443/News/", mode).unwrap(),
            "https://example.com/News"
        );
        assert_eq!(
            normalize_url("http://example.com:8080/a?utm_source=x", mode).unwrap(),
            "http://example.com:8080/a"
        );
        assert_eq!(normalize_url("http://example.com", mode).unwrap(), "http://example.com/");
        assert!(normalize_url("not a url", mode).is_none());

        let keep = UrlQueryMode::KeepNonTracking;
        assert_eq!(
            normalize_url(
                "https://example.com/a?utm_campaign=spring&page=2&fbclid=abc&q=kyiv",
                keep
            )
            .unwrap(),
            "https://example.com/a?page=2&q=kyiv"
        );
    }

    #[test]
    fn url_normalization_is_idempotent() {
        for mode in [UrlQueryMode::StripAll, UrlQueryMode::KeepNonTracking] {
            let once =
                normalize_url("https://www.Example.com/path/?page=2&utm_source=x", mode).unwrap();
            let twice = normalize_url(&once, mode).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn content_hash_is_stable_sha256() {
        let hash = compute_content_hash("hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, compute_content_hash("hello"));
        assert_ne!(hash, compute_content_hash("hello "));
    }
}
