// Horadus — Engine Configuration
//
// Env-first settings: every field can be overridden via an environment
// variable of the same (upper-cased) name; `.env` files are honored via
// dotenvy at binary startup. Secrets additionally support `<NAME>_FILE`
// indirection pointing at a file whose trimmed contents become the value.

use crate::atoms::error::{EngineError, EngineResult};
use std::path::PathBuf;

// ── Language policy ────────────────────────────────────────────────────────

/// What to do with items whose language is not in the supported list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedLanguageMode {
    /// Mark the item as noise with a reason.
    Skip,
    /// Leave the item pending with a reason for a later capability.
    Defer,
}

/// Query-string handling during URL normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlQueryMode {
    /// Drop the query string entirely.
    StripAll,
    /// Keep non-tracking params, sorted by key.
    KeepNonTracking,
}

// ── Settings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Settings {
    // Storage
    pub database_path: PathBuf,

    // LLM provider
    pub openai_api_key: String,
    pub llm_base_url: String,
    pub llm_tier1_model: String,
    pub llm_tier2_model: String,
    pub llm_secondary_base_url: Option<String>,
    pub llm_secondary_api_key: Option<String>,
    pub llm_tier1_secondary_model: Option<String>,
    pub llm_tier2_secondary_model: Option<String>,
    pub llm_route_retry_attempts: u32,
    pub llm_route_retry_backoff_seconds: f64,
    pub llm_request_timeout_seconds: u64,
    pub llm_max_payload_tokens: usize,

    // Embeddings
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_batch_size: usize,
    pub embedding_cache_max_size: usize,

    // Processing
    pub tier1_relevance_threshold: i64,
    pub llm_tier1_batch_size: usize,
    pub dedup_similarity_threshold: f64,
    pub dedup_window_days: i64,
    pub url_query_mode: UrlQueryMode,
    pub cluster_similarity_threshold: f64,
    pub cluster_time_window_hours: i64,
    pub supported_languages: Vec<String>,
    pub unsupported_language_mode: UnsupportedLanguageMode,
    pub process_pending_batch_size: usize,
    pub process_pending_interval_minutes: u64,
    pub processing_reaper_interval_minutes: u64,
    pub processing_stale_threshold_minutes: i64,

    // Trend engine
    pub default_decay_half_life_days: i64,
    pub trend_snapshot_interval_minutes: u64,

    // Cost protection
    pub tier1_max_daily_calls: i64,
    pub tier2_max_daily_calls: i64,
    pub embedding_max_daily_calls: i64,
    pub daily_cost_limit_usd: f64,
    pub cost_alert_threshold_pct: i64,

    // Semantic cache
    pub llm_semantic_cache_enabled: bool,
    pub llm_semantic_cache_ttl_seconds: i64,
    pub llm_semantic_cache_max_entries: usize,
    pub llm_semantic_cache_prefix: String,

    // Collection
    pub rss_collection_interval_minutes: u64,
    pub gdelt_collection_interval_minutes: u64,
    pub ingestion_window_overlap_minutes: i64,
    pub source_freshness_alert_multiplier: f64,
    pub source_freshness_check_interval_minutes: u64,

    // Calibration drift
    pub calibration_drift_min_resolved_outcomes: usize,
    pub calibration_drift_brier_warn_threshold: f64,
    pub calibration_drift_brier_critical_threshold: f64,
    pub calibration_drift_bucket_error_warn_threshold: f64,
    pub calibration_drift_bucket_error_critical_threshold: f64,
    pub calibration_drift_webhook_url: Option<String>,
    pub calibration_drift_webhook_timeout_seconds: f64,
    pub calibration_drift_webhook_max_retries: u32,
    pub calibration_drift_webhook_backoff_seconds: f64,

    // Application
    pub environment: String,
    pub secret_key: String,
    pub api_auth_required: bool,
    pub admin_api_key: Option<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: PathBuf::from("horadus.db"),

            openai_api_key: String::new(),
            llm_base_url: "https://api.openai.com".into(),
            llm_tier1_model: "gpt-4.1-nano".into(),
            llm_tier2_model: "gpt-4o-mini".into(),
            llm_secondary_base_url: None,
            llm_secondary_api_key: None,
            llm_tier1_secondary_model: None,
            llm_tier2_secondary_model: None,
            llm_route_retry_attempts: 2,
            llm_route_retry_backoff_seconds: 0.25,
            llm_request_timeout_seconds: 120,
            llm_max_payload_tokens: 24_000,

            embedding_base_url: "https://api.openai.com".into(),
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            embedding_batch_size: 32,
            embedding_cache_max_size: 512,

            tier1_relevance_threshold: 5,
            llm_tier1_batch_size: 10,
            dedup_similarity_threshold: 0.92,
            dedup_window_days: 7,
            url_query_mode: UrlQueryMode::StripAll,
            cluster_similarity_threshold: 0.88,
            cluster_time_window_hours: 48,
            supported_languages: vec!["en".into()],
            unsupported_language_mode: UnsupportedLanguageMode::Skip,
            process_pending_batch_size: 100,
            process_pending_interval_minutes: 5,
            processing_reaper_interval_minutes: 10,
            processing_stale_threshold_minutes: 30,

            default_decay_half_life_days: 30,
            trend_snapshot_interval_minutes: 60,

            tier1_max_daily_calls: 1000,
            tier2_max_daily_calls: 200,
            embedding_max_daily_calls: 500,
            daily_cost_limit_usd: 5.0,
            cost_alert_threshold_pct: 80,

            llm_semantic_cache_enabled: false,
            llm_semantic_cache_ttl_seconds: 3600,
            llm_semantic_cache_max_entries: 512,
            llm_semantic_cache_prefix: "horadus:llm_semantic_cache".into(),

            rss_collection_interval_minutes: 30,
            gdelt_collection_interval_minutes: 60,
            ingestion_window_overlap_minutes: 5,
            source_freshness_alert_multiplier: 3.0,
            source_freshness_check_interval_minutes: 15,

            calibration_drift_min_resolved_outcomes: 20,
            calibration_drift_brier_warn_threshold: 0.20,
            calibration_drift_brier_critical_threshold: 0.30,
            calibration_drift_bucket_error_warn_threshold: 0.15,
            calibration_drift_bucket_error_critical_threshold: 0.25,
            calibration_drift_webhook_url: None,
            calibration_drift_webhook_timeout_seconds: 5.0,
            calibration_drift_webhook_max_retries: 3,
            calibration_drift_webhook_backoff_seconds: 1.0,

            environment: "development".into(),
            secret_key: DEV_SECRET_KEY.into(),
            api_auth_required: false,
            admin_api_key: None,
            log_level: "info".into(),
        }
    }
}

const DEV_SECRET_KEY: &str = "dev-secret-key-change-in-production";
const MIN_SECRET_KEY_LEN: usize = 32;

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> EngineResult<Self> {
        let mut s = Settings::default();

        if let Some(v) = env_string("DATABASE_PATH") {
            s.database_path = PathBuf::from(v);
        }

        s.openai_api_key = env_secret("OPENAI_API_KEY")?.unwrap_or(s.openai_api_key);
        set_string(&mut s.llm_base_url, "LLM_BASE_URL");
        set_string(&mut s.llm_tier1_model, "LLM_TIER1_MODEL");
        set_string(&mut s.llm_tier2_model, "LLM_TIER2_MODEL");
        s.llm_secondary_base_url = env_string("LLM_SECONDARY_BASE_URL");
        s.llm_secondary_api_key = env_secret("LLM_SECONDARY_API_KEY")?;
        s.llm_tier1_secondary_model = env_string("LLM_TIER1_SECONDARY_MODEL");
        s.llm_tier2_secondary_model = env_string("LLM_TIER2_SECONDARY_MODEL");
        set_parsed(&mut s.llm_route_retry_attempts, "LLM_ROUTE_RETRY_ATTEMPTS")?;
        set_parsed(
            &mut s.llm_route_retry_backoff_seconds,
            "LLM_ROUTE_RETRY_BACKOFF_SECONDS",
        )?;
        set_parsed(&mut s.llm_request_timeout_seconds, "LLM_REQUEST_TIMEOUT_SECONDS")?;
        set_parsed(&mut s.llm_max_payload_tokens, "LLM_MAX_PAYLOAD_TOKENS")?;

        set_string(&mut s.embedding_base_url, "EMBEDDING_BASE_URL");
        set_string(&mut s.embedding_model, "EMBEDDING_MODEL");
        set_parsed(&mut s.embedding_dimensions, "EMBEDDING_DIMENSIONS")?;
        set_parsed(&mut s.embedding_batch_size, "EMBEDDING_BATCH_SIZE")?;
        set_parsed(&mut s.embedding_cache_max_size, "EMBEDDING_CACHE_MAX_SIZE")?;

        set_parsed(&mut s.tier1_relevance_threshold, "TIER1_RELEVANCE_THRESHOLD")?;
        set_parsed(&mut s.llm_tier1_batch_size, "LLM_TIER1_BATCH_SIZE")?;
        set_parsed(&mut s.dedup_similarity_threshold, "DEDUP_SIMILARITY_THRESHOLD")?;
        set_parsed(&mut s.dedup_window_days, "DEDUP_WINDOW_DAYS")?;
        if let Some(v) = env_string("URL_QUERY_MODE") {
            s.url_query_mode = match v.as_str() {
                "strip_all" => UrlQueryMode::StripAll,
                "keep_non_tracking" => UrlQueryMode::KeepNonTracking,
                other => {
                    return Err(EngineError::Config(format!(
                        "URL_QUERY_MODE must be strip_all or keep_non_tracking, got '{other}'"
                    )))
                }
            };
        }
        set_parsed(&mut s.cluster_similarity_threshold, "CLUSTER_SIMILARITY_THRESHOLD")?;
        set_parsed(&mut s.cluster_time_window_hours, "CLUSTER_TIME_WINDOW_HOURS")?;
        if let Some(v) = env_string("SUPPORTED_LANGUAGES") {
            s.supported_languages = v
                .split(',')
                .map(|lang| lang.trim().to_lowercase())
                .filter(|lang| !lang.is_empty())
                .collect();
        }
        if let Some(v) = env_string("UNSUPPORTED_LANGUAGE_MODE") {
            s.unsupported_language_mode = match v.as_str() {
                "skip" => UnsupportedLanguageMode::Skip,
                "defer" => UnsupportedLanguageMode::Defer,
                other => {
                    return Err(EngineError::Config(format!(
                        "UNSUPPORTED_LANGUAGE_MODE must be skip or defer, got '{other}'"
                    )))
                }
            };
        }
        set_parsed(&mut s.process_pending_batch_size, "PROCESS_PENDING_BATCH_SIZE")?;
        set_parsed(
            &mut s.process_pending_interval_minutes,
            "PROCESS_PENDING_INTERVAL_MINUTES",
        )?;
        set_parsed(
            &mut s.processing_reaper_interval_minutes,
            "PROCESSING_REAPER_INTERVAL_MINUTES",
        )?;
        set_parsed(
            &mut s.processing_stale_threshold_minutes,
            "PROCESSING_STALE_THRESHOLD_MINUTES",
        )?;

        set_parsed(&mut s.default_decay_half_life_days, "DEFAULT_DECAY_HALF_LIFE_DAYS")?;
        set_parsed(
            &mut s.trend_snapshot_interval_minutes,
            "TREND_SNAPSHOT_INTERVAL_MINUTES",
        )?;

        set_parsed(&mut s.tier1_max_daily_calls, "TIER1_MAX_DAILY_CALLS")?;
        set_parsed(&mut s.tier2_max_daily_calls, "TIER2_MAX_DAILY_CALLS")?;
        set_parsed(&mut s.embedding_max_daily_calls, "EMBEDDING_MAX_DAILY_CALLS")?;
        set_parsed(&mut s.daily_cost_limit_usd, "DAILY_COST_LIMIT_USD")?;
        set_parsed(&mut s.cost_alert_threshold_pct, "COST_ALERT_THRESHOLD_PCT")?;

        if let Some(v) = env_string("LLM_SEMANTIC_CACHE_ENABLED") {
            s.llm_semantic_cache_enabled = parse_bool(&v);
        }
        set_parsed(&mut s.llm_semantic_cache_ttl_seconds, "LLM_SEMANTIC_CACHE_TTL_SECONDS")?;
        set_parsed(&mut s.llm_semantic_cache_max_entries, "LLM_SEMANTIC_CACHE_MAX_ENTRIES")?;
        set_string(&mut s.llm_semantic_cache_prefix, "LLM_SEMANTIC_CACHE_PREFIX");

        set_parsed(&mut s.rss_collection_interval_minutes, "RSS_COLLECTION_INTERVAL")?;
        set_parsed(&mut s.gdelt_collection_interval_minutes, "GDELT_COLLECTION_INTERVAL")?;
        set_parsed(
            &mut s.ingestion_window_overlap_minutes,
            "INGESTION_WINDOW_OVERLAP_MINUTES",
        )?;
        set_parsed(
            &mut s.source_freshness_alert_multiplier,
            "SOURCE_FRESHNESS_ALERT_MULTIPLIER",
        )?;
        set_parsed(
            &mut s.source_freshness_check_interval_minutes,
            "SOURCE_FRESHNESS_CHECK_INTERVAL_MINUTES",
        )?;

        set_parsed(
            &mut s.calibration_drift_min_resolved_outcomes,
            "CALIBRATION_DRIFT_MIN_RESOLVED_OUTCOMES",
        )?;
        set_parsed(
            &mut s.calibration_drift_brier_warn_threshold,
            "CALIBRATION_DRIFT_BRIER_WARN_THRESHOLD",
        )?;
        set_parsed(
            &mut s.calibration_drift_brier_critical_threshold,
            "CALIBRATION_DRIFT_BRIER_CRITICAL_THRESHOLD",
        )?;
        set_parsed(
            &mut s.calibration_drift_bucket_error_warn_threshold,
            "CALIBRATION_DRIFT_BUCKET_ERROR_WARN_THRESHOLD",
        )?;
        set_parsed(
            &mut s.calibration_drift_bucket_error_critical_threshold,
            "CALIBRATION_DRIFT_BUCKET_ERROR_CRITICAL_THRESHOLD",
        )?;
        s.calibration_drift_webhook_url = env_string("CALIBRATION_DRIFT_WEBHOOK_URL");
        set_parsed(
            &mut s.calibration_drift_webhook_timeout_seconds,
            "CALIBRATION_DRIFT_WEBHOOK_TIMEOUT_SECONDS",
        )?;
        set_parsed(
            &mut s.calibration_drift_webhook_max_retries,
            "CALIBRATION_DRIFT_WEBHOOK_MAX_RETRIES",
        )?;
        set_parsed(
            &mut s.calibration_drift_webhook_backoff_seconds,
            "CALIBRATION_DRIFT_WEBHOOK_BACKOFF_SECONDS",
        )?;

        set_string(&mut s.environment, "ENVIRONMENT");
        s.secret_key = env_secret("SECRET_KEY")?.unwrap_or(s.secret_key);
        if let Some(v) = env_string("API_AUTH_REQUIRED") {
            s.api_auth_required = parse_bool(&v);
        }
        s.admin_api_key = env_secret("ADMIN_API_KEY")?;
        set_string(&mut s.log_level, "LOG_LEVEL");

        Ok(s)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Production guardrails: refuse to start with a default or weak secret
    /// key, or with auth enabled but no admin key configured.
    pub fn validate_production(&self) -> EngineResult<()> {
        if !self.is_production() {
            return Ok(());
        }
        if self.secret_key == DEV_SECRET_KEY {
            return Err(EngineError::Config(
                "SECRET_KEY must be changed from the development default in production".into(),
            ));
        }
        if self.secret_key.len() < MIN_SECRET_KEY_LEN {
            return Err(EngineError::Config(format!(
                "SECRET_KEY must be at least {MIN_SECRET_KEY_LEN} characters in production"
            )));
        }
        if !self.api_auth_required {
            return Err(EngineError::Config(
                "API_AUTH_REQUIRED must be enabled in production".into(),
            ));
        }
        if self
            .admin_api_key
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
        {
            return Err(EngineError::Config(
                "ADMIN_API_KEY must be configured in production".into(),
            ));
        }
        Ok(())
    }
}

// ── Env helpers ────────────────────────────────────────────────────────────

fn env_string(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        }
        Err(_) => None,
    }
}

fn set_string(target: &mut String, name: &str) {
    if let Some(v) = env_string(name) {
        *target = v;
    }
}

fn set_parsed<T: std::str::FromStr>(target: &mut T, name: &str) -> EngineResult<()> {
    if let Some(v) = env_string(name) {
        *target = v
            .parse::<T>()
            .map_err(|_| EngineError::Config(format!("{name} has invalid value '{v}'")))?;
    }
    Ok(())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Secrets: `<NAME>` wins; otherwise `<NAME>_FILE` points at a file whose
/// trimmed contents become the value.
fn env_secret(name: &str) -> EngineResult<Option<String>> {
    if let Some(value) = env_string(name) {
        return Ok(Some(value));
    }
    let file_var = format!("{name}_FILE");
    if let Some(path) = env_string(&file_var) {
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::Config(format!("{file_var} points at unreadable file {path}: {e}"))
        })?;
        let trimmed = contents.trim().to_string();
        if trimmed.is_empty() {
            return Err(EngineError::Config(format!("{file_var} file {path} is empty")));
        }
        return Ok(Some(trimmed));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_development_safe() {
        let s = Settings::default();
        assert!(!s.is_production());
        assert!(s.validate_production().is_ok());
        assert_eq!(s.tier1_relevance_threshold, 5);
        assert!((s.dedup_similarity_threshold - 0.92).abs() < f64::EPSILON);
        assert!((s.cluster_similarity_threshold - 0.88).abs() < f64::EPSILON);
    }

    #[test]
    fn production_requires_real_secret_key() {
        let mut s = Settings::default();
        s.environment = "production".into();
        assert!(s.validate_production().is_err());

        s.secret_key = "x".repeat(40);
        assert!(s.validate_production().is_err()); // auth still off

        s.api_auth_required = true;
        assert!(s.validate_production().is_err()); // admin key missing

        s.admin_api_key = Some("hor_admin_0123456789".into());
        assert!(s.validate_production().is_ok());
    }

    #[test]
    fn secret_file_indirection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.txt");
        std::fs::write(&path, "  key-from-file\n").unwrap();
        std::env::set_var("HORADUS_TEST_SECRET_FILE", &path);
        let value = env_secret("HORADUS_TEST_SECRET").unwrap();
        assert_eq!(value.as_deref(), Some("key-from-file"));
        std::env::remove_var("HORADUS_TEST_SECRET_FILE");
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(parse_bool("YES"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }
}
