// Database schema and migrations for the Horadus store.
// Called once at startup by Store::open() after WAL is enabled.
// Adding a new table or column: append an idempotent CREATE TABLE IF NOT
// EXISTS or ALTER TABLE … ADD COLUMN (errors are silently swallowed) at the
// end of run_migrations() — never modify existing SQL to keep upgrade paths
// clean.

use crate::atoms::error::EngineResult;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    // ── Ingestion ────────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            source_type TEXT NOT NULL,
            url TEXT,
            credibility_score REAL NOT NULL DEFAULT 0.5,
            source_tier TEXT,
            reporting_type TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_fetched_at TEXT,
            ingestion_window_end_at TEXT,
            error_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            config_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS raw_items (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            external_id TEXT,
            url TEXT,
            title TEXT,
            raw_content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            language TEXT,
            fetched_at TEXT NOT NULL,
            published_at TEXT,
            embedding BLOB,
            embedding_model TEXT,
            embedding_generated_at TEXT,
            processing_status TEXT NOT NULL DEFAULT 'pending',
            processing_started_at TEXT,
            error_message TEXT,
            FOREIGN KEY (source_id) REFERENCES sources(id)
        );

        CREATE INDEX IF NOT EXISTS idx_raw_items_fetched_at
            ON raw_items(fetched_at);
        CREATE INDEX IF NOT EXISTS idx_raw_items_status
            ON raw_items(processing_status, fetched_at);
        CREATE INDEX IF NOT EXISTS idx_raw_items_content_hash
            ON raw_items(content_hash);
        ",
    )?;

    // ── Events ───────────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            canonical_summary TEXT NOT NULL,
            embedding BLOB,
            embedding_model TEXT,
            embedding_generated_at TEXT,
            source_count INTEGER NOT NULL DEFAULT 1,
            unique_source_count INTEGER NOT NULL DEFAULT 1,
            first_seen_at TEXT NOT NULL,
            last_mention_at TEXT NOT NULL,
            confirmed_at TEXT,
            lifecycle_status TEXT NOT NULL DEFAULT 'emerging',
            primary_item_id TEXT,
            extracted_who_json TEXT,
            extracted_what TEXT,
            extracted_where TEXT,
            extracted_when TEXT,
            categories_json TEXT,
            extracted_claims_json TEXT,
            has_contradictions INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_events_last_mention
            ON events(last_mention_at);
        CREATE INDEX IF NOT EXISTS idx_events_lifecycle
            ON events(lifecycle_status, last_mention_at);

        CREATE TABLE IF NOT EXISTS event_items (
            event_id TEXT NOT NULL,
            item_id TEXT NOT NULL UNIQUE,
            added_at TEXT NOT NULL,
            PRIMARY KEY (event_id, item_id),
            FOREIGN KEY (event_id) REFERENCES events(id),
            FOREIGN KEY (item_id) REFERENCES raw_items(id)
        );

        CREATE INDEX IF NOT EXISTS idx_event_items_event
            ON event_items(event_id, added_at DESC);
        ",
    )?;

    // ── Trends ───────────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS trends (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            definition_json TEXT NOT NULL DEFAULT '{}',
            indicators_json TEXT NOT NULL DEFAULT '{}',
            baseline_log_odds REAL NOT NULL DEFAULT 0,
            current_log_odds REAL NOT NULL DEFAULT 0,
            decay_half_life_days INTEGER NOT NULL DEFAULT 30,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS trend_evidence (
            id TEXT PRIMARY KEY,
            trend_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            signal_type TEXT NOT NULL,
            delta_log_odds REAL NOT NULL,
            factors_json TEXT NOT NULL DEFAULT '{}',
            reasoning TEXT,
            is_invalidated INTEGER NOT NULL DEFAULT 0,
            invalidated_at TEXT,
            invalidation_feedback_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (trend_id) REFERENCES trends(id)
        );

        CREATE INDEX IF NOT EXISTS idx_trend_evidence_event
            ON trend_evidence(event_id);
        CREATE INDEX IF NOT EXISTS idx_trend_evidence_trend_event
            ON trend_evidence(trend_id, event_id);

        CREATE TABLE IF NOT EXISTS trend_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trend_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            log_odds REAL NOT NULL,
            FOREIGN KEY (trend_id) REFERENCES trends(id)
        );

        CREATE INDEX IF NOT EXISTS idx_trend_snapshots_trend_ts
            ON trend_snapshots(trend_id, timestamp);

        CREATE TABLE IF NOT EXISTS trend_outcomes (
            id TEXT PRIMARY KEY,
            trend_id TEXT NOT NULL,
            prediction_date TEXT NOT NULL,
            predicted_probability REAL NOT NULL,
            predicted_risk_level TEXT NOT NULL,
            probability_band_low REAL NOT NULL,
            probability_band_high REAL NOT NULL,
            outcome TEXT NOT NULL,
            outcome_notes TEXT,
            outcome_evidence_json TEXT,
            brier_score REAL,
            recorded_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (trend_id) REFERENCES trends(id)
        );

        CREATE INDEX IF NOT EXISTS idx_trend_outcomes_trend_date
            ON trend_outcomes(trend_id, prediction_date);
        ",
    )?;

    // ── Accounting, feedback, audit ──────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS api_usage (
            usage_date TEXT NOT NULL,
            tier TEXT NOT NULL,
            call_count INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            estimated_cost_usd REAL NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (usage_date, tier)
        );

        CREATE TABLE IF NOT EXISTS human_feedback (
            id TEXT PRIMARY KEY,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            action TEXT NOT NULL,
            original_value_json TEXT,
            corrected_value_json TEXT,
            notes TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_human_feedback_target
            ON human_feedback(target_type, target_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS taxonomy_gaps (
            id TEXT PRIMARY KEY,
            reason TEXT NOT NULL,
            trend_id TEXT NOT NULL,
            signal_type TEXT,
            event_id TEXT,
            payload_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        ",
    )?;

    // ── Runtime coordination ─────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS semantic_cache (
            cache_key TEXT PRIMARY KEY,
            stage TEXT NOT NULL,
            value TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            touched_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_semantic_cache_stage
            ON semantic_cache(stage, touched_at);

        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_name TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            failed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runtime_kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )?;

    // ── Owned by external collaborators (report generator, trend config
    //    versioning) — the core only guarantees the tables exist. ──────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS reports (
            id TEXT PRIMARY KEY,
            report_type TEXT NOT NULL,
            period_start TEXT NOT NULL,
            period_end TEXT NOT NULL,
            content_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS trend_definition_versions (
            id TEXT PRIMARY KEY,
            trend_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            definition_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            UNIQUE (trend_id, version)
        );
        ",
    )?;

    Ok(())
}
