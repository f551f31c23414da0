// Horadus — Metric Recorders
// Thin helpers over the `metrics` facade so call sites stay one-liners and
// metric names/labels live in one place. The exporter is wired by the host
// process; without one these are no-ops.

/// Ingestion item counts by collector and status.
pub fn record_collector_metrics(
    collector: &str,
    fetched: u64,
    stored: u64,
    skipped: u64,
    errors: u64,
) {
    let collector = collector.to_string();
    metrics::counter!("ingestion_items_total", fetched, "collector" => collector.clone(), "status" => "fetched");
    metrics::counter!("ingestion_items_total", stored, "collector" => collector.clone(), "status" => "stored");
    metrics::counter!("ingestion_items_total", skipped, "collector" => collector.clone(), "status" => "skipped");
    metrics::counter!("ingestion_items_total", errors, "collector" => collector, "status" => "errors");
}

/// LLM API call counts by stage.
pub fn record_llm_api_call(stage: &str) {
    metrics::counter!("llm_api_calls_total", 1, "stage" => stage.to_string());
}

/// Budget enforcement denial by tier and reason.
pub fn record_budget_denial(tier: &str, reason: &str) {
    metrics::counter!("llm_budget_denials_total", 1,
        "tier" => tier.to_string(), "reason" => reason.to_string());
}

/// Semantic cache lookup outcome.
pub fn record_semantic_cache_lookup(stage: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("llm_semantic_cache_lookups_total", 1,
        "stage" => stage.to_string(), "result" => result);
}

/// Event suppression applied during processing.
pub fn record_event_suppression(action: &str, stage: &str) {
    metrics::counter!("processing_event_suppressions_total", 1,
        "action" => action.to_string(), "stage" => stage.to_string());
}

/// Corroboration scoring path selection.
pub fn record_corroboration_path(mode: &str, reason: &str) {
    metrics::counter!("processing_corroboration_path_total", 1,
        "mode" => mode.to_string(), "reason" => reason.to_string());
}

/// Taxonomy gap captured from an LLM output.
pub fn record_taxonomy_gap(reason: &str) {
    metrics::counter!("taxonomy_gaps_total", 1, "reason" => reason.to_string());
}

/// Stale processing items reset to pending by the reaper.
pub fn record_reaper_resets(count: u64) {
    metrics::counter!("processing_reaper_resets_total", count);
}

/// Calibration drift alert emitted.
pub fn record_drift_alert(alert_type: &str, severity: &str) {
    metrics::counter!("calibration_drift_alerts_total", 1,
        "alert_type" => alert_type.to_string(), "severity" => severity.to_string());
}

/// Stale source detection by collector type.
pub fn record_stale_source(collector: &str) {
    metrics::counter!("source_freshness_stale_total", 1, "collector" => collector.to_string());
}

/// Worker task failure.
pub fn record_worker_error(task_name: &str) {
    metrics::counter!("worker_errors_total", 1, "task_name" => task_name.to_string());
}

/// Pending raw-item backlog depth observed during dispatch.
pub fn record_backlog_depth(depth: i64) {
    metrics::gauge!("processing_backlog_depth", depth as f64);
}
