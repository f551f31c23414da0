// Horadus — Worker Tasks
//
// Each periodic task is a named handler over the engine context returning
// a JSON result payload. `run_task_with_retry` gives every handler the
// same failure discipline: bounded retries with jittered exponential
// backoff, then a dead-letter record once the budget is exhausted.
// Nothing below the task boundary re-raises across task calls.

use crate::atoms::error::EngineResult;
use crate::engine::calibration::build_drift_alerts;
use crate::engine::context::EngineContext;
use crate::engine::freshness::build_source_freshness_report;
use crate::engine::lifecycle;
use crate::engine::observability::{record_backlog_depth, record_reaper_resets, record_worker_error};
use chrono::Utc;
use log::{error, info, warn};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const TASK_MAX_RETRIES: u32 = 3;
const TASK_BACKOFF_SECONDS: f64 = 2.0;
const TASK_BACKOFF_CAP_SECONDS: f64 = 300.0;

/// Every periodic task the scheduler can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    ProcessPendingItems,
    EmbedMissingVectors,
    SnapshotTrends,
    ApplyTrendDecay,
    CheckEventLifecycles,
    ReapStaleProcessingItems,
    CheckSourceFreshness,
    CheckCalibrationDrift,
    PruneSemanticCache,
    Heartbeat,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::ProcessPendingItems => "process_pending_items",
            TaskKind::EmbedMissingVectors => "embed_missing_vectors",
            TaskKind::SnapshotTrends => "snapshot_trends",
            TaskKind::ApplyTrendDecay => "apply_trend_decay",
            TaskKind::CheckEventLifecycles => "check_event_lifecycles",
            TaskKind::ReapStaleProcessingItems => "reap_stale_processing_items",
            TaskKind::CheckSourceFreshness => "check_source_freshness",
            TaskKind::CheckCalibrationDrift => "check_calibration_drift",
            TaskKind::PruneSemanticCache => "prune_semantic_cache",
            TaskKind::Heartbeat => "heartbeat",
        }
    }
}

/// Dispatch one task by kind.
pub async fn run_task(ctx: &Arc<EngineContext>, kind: TaskKind) -> EngineResult<Value> {
    match kind {
        TaskKind::ProcessPendingItems => process_pending_items(ctx).await,
        TaskKind::EmbedMissingVectors => embed_missing_vectors(ctx).await,
        TaskKind::SnapshotTrends => snapshot_trends(ctx),
        TaskKind::ApplyTrendDecay => apply_trend_decay(ctx),
        TaskKind::CheckEventLifecycles => check_event_lifecycles(ctx),
        TaskKind::ReapStaleProcessingItems => reap_stale_processing_items(ctx),
        TaskKind::CheckSourceFreshness => check_source_freshness(ctx),
        TaskKind::CheckCalibrationDrift => check_calibration_drift(ctx).await,
        TaskKind::PruneSemanticCache => prune_semantic_cache(ctx),
        TaskKind::Heartbeat => heartbeat(ctx),
    }
}

/// Run a task under the shared retry discipline. Returns the final result;
/// an exhausted retry budget lands the failure in the dead-letter list.
pub async fn run_task_with_retry(ctx: &Arc<EngineContext>, kind: TaskKind) -> Option<Value> {
    let mut last_error = String::new();
    for attempt in 0..=TASK_MAX_RETRIES {
        if ctx.shutdown.load(Ordering::Relaxed) {
            return None;
        }
        match run_task(ctx, kind).await {
            Ok(result) => {
                if attempt > 0 {
                    info!("[worker] Task {} recovered on retry {}", kind.name(), attempt);
                }
                return Some(result);
            }
            Err(err) => {
                last_error = err.to_string();
                record_worker_error(kind.name());
                if attempt >= TASK_MAX_RETRIES {
                    break;
                }
                let backoff = task_backoff(attempt);
                warn!(
                    "[worker] Task {} failed (attempt {}/{}): {} — retrying in {:.1}s",
                    kind.name(),
                    attempt + 1,
                    TASK_MAX_RETRIES + 1,
                    last_error,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }

    error!(
        "[worker] Task {} exhausted its retry budget: {}",
        kind.name(),
        last_error
    );
    let payload = json!({
        "task_name": kind.name(),
        "exception_message": last_error,
        "retries": TASK_MAX_RETRIES,
        "failed_at": Utc::now().to_rfc3339(),
    });
    if let Err(err) = ctx.store.push_dead_letter(kind.name(), &payload) {
        error!("[worker] Failed to push dead letter for {}: {}", kind.name(), err);
    }
    None
}

/// Exponential backoff with ±25% jitter, capped at five minutes.
fn task_backoff(attempt: u32) -> Duration {
    let base = TASK_BACKOFF_SECONDS * 2f64.powi(attempt as i32);
    let capped = base.min(TASK_BACKOFF_CAP_SECONDS);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(capped * jitter)
}

// ── Handlers ───────────────────────────────────────────────────────────────

async fn process_pending_items(ctx: &Arc<EngineContext>) -> EngineResult<Value> {
    record_backlog_depth(ctx.store.count_pending_items()?);
    let run = ctx
        .pipeline
        .process_pending_items(ctx.settings.process_pending_batch_size)
        .await?;
    Ok(run.to_json())
}

async fn embed_missing_vectors(ctx: &Arc<EngineContext>) -> EngineResult<Value> {
    let items = ctx.embedding.embed_raw_items_without_embedding(100).await?;
    let events = ctx.embedding.embed_events_without_embedding(100).await?;
    Ok(json!({
        "raw_items_embedded": items.embedded,
        "events_embedded": events.embedded,
        "cache_hits": items.cache_hits + events.cache_hits,
        "api_calls": items.api_calls + events.api_calls,
    }))
}

fn snapshot_trends(ctx: &Arc<EngineContext>) -> EngineResult<Value> {
    let count = ctx.trend_engine.snapshot_trends(Utc::now())?;
    Ok(json!({ "snapshots_written": count }))
}

fn apply_trend_decay(ctx: &Arc<EngineContext>) -> EngineResult<Value> {
    let summary = ctx.trend_engine.apply_decay(Utc::now())?;
    Ok(serde_json::to_value(summary)?)
}

fn check_event_lifecycles(ctx: &Arc<EngineContext>) -> EngineResult<Value> {
    let summary = lifecycle::run_decay_check(&ctx.store, Utc::now())?;
    Ok(serde_json::to_value(summary)?)
}

fn reap_stale_processing_items(ctx: &Arc<EngineContext>) -> EngineResult<Value> {
    let cutoff =
        Utc::now() - chrono::Duration::minutes(ctx.settings.processing_stale_threshold_minutes);
    let reset = ctx.store.reap_stale_processing_items(cutoff)?;
    if reset > 0 {
        record_reaper_resets(reset as u64);
        info!("[worker] Reaper reset {} stale processing item(s)", reset);
    }
    Ok(json!({ "items_reset": reset }))
}

fn check_source_freshness(ctx: &Arc<EngineContext>) -> EngineResult<Value> {
    let report = build_source_freshness_report(&ctx.store, &ctx.freshness, Utc::now())?;
    Ok(json!({
        "sources_checked": report.rows.len(),
        "stale_count": report.stale_count(),
        "stale_collectors": report.stale_collectors(),
    }))
}

async fn check_calibration_drift(ctx: &Arc<EngineContext>) -> EngineResult<Value> {
    let trends = ctx.store.list_active_trends()?;
    let mut total_alerts = 0usize;
    for trend in &trends {
        let report = ctx.calibration.get_calibration_report(&trend.id, None, None)?;
        let alerts = build_drift_alerts(&report, &ctx.drift_thresholds);
        if alerts.is_empty() {
            continue;
        }
        total_alerts += alerts.len();
        ctx.drift_notifier
            .notify(&trend.identifier(), Utc::now(), &alerts)
            .await?;
    }
    Ok(json!({ "trends_checked": trends.len(), "alerts": total_alerts }))
}

fn prune_semantic_cache(ctx: &Arc<EngineContext>) -> EngineResult<Value> {
    let removed = ctx.store.semantic_cache_prune(Utc::now())?;
    Ok(json!({ "entries_removed": removed }))
}

fn heartbeat(ctx: &Arc<EngineContext>) -> EngineResult<Value> {
    let now = Utc::now().to_rfc3339();
    ctx.store.kv_set("worker:heartbeat", &now)?;
    Ok(json!({ "heartbeat_at": now }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::ProcessingStatus;
    use crate::config::Settings;
    use crate::engine::store::Store;
    use crate::engine::testutil::{seed_pending_item, seed_trend};

    fn context() -> Arc<EngineContext> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        EngineContext::with_store(Settings::default(), store).unwrap()
    }

    #[tokio::test]
    async fn snapshot_and_lifecycle_tasks_report_counts() {
        let ctx = context();
        seed_trend(&ctx.store, "task-test");

        let result = run_task(&ctx, TaskKind::SnapshotTrends).await.unwrap();
        assert_eq!(result["snapshots_written"], 1);

        let result = run_task(&ctx, TaskKind::CheckEventLifecycles).await.unwrap();
        assert_eq!(result["confirmed_to_fading"], 0);
    }

    #[tokio::test]
    async fn reaper_task_resets_stale_items() {
        let ctx = context();
        let item_id = seed_pending_item(&ctx.store, "stuck item");
        ctx.store.claim_pending_items(10).unwrap();
        // Force the claim far into the past.
        {
            let conn = ctx.store.conn.lock();
            conn.execute(
                "UPDATE raw_items SET processing_started_at = '2000-01-01T00:00:00.000000Z'",
                [],
            )
            .unwrap();
        }

        let result = run_task(&ctx, TaskKind::ReapStaleProcessingItems).await.unwrap();
        assert_eq!(result["items_reset"], 1);
        let item = ctx.store.get_raw_item(&item_id).unwrap().unwrap();
        assert_eq!(item.processing_status, ProcessingStatus::Pending);
    }

    #[tokio::test]
    async fn heartbeat_lands_in_runtime_kv() {
        let ctx = context();
        run_task(&ctx, TaskKind::Heartbeat).await.unwrap();
        assert!(ctx.store.kv_get("worker:heartbeat").unwrap().is_some());
    }

    #[tokio::test]
    async fn freshness_task_counts_stale_sources() {
        let ctx = context();
        crate::engine::testutil::seed_source(&ctx.store, "wire", "firsthand");
        let result = run_task(&ctx, TaskKind::CheckSourceFreshness).await.unwrap();
        assert_eq!(result["sources_checked"], 1);
        assert_eq!(result["stale_count"], 1);
    }
}
