// Horadus — Scheduler
//
// Periodic triggers: each task runs on its own tokio interval, offset by a
// small random start delay so a fleet of workers does not fire in
// lockstep. Loops are cooperative: they poll the shared shutdown flag on
// every tick and exit cleanly.

use crate::engine::context::EngineContext;
use crate::workers::tasks::{run_task_with_retry, TaskKind};
use log::info;
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct ScheduleEntry {
    kind: TaskKind,
    every: Duration,
}

fn build_schedule(ctx: &EngineContext) -> Vec<ScheduleEntry> {
    let minutes = |m: u64| Duration::from_secs(m.max(1) * 60);
    vec![
        ScheduleEntry {
            kind: TaskKind::ProcessPendingItems,
            every: minutes(ctx.settings.process_pending_interval_minutes),
        },
        ScheduleEntry {
            kind: TaskKind::EmbedMissingVectors,
            every: minutes(ctx.settings.process_pending_interval_minutes),
        },
        ScheduleEntry {
            kind: TaskKind::SnapshotTrends,
            every: minutes(ctx.settings.trend_snapshot_interval_minutes),
        },
        ScheduleEntry {
            kind: TaskKind::ApplyTrendDecay,
            every: Duration::from_secs(24 * 60 * 60),
        },
        ScheduleEntry {
            kind: TaskKind::CheckEventLifecycles,
            every: Duration::from_secs(60 * 60),
        },
        ScheduleEntry {
            kind: TaskKind::ReapStaleProcessingItems,
            every: minutes(ctx.settings.processing_reaper_interval_minutes),
        },
        ScheduleEntry {
            kind: TaskKind::CheckSourceFreshness,
            every: minutes(ctx.settings.source_freshness_check_interval_minutes),
        },
        ScheduleEntry {
            kind: TaskKind::CheckCalibrationDrift,
            every: Duration::from_secs(6 * 60 * 60),
        },
        ScheduleEntry {
            kind: TaskKind::PruneSemanticCache,
            every: Duration::from_secs(15 * 60),
        },
        ScheduleEntry {
            kind: TaskKind::Heartbeat,
            every: Duration::from_secs(30),
        },
    ]
}

/// Spawn one loop per scheduled task. The returned handles complete after
/// the shutdown flag is set.
pub fn spawn_scheduler(ctx: Arc<EngineContext>) -> Vec<JoinHandle<()>> {
    build_schedule(&ctx)
        .into_iter()
        .map(|entry| {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                // Staggered start: up to 10% of the interval.
                let stagger_ms = {
                    let max = (entry.every.as_millis() / 10).max(1) as u64;
                    rand::thread_rng().gen_range(0..max)
                };
                tokio::time::sleep(Duration::from_millis(stagger_ms)).await;

                info!(
                    "[scheduler] {} every {:.0}s",
                    entry.kind.name(),
                    entry.every.as_secs_f64()
                );
                let mut ticker = tokio::time::interval(entry.every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if ctx.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    run_task_with_retry(&ctx, entry.kind).await;
                    if ctx.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
                info!("[scheduler] {} stopped", entry.kind.name());
            })
        })
        .collect()
}
