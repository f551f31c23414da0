// Horadus runtime: load settings, open the store, start the scheduler and
// worker loops, and drain cleanly on ctrl-c.

use horadus::engine::context::EngineContext;
use horadus::workers::scheduler::spawn_scheduler;
use horadus::{logger, Settings};
use log::{error, info};
use std::sync::atomic::Ordering;

#[tokio::main]
async fn main() {
    // .env first so Settings sees it; missing files are fine.
    dotenvy::dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("horadus: configuration error: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = logger::init(&settings.log_level) {
        eprintln!("horadus: failed to initialize logging: {err}");
        std::process::exit(1);
    }
    if let Err(err) = settings.validate_production() {
        error!("[main] Refusing to start: {err}");
        std::process::exit(1);
    }

    info!(
        "[main] Starting horadus (environment={}, db={:?})",
        settings.environment, settings.database_path
    );
    let context = match EngineContext::from_settings(settings) {
        Ok(context) => context,
        Err(err) => {
            error!("[main] Failed to initialize engine: {err}");
            std::process::exit(1);
        }
    };

    let handles = spawn_scheduler(context.clone());
    info!("[main] Scheduler running with {} task loop(s)", handles.len());

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("[main] Failed to listen for shutdown signal: {err}");
    }
    info!("[main] Shutdown requested, draining task loops");
    context.shutdown.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.abort();
        let _ = handle.await;
    }
    info!("[main] Stopped");
}
