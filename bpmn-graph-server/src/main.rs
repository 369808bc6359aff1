//! Process entry point hosting the engine facade (design §6.1, "C10").
//!
//! The wire protocol a deployment puts in front of `ControlApi` (REST, gRPC,
//! whatever) is an external collaborator and out of scope here (design §1).
//! What this binary owns is standing the engine up the way
//! `bpmn-lite-server/src/main.rs` does — env-driven store selection,
//! `tracing-subscriber` init — and running the one loop the core cannot run
//! for itself: claiming and firing due timers (design §4.3, "C6").

use std::sync::Arc;

use bpmn_graph_core::{ControlApi, EngineConfig, GraphStore, HandlerRegistry, OxigraphStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Arc::new(EngineConfig::from_env());

    let store: Arc<dyn GraphStore> = match std::env::var("BPMN_GRAPH_DB_PATH") {
        Ok(path) => {
            tracing::info!(path = %path, "opening disk-backed graph store");
            Arc::new(OxigraphStore::open_path(&path)?)
        }
        Err(_) => {
            tracing::info!("BPMN_GRAPH_DB_PATH not set, using in-memory graph store");
            Arc::new(OxigraphStore::open_memory()?)
        }
    };

    let api = Arc::new(ControlApi::new(store, HandlerRegistry::new(), config.clone()));

    tracing::info!(
        poll_interval_ms = config.timer_poll_interval_ms,
        "bpmn-graph engine up, running timer sweep"
    );

    run_timer_loop(api, config.timer_poll_interval_ms).await;
    Ok(())
}

/// Poll `run_due_timers` and `run_pending_async_handlers` on a fixed
/// interval until the process is killed, mirroring the lease-claim loop a
/// deployment's worker fleet would run many copies of concurrently (design
/// §4.3's CAS claim makes that safe).
async fn run_timer_loop(api: Arc<ControlApi>, interval_ms: u64) -> ! {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
    loop {
        ticker.tick().await;
        let now = bpmn_graph_core::types::now_ms();
        match api.run_due_timers(now).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(fired = n, "timer sweep resumed due timers"),
            Err(e) => tracing::warn!(error = %e, "timer sweep failed"),
        }
        match api.run_pending_async_handlers(now).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(resumed = n, "async handler sweep resumed pending jobs"),
            Err(e) => tracing::warn!(error = %e, "async handler sweep failed"),
        }
    }
}
