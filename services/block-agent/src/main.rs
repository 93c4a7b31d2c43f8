//! bgwatch Block Agent
//!
//! Subscribes to the hardware control service's real-time feed and keeps
//! the scheduler's block registry in step with it.
//!
//! ## Architecture
//!
//! - **Real-time service**: Connection task feeding live and deferred block
//!   events to the reconciler
//! - **Kill worker**: Forwards jobs lost with their block to the scheduler

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bgwatch_agent::config::Config;
use bgwatch_agent::{
    kill_job_queue, run_kill_worker, BlockReconciler, BlockRegistry, BlockSpec,
    ConnectionManager, EventListener, RealTimeService, ReconcilerConfig, Scheduler,
    SchedulerClient, TcpEventSource,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        event_server = %config.event_server_addr,
        scheduler_url = %config.scheduler_url,
        inventory = %config.inventory_path.display(),
        "Starting bgwatch block agent"
    );

    // Load the blocks created by the allocation subsystem
    let specs = BlockSpec::load_all(&config.inventory_path)?;
    let registry = Arc::new(BlockRegistry::from_specs(specs).context("invalid block inventory")?);
    {
        let state = registry.lock().await;
        info!(
            blocks = state.len(),
            total_capacity = state.total_capacity(),
            unused_capacity = state.unused_capacity(),
            "Block registry loaded"
        );
    }

    let scheduler: Arc<dyn Scheduler> = Arc::new(SchedulerClient::new(&config)?);

    // Start the kill worker
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (kill_queue, kill_receiver) = kill_job_queue();
    let kill_worker = tokio::spawn(run_kill_worker(
        kill_receiver,
        Arc::clone(&scheduler),
        shutdown_rx,
    ));

    let reconciler = Arc::new(BlockReconciler::new(
        Arc::clone(&registry),
        scheduler,
        kill_queue,
        ReconcilerConfig::new(config.idle_user.clone()),
    ));
    let listener = Arc::new(EventListener::new(reconciler));
    let manager = ConnectionManager::new(
        TcpEventSource::new(config.event_server_addr.clone()),
        listener,
    )
    .with_replay_interval(Duration::from_secs(config.deferred_replay_interval_secs.max(1)));

    // Start the real-time service; failing to start it is fatal
    let service = RealTimeService::new(manager);
    service
        .start()
        .await
        .context("failed to start real-time service")?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    if let Err(e) = service.stop().await {
        error!(error = %e, "Real-time service did not stop cleanly");
    }

    // Signal shutdown to the kill worker and let it flush
    let _ = shutdown_tx.send(true);
    if let Err(e) = kill_worker.await {
        error!(error = %e, "Kill worker task panicked");
    }

    info!("Block agent shutdown complete");
    Ok(())
}
