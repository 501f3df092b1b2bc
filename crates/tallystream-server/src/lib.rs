// Server mode - TCP ingestion server with sharded workers
//
// One TCP accept loop shards connections across N workers. Each worker
// is a tokio Mutex around its own decoder, registry and pending state,
// so a connection's decode-dispatch-ack sequence runs without internal
// locking. Periodic timers per worker drive flushing, store
// reconnection, status registration and housekeeping; a broadcast hub
// fans job-definition changes out to every worker.
//
// Features:
// - fluentd forward wire protocol (JSON and MessagePack)
// - ack-then-commit delivery handshake
// - graceful shutdown with pending-state dump and recovery

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tallystream_config::{RuntimeConfig, StoreBackend};
use tallystream_engine::Worker;
use tallystream_store::{MemoryConnector, StoreConnector};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

mod conn;
mod init;
mod notify;
mod timers;

pub use notify::NotifyHub;

/// Entry point for server mode
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    run_with_hub(config, NotifyHub::new()).await
}

/// Run with an externally held notification hub. The caller keeps a
/// clone and publishes `task.update`/`task.remove` after editing the
/// `queries` hash; every worker applies the change to its registry.
pub async fn run_with_hub(config: RuntimeConfig, hub: NotifyHub) -> Result<()> {
    init::init_tracing(&config);

    info!(
        listen = %config.server.listen_addr,
        workers = config.server.worker_count,
        store = %config.store.backend,
        "starting tallystream"
    );

    let connector: Arc<dyn StoreConnector> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryConnector::new()),
    };

    let workers = build_workers(&config, connector);
    for worker in &workers {
        let mut worker = worker.lock().await;
        if let Err(err) = worker.recover() {
            warn!(worker = worker.id, %err, "pending-state recovery failed");
        }
        worker.ensure_store().await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    notify::spawn_listeners(&hub, &workers, shutdown_rx.clone());
    timers::spawn_all(&config, &workers, shutdown_rx.clone());

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "listening");

    tokio::select! {
        result = conn::accept_loop(listener, workers.clone(), shutdown_rx.clone()) => result?,
        _ = shutdown_signal() => {}
    }

    // Stop timers and connection tasks, then drain each worker.
    shutdown_tx.send(true).ok();
    for worker in &workers {
        worker.lock().await.shutdown().await;
    }
    info!("shutdown complete");
    Ok(())
}

fn build_workers(config: &RuntimeConfig, connector: Arc<dyn StoreConnector>) -> Vec<Arc<Mutex<Worker>>> {
    (0..config.server.worker_count)
        .map(|id| {
            let dump_path = PathBuf::from(format!("{}.{}", config.server.dump_path, id));
            Arc::new(Mutex::new(Worker::new(
                id,
                config.server.server_name.clone(),
                connector.clone(),
                &config.flush,
                &config.ingest,
                dump_path,
            )))
        })
        .collect()
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
