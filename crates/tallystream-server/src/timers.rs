// Periodic timers
//
// Per worker: the flush cycle (staggered across workers), the store
// ping/reconnect loop, a one-minute status registration and a ten
// minute housekeeping pass (task reload, idle-buffer eviction, counter
// retention).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tallystream_config::RuntimeConfig;
use tallystream_engine::Worker;
use tokio::sync::{watch, Mutex};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(600);

pub(crate) fn spawn_all(
    config: &RuntimeConfig,
    workers: &[Arc<Mutex<Worker>>],
    shutdown: watch::Receiver<bool>,
) {
    let worker_count = workers.len();
    for worker in workers {
        spawn_flush(config, worker.clone(), worker_count, shutdown.clone());
        spawn_reconnect(config, worker.clone(), shutdown.clone());
        spawn_status(worker.clone(), shutdown.clone());
        spawn_housekeeping(config, worker.clone(), shutdown.clone());
    }
}

fn spawn_flush(
    config: &RuntimeConfig,
    worker: Arc<Mutex<Worker>>,
    worker_count: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = config.flush.merge_interval();
    let stagger = config.flush.stagger_workers;
    tokio::spawn(async move {
        let offset = worker
            .lock()
            .await
            .flush_stagger(interval, stagger, worker_count);
        tokio::time::sleep(offset).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => worker.lock().await.flush().await,
            }
        }
    });
}

fn spawn_reconnect(
    config: &RuntimeConfig,
    worker: Arc<Mutex<Worker>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.store.reconnect_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => { worker.lock().await.ensure_store().await; }
            }
        }
    });
}

fn spawn_status(worker: Arc<Mutex<Worker>>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    worker.lock().await.report_status(Utc::now().timestamp()).await;
                }
            }
        }
    });
}

fn spawn_housekeeping(
    config: &RuntimeConfig,
    worker: Arc<Mutex<Worker>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let buffer_idle_secs = config.ingest.buffer_idle_secs as i64;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let mut worker = worker.lock().await;
                    worker.reload_tasks().await;
                    worker.housekeeping(Utc::now().timestamp(), buffer_idle_secs).await;
                }
            }
        }
    });
}
