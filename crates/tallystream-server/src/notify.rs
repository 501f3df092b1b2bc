// Inter-worker notification hub
//
// Job definitions change rarely but must reach every worker quickly;
// the periodic reload alone would leave minutes of skew. Whoever edits
// the `queries` hash publishes a task.update/task.remove message here
// and every worker applies it against its own registry copy.

use std::sync::Arc;

use tallystream_engine::{TaskNotification, Worker};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::warn;

#[derive(Clone)]
pub struct NotifyHub {
    tx: broadcast::Sender<TaskNotification>,
}

impl NotifyHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Fan a registry change out to all workers. Returns how many
    /// listeners received it.
    pub fn publish(&self, note: TaskNotification) -> usize {
        self.tx.send(note).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.tx.subscribe()
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn spawn_listeners(
    hub: &NotifyHub,
    workers: &[Arc<Mutex<Worker>>],
    shutdown: watch::Receiver<bool>,
) {
    for worker in workers {
        let worker = worker.clone();
        let mut rx = hub.subscribe();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    received = rx.recv() => match received {
                        Ok(note) => worker.lock().await.apply_notification(&note).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Dropped notifications are healed by the
                            // periodic full reload.
                            warn!(missed, "notification listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tallystream_config::{FlushConfig, IngestConfig};
    use tallystream_store::{MemoryConnector, Store};

    async fn wait_until(mut ready: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if ready() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn published_notifications_reach_worker_registries() {
        let connector = MemoryConnector::new();
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(Mutex::new(Worker::new(
            0,
            "node-a".into(),
            Arc::new(connector.clone()),
            &FlushConfig::default(),
            &IngestConfig::default(),
            dir.path().join("dump.json"),
        )));
        assert!(worker.lock().await.ensure_store().await);

        let hub = NotifyHub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_listeners(&hub, std::slice::from_ref(&worker), shutdown_rx);

        // An update lands the freshly stored definition in the registry.
        connector
            .store()
            .hash_set(
                "queries",
                "job1",
                &json!({
                    "key": "job1",
                    "table": "events",
                    "groupTime": {"type": "m", "limit": 1},
                })
                .to_string(),
            )
            .await
            .unwrap();
        assert_eq!(hub.publish(TaskNotification::Update { key: "job1".into() }), 1);

        let added = {
            let worker = worker.clone();
            wait_until(move || {
                worker
                    .try_lock()
                    .map(|w| w.registry().get("events", "job1").is_some())
                    .unwrap_or(false)
            })
            .await
        };
        assert!(added, "task.update never reached the registry");

        // A remove drops it again.
        hub.publish(TaskNotification::Remove { key: "job1".into() });
        let removed = {
            let worker = worker.clone();
            wait_until(move || {
                worker
                    .try_lock()
                    .map(|w| w.registry().get("events", "job1").is_none())
                    .unwrap_or(false)
            })
            .await
        };
        assert!(removed, "task.remove never reached the registry");

        shutdown_tx.send(true).unwrap();
    }
}
