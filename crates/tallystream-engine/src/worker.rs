// Worker
//
// One worker owns one frame decoder, one registry copy, one pending
// store and at most one live store handle. The server wraps each
// worker in a tokio Mutex and routes connections to it, so everything
// here is single-threaded per worker and the ack-then-commit sequence
// cannot interleave.
//
// Store failures never crash anything: the handle is dropped, the
// pending state keeps accumulating, and the reconnect timer restores
// the handle later.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tallystream_config::{FlushConfig, IngestConfig};
use tallystream_core::{Decoded, FrameDecoder, FuncRegistry};
use tallystream_store::{Store, StoreConnector};
use tracing::{debug, info, warn};

use crate::dispatch::dispatch_frame;
use crate::flush::{flush_cycle, FlushParams};
use crate::pending::PendingStore;
use crate::registry::{TaskNotification, TaskRegistry};

/// What the connection task should do after feeding bytes in.
#[derive(Debug)]
pub enum ConnAction {
    /// Keep reading.
    Continue,
    /// Write this ack, then report the outcome via `ack_sent`.
    Reply(Vec<u8>),
    /// Close the connection.
    Close,
}

pub struct Worker {
    pub id: usize,
    server_name: String,
    connector: Arc<dyn StoreConnector>,
    store: Option<Arc<dyn Store>>,
    registry: TaskRegistry,
    pending: PendingStore,
    decoder: FrameDecoder,
    funcs: FuncRegistry,
    flush_params: FlushParams,
    flush_at_shutdown: bool,
    counter_retention_days: u32,
    last_counter_purge_day: Option<String>,
    dump_path: PathBuf,
}

impl Worker {
    pub fn new(
        id: usize,
        server_name: String,
        connector: Arc<dyn StoreConnector>,
        flush: &FlushConfig,
        ingest: &IngestConfig,
        dump_path: PathBuf,
    ) -> Self {
        Self {
            id,
            server_name,
            connector,
            store: None,
            registry: TaskRegistry::new(),
            pending: PendingStore::new(),
            decoder: FrameDecoder::with_buffer_limit(ingest.max_buffer_bytes),
            funcs: FuncRegistry::new(),
            flush_params: FlushParams {
                lock_stale_secs: flush.lock_stale_secs as f64,
                cycle_deadline: flush.cycle_deadline(),
            },
            flush_at_shutdown: flush.flush_at_shutdown,
            counter_retention_days: flush.counter_retention_days,
            last_counter_purge_day: None,
            dump_path,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TaskRegistry {
        &mut self.registry
    }

    /// Custom where-filter callbacks, registered before serving.
    pub fn functions_mut(&mut self) -> &mut FuncRegistry {
        &mut self.funcs
    }

    pub fn pending(&self) -> &PendingStore {
        &self.pending
    }

    /// Make sure a live store handle exists; returns whether one does.
    /// A fresh connection also reloads the registry so a worker that
    /// sat through an outage does not serve a stale job set.
    pub async fn ensure_store(&mut self) -> bool {
        if let Some(store) = &self.store {
            if store.ping().await.is_ok() {
                return true;
            }
            warn!(worker = self.id, "store ping failed, dropping handle");
            self.store = None;
        }

        match self.connector.connect().await {
            Ok(store) => {
                info!(worker = self.id, "store connected");
                if let Err(err) = self.registry.reload(store.as_ref()).await {
                    warn!(worker = self.id, %err, "task reload after reconnect failed");
                }
                self.store = Some(store);
                true
            }
            Err(err) => {
                debug!(worker = self.id, %err, "store unavailable");
                false
            }
        }
    }

    /// Feed one read's bytes from a connection through the decoder and
    /// dispatcher. When an ack is due the working delta stays open
    /// until `ack_sent` reports the write outcome.
    pub fn handle_chunk(&mut self, conn: u64, bytes: &[u8], now: i64) -> ConnAction {
        match self.decoder.push(conn, bytes, now) {
            Decoded::Pending => ConnAction::Continue,
            Decoded::Close(reason) => {
                warn!(worker = self.id, %conn, %reason, "closing connection");
                ConnAction::Close
            }
            Decoded::Frame(frame) => {
                let working = self.pending.begin_cycle();
                dispatch_frame(&frame, &self.registry, &self.funcs, working, Utc::now());

                match frame.encode_ack() {
                    Some(ack) => ConnAction::Reply(ack),
                    None => {
                        // No ack requested: nothing to wait for.
                        self.pending.commit();
                        ConnAction::Continue
                    }
                }
            }
        }
    }

    /// Commit or discard the working delta after the ack write. An
    /// unsent ack means the sender will redeliver, so the delta must
    /// not survive.
    pub fn ack_sent(&mut self, ok: bool) {
        if ok {
            self.pending.commit();
        } else {
            self.pending.abort();
        }
    }

    pub fn connection_closed(&mut self, conn: u64) {
        self.decoder.forget(conn);
    }

    /// One flush cycle over the committed state. Any store error drops
    /// the handle; the pending state is preserved either way.
    pub async fn flush(&mut self) {
        if !self.ensure_store().await {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        let state = self.pending.committed_mut();
        if state.is_empty() && state.counter.is_empty() {
            return;
        }
        if let Err(err) = flush_cycle(store.as_ref(), state, &self.registry, self.flush_params).await
        {
            warn!(worker = self.id, %err, "flush failed, dropping store handle");
            self.store = None;
        }
    }

    pub async fn reload_tasks(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        match self.registry.reload(store.as_ref()).await {
            Ok(count) => debug!(worker = self.id, jobs = count, "tasks reloaded"),
            Err(err) => {
                warn!(worker = self.id, %err, "task reload failed, dropping store handle");
                self.store = None;
            }
        }
    }

    pub async fn apply_notification(&mut self, note: &TaskNotification) {
        match note {
            TaskNotification::Update { key } => {
                let Some(store) = self.store.clone() else {
                    // The periodic reload will catch it up.
                    warn!(worker = self.id, %key, "task update with no store, deferring");
                    return;
                };
                if let Err(err) = self.registry.apply_update(store.as_ref(), key).await {
                    warn!(worker = self.id, %key, %err, "task update failed");
                    self.store = None;
                }
            }
            TaskNotification::Remove { key } => {
                let existed = self.registry.apply_remove(key);
                self.pending.committed_mut().purge_job(key);
                info!(worker = self.id, %key, existed, "task removed");
            }
        }
    }

    /// Periodic maintenance: idle-buffer eviction on every worker, plus
    /// the expired-counter purge once per day from worker 0 only (the
    /// key scans are too heavy to run on every tick from every shard).
    pub async fn housekeeping(&mut self, now: i64, buffer_idle_secs: i64) {
        let evicted = self.decoder.evict_idle(now, buffer_idle_secs);
        if evicted > 0 {
            info!(worker = self.id, evicted, "evicted idle connection buffers");
        }

        if self.id != 0 {
            return;
        }
        let Some(now_dt) = Utc.timestamp_opt(now, 0).single() else {
            return;
        };
        let today = now_dt.format("%Y-%m-%d").to_string();
        if self.last_counter_purge_day.as_deref() == Some(today.as_str()) {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        match self.purge_old_counters(store.as_ref(), now_dt).await {
            Ok(()) => self.last_counter_purge_day = Some(today),
            Err(err) => {
                warn!(worker = self.id, %err, "counter purge failed, dropping store handle");
                self.store = None;
            }
        }
    }

    /// Register this worker in the `servers` status hash.
    pub async fn report_status(&mut self, now: i64) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if let Err(err) = self.update_status(store.as_ref(), now).await {
            warn!(worker = self.id, %err, "status update failed, dropping store handle");
            self.store = None;
        }
    }

    async fn update_status(&self, store: &dyn Store, now: i64) -> Result<()> {
        let state = self.pending.committed();
        let status = json!({
            "stats": {
                "worker": self.id,
                "jobs": self.registry.job_count(),
                "pendingKeys": state.jobs.len(),
                "bufferedConnections": self.decoder.buffered_connections(),
            },
            "updateTime": now,
        });
        let field = format!("{}_{}", self.server_name, self.id);
        store.hash_set("servers", &field, &status.to_string()).await?;
        Ok(())
    }

    /// Drop day-scoped counter hashes that aged out of retention. Two
    /// days are checked so a missed day gets caught on the next run.
    async fn purge_old_counters(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<()> {
        for age in [self.counter_retention_days + 1, self.counter_retention_days + 2] {
            let day = (now - chrono::Duration::days(age as i64))
                .format("%Y-%m-%d")
                .to_string();
            for pattern in [
                format!("counter.total.{day}.*"),
                format!("counter.time.{day}.*"),
            ] {
                let keys = store.keys(&pattern).await?;
                if !keys.is_empty() {
                    info!(worker = self.id, count = keys.len(), %day, "purging expired counters");
                    store.delete(&keys).await?;
                }
            }
        }
        Ok(())
    }

    /// Load a crash-recovery dump left by a previous run.
    pub fn recover(&mut self) -> Result<()> {
        if let Some(state) = PendingStore::load_dump(&self.dump_path)? {
            info!(
                worker = self.id,
                keys = state.jobs.len(),
                "recovered pending state from dump"
            );
            self.pending.restore(state);
        }
        Ok(())
    }

    /// Shutdown path: optionally flush, then dump whatever is left.
    pub async fn shutdown(&mut self) {
        if self.flush_at_shutdown {
            self.flush().await;
        }
        match self.pending.dump_to(&self.dump_path) {
            Ok(true) => info!(worker = self.id, path = %self.dump_path.display(), "pending state dumped"),
            Ok(false) => {}
            Err(err) => warn!(worker = self.id, %err, "pending state dump failed"),
        }
    }

    /// Offset this worker's first flush so workers do not hit the
    /// store in lockstep.
    pub fn flush_stagger(&self, interval: Duration, stagger: bool, worker_count: usize) -> Duration {
        if !stagger || worker_count <= 1 {
            return Duration::ZERO;
        }
        interval * (self.id as u32) / (worker_count as u32)
    }
}
