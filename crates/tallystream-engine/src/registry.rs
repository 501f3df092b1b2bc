// Job registry
//
// Job definitions live in the store's `queries` hash as JSON, keyed by
// job id. Every worker holds its own parsed copy, grouped by source
// table for dispatch. Edits made through the admin surface are pushed
// to workers as notifications so they re-fetch only the touched job;
// the periodic reload is the catch-all.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tallystream_core::JobDefinition;
use tallystream_store::Store;
use tracing::{debug, info, warn};

/// Store hash holding the job definitions.
pub const QUERIES_HASH: &str = "queries";

/// Inter-worker registry sync message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskNotification {
    #[serde(rename = "task.update")]
    Update { key: String },
    #[serde(rename = "task.remove")]
    Remove { key: String },
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    /// Table -> job id -> definition.
    tables: HashMap<String, HashMap<String, Arc<JobDefinition>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs_for(&self, table: &str) -> Option<&HashMap<String, Arc<JobDefinition>>> {
        self.tables.get(table)
    }

    pub fn get(&self, table: &str, job_id: &str) -> Option<Arc<JobDefinition>> {
        self.tables.get(table)?.get(job_id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.tables.values().map(|jobs| jobs.len()).sum()
    }

    /// Register a definition directly, bypassing the store. Embedded
    /// setups and tests use this; servers load from `queries`.
    pub fn insert_job(&mut self, def: JobDefinition) {
        self.tables
            .entry(def.table.clone())
            .or_default()
            .insert(def.key.clone(), Arc::new(def));
    }

    /// Re-fetch every definition. A transiently empty or unreadable
    /// hash never wipes a live registry; workers keep serving the last
    /// good set.
    pub async fn reload(&mut self, store: &dyn Store) -> tallystream_store::Result<usize> {
        let entries = store.hash_get_all(QUERIES_HASH).await?;

        let mut fresh = TaskRegistry::new();
        for (job_id, raw) in entries {
            match serde_json::from_str::<JobDefinition>(&raw) {
                Ok(def) if !def.enabled => {
                    info!(job_id = %def.key, table = %def.table, "job disabled, skipping");
                }
                Ok(def) => fresh.insert_job(def),
                Err(err) => {
                    warn!(%job_id, %err, "malformed job definition, skipping");
                }
            }
        }

        let count = fresh.job_count();
        if count > 0 {
            self.tables = fresh.tables;
        } else {
            debug!("no enabled jobs in store; keeping current registry");
        }
        Ok(count)
    }

    /// Fetch one definition and upsert it. A definition that vanished
    /// or turned disabled is dropped instead.
    pub async fn apply_update(
        &mut self,
        store: &dyn Store,
        job_id: &str,
    ) -> tallystream_store::Result<()> {
        match store.hash_get(QUERIES_HASH, job_id).await? {
            Some(raw) => match serde_json::from_str::<JobDefinition>(&raw) {
                Ok(def) if def.enabled => {
                    info!(%job_id, table = %def.table, "job updated");
                    // The table may have changed; drop any old placement.
                    self.apply_remove(job_id);
                    self.insert_job(def);
                }
                Ok(_) => {
                    info!(%job_id, "job disabled, removing");
                    self.apply_remove(job_id);
                }
                Err(err) => {
                    warn!(%job_id, %err, "malformed job definition on update, ignoring");
                }
            },
            None => {
                self.apply_remove(job_id);
            }
        }
        Ok(())
    }

    /// Drop one job everywhere; returns whether it existed. The caller
    /// also purges the job's pending state.
    pub fn apply_remove(&mut self, job_id: &str) -> bool {
        let mut removed = false;
        self.tables.retain(|_, jobs| {
            removed |= jobs.remove(job_id).is_some();
            !jobs.is_empty()
        });
        removed
    }
}
