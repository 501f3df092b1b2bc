// Pending delta state
//
// Everything accumulated since the last successful flush, keyed by
// group key. The dispatcher writes into a working copy cloned from the
// committed state at the start of each frame; the copy is promoted
// only after the frame's ack went out, so a failed ack leaves the
// committed state untouched and the sender retries.
//
// The state is serde round-trippable: on shutdown a non-empty
// committed state is dumped to a JSON file and reloaded (then removed)
// on the next start.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tallystream_core::{Record, Totals};

/// Which job produced a pending group key, and the frame context
/// needed to flush it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMark {
    pub bucket_id: String,
    pub time: f64,
    pub app: String,
    pub table: String,
    pub job_id: String,
}

/// One job's per-minute dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSlot {
    pub records: u64,
    pub elapsed_us: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingState {
    /// Group key -> mark. A key present in any other map is present here.
    #[serde(default)]
    pub jobs: HashMap<String, JobMark>,
    /// Group key -> unmerged aggregate delta.
    #[serde(default)]
    pub total: HashMap<String, Totals>,
    /// Group key -> latest raw-field snapshot.
    #[serde(default)]
    pub value: HashMap<String, Record>,
    /// `dist,{group key},{field}` -> distinct values seen.
    #[serde(default)]
    pub dist: HashMap<String, BTreeSet<String>>,
    /// Job id -> minute key (`Y-m-d,H:M`) -> counters.
    #[serde(default)]
    pub counter: HashMap<String, BTreeMap<String, CounterSlot>>,
}

impl PendingState {
    /// Whether there is anything worth flushing or dumping. Counters
    /// alone do not count; they are telemetry, not data.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.total.is_empty() && self.value.is_empty() && self.dist.is_empty()
    }

    /// Drop every trace of a removed job: its group keys, their
    /// aggregates and snapshots, its dist sets and counters.
    pub fn purge_job(&mut self, job_id: &str) {
        let removed: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, mark)| mark.job_id == job_id)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &removed {
            self.jobs.remove(key);
            self.total.remove(key);
            self.value.remove(key);
            let dist_prefix = format!("dist,{key},");
            self.dist.retain(|dist_key, _| !dist_key.starts_with(&dist_prefix));
        }
        self.counter.remove(job_id);
    }
}

/// Double-buffered pending state.
///
/// `begin_cycle` clones the committed state; the dispatcher mutates the
/// clone. `commit` promotes it, `abort` discards it. At most one frame
/// is in flight per worker, so a plain Option suffices.
#[derive(Debug, Default)]
pub struct PendingStore {
    committed: PendingState,
    working: Option<PendingState>,
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_cycle(&mut self) -> &mut PendingState {
        self.working = Some(self.committed.clone());
        self.working.as_mut().unwrap()
    }

    pub fn commit(&mut self) {
        if let Some(working) = self.working.take() {
            self.committed = working;
        }
    }

    pub fn abort(&mut self) {
        self.working = None;
    }

    pub fn committed(&self) -> &PendingState {
        &self.committed
    }

    pub fn committed_mut(&mut self) -> &mut PendingState {
        &mut self.committed
    }

    /// Replace the committed state wholesale (crash-recovery load).
    pub fn restore(&mut self, state: PendingState) {
        self.committed = state;
    }

    /// Write the committed state to `path` if non-empty. Returns
    /// whether a dump was written.
    pub fn dump_to(&self, path: &Path) -> Result<bool> {
        if self.committed.is_empty() {
            return Ok(false);
        }
        let data = serde_json::to_vec(&self.committed).context("serialize pending state")?;
        std::fs::write(path, data)
            .with_context(|| format!("write pending dump: {}", path.display()))?;
        Ok(true)
    }

    /// Load and delete a previous dump, merging nothing: the loaded
    /// state becomes the committed state. Missing file is not an error.
    pub fn load_dump(path: &Path) -> Result<Option<PendingState>> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read pending dump: {}", path.display()))
            }
        };
        let state: PendingState =
            serde_json::from_slice(&data).context("parse pending dump")?;
        std::fs::remove_file(path)
            .with_context(|| format!("remove pending dump: {}", path.display()))?;
        Ok(Some(state))
    }
}
