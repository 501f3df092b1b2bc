// Flush cycle
//
// Drains the committed pending state into the store. Group keys are
// shared across workers and nodes, so every read-merge-write of a
// persisted total runs under a `lock,{key}` set-nx lock. A denied lock
// defers the key to the next pass; every 100th retry the lock is
// inspected and reclaimed if its holder stamped it more than
// `lock_stale_secs` ago. Passes repeat with a 1-100us jittered pause
// until the state drains or the cycle deadline bounds the retries.
//
// Entries leave the pending state only after their store write
// succeeded, so a failed cycle leaves everything for the next one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use metrics::{counter, histogram};
use rand::Rng;
use serde_json::{json, Value};
use tallystream_core::job::ProjectionKind;
use tallystream_core::{Record, Totals};
use tallystream_store::Store;
use tracing::{debug, warn};

use crate::pending::{JobMark, PendingState};
use crate::registry::TaskRegistry;

#[derive(Debug, Clone, Copy)]
pub struct FlushParams {
    pub lock_stale_secs: f64,
    pub cycle_deadline: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlushStats {
    pub keys_flushed: usize,
    pub keys_remaining: usize,
}

pub async fn flush_cycle(
    store: &dyn Store,
    state: &mut PendingState,
    registry: &TaskRegistry,
    params: FlushParams,
) -> Result<FlushStats> {
    let started = Instant::now();
    let mut stats = FlushStats::default();

    if !state.jobs.is_empty() {
        // Distinct values first: idempotent hash writes, no lock
        // needed, and the per-key flush reads their lengths back.
        let dist_keys: Vec<String> = state.dist.keys().cloned().collect();
        for dist_key in dist_keys {
            let entries: Vec<(String, String)> = state.dist[&dist_key]
                .iter()
                .map(|value| (value.clone(), "1".to_string()))
                .collect();
            store.hash_set_multi(&dist_key, &entries).await?;
            state.dist.remove(&dist_key);
        }

        let mut try_num: u64 = 0;
        while !state.jobs.is_empty() {
            let keys: Vec<String> = state.jobs.keys().cloned().collect();
            for key in keys {
                let Some(mark) = state.jobs.get(&key).cloned() else {
                    continue;
                };
                let lock_key = format!("lock,{key}");
                let now_secs = Utc::now().timestamp_micros() as f64 / 1e6;

                if store.set_nx(&lock_key, &format!("{now_secs:.6}")).await? {
                    let flushed = flush_key(store, state, registry, &key, &mark).await;
                    // The lock is released even when the flush failed.
                    store.delete(&[lock_key]).await?;
                    if flushed? {
                        stats.keys_flushed += 1;
                    }
                } else if try_num % 100 == 0 {
                    reclaim_stale_lock(store, &lock_key, now_secs, params.lock_stale_secs).await?;
                }
            }

            if state.jobs.is_empty() {
                break;
            }
            if started.elapsed() >= params.cycle_deadline {
                warn!(
                    remaining = state.jobs.len(),
                    "flush cycle deadline reached with contended keys; deferring"
                );
                break;
            }
            try_num += 1;
            let backoff = rand::thread_rng().gen_range(1..=100);
            tokio::time::sleep(Duration::from_micros(backoff)).await;
        }
    }

    flush_counters(store, state).await?;

    stats.keys_remaining = state.jobs.len();
    counter!("flush.cycles", 1);
    counter!("flush.keys", stats.keys_flushed as u64);
    histogram!("flush.duration_ms", started.elapsed().as_millis() as f64);
    debug!(
        flushed = stats.keys_flushed,
        remaining = stats.keys_remaining,
        "flush cycle finished"
    );
    Ok(stats)
}

async fn reclaim_stale_lock(
    store: &dyn Store,
    lock_key: &str,
    now_secs: f64,
    stale_secs: f64,
) -> Result<()> {
    if let Some(raw) = store.get(lock_key).await? {
        let stamped: f64 = raw.parse().unwrap_or(0.0);
        if now_secs - stamped > stale_secs {
            warn!(%lock_key, age_secs = now_secs - stamped, "reclaiming stale lock");
            store.delete(&[lock_key.to_string()]).await?;
        }
    }
    Ok(())
}

/// Flush one locked group key: merge the total delta into the
/// persisted total, project the output rows and persist them. Returns
/// whether the key was fully flushed and removed from the state.
async fn flush_key(
    store: &dyn Store,
    state: &mut PendingState,
    registry: &TaskRegistry,
    key: &str,
    mark: &JobMark,
) -> Result<bool> {
    let Some(job) = registry.get(&mark.table, &mark.job_id) else {
        // The job vanished since dispatch; nothing left to write this
        // delta into.
        warn!(job_id = %mark.job_id, %key, "pending key for removed job, dropping");
        state.jobs.remove(key);
        state.total.remove(key);
        state.value.remove(key);
        return Ok(true);
    };

    let total_key = format!("total,{key}");
    let mut total: Totals = match store.get(&total_key).await? {
        Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        None => Totals::default(),
    };

    if let Some(delta) = state.total.get(key) {
        total.merge(delta, &job.functions);
        let encoded = serde_json::to_string(&total).context("serialize totals")?;
        store.set(&total_key, &encoded).await?;
        state.total.remove(key);
    }

    let minute = Utc::now().format("%Y%m%d%H%M").to_string();
    let snapshot = state.value.get(key).cloned().unwrap_or_default();
    let mut dist_cache: HashMap<String, u64> = HashMap::new();

    for (out_table, save) in &job.save_as {
        let mut row = Record::new();
        row.insert("_id".to_string(), json!(mark.bucket_id));

        if save.all_field {
            for (field, value) in &snapshot {
                row.entry(field.clone()).or_insert_with(|| value.clone());
            }
        }
        for field in &job.functions.exclude {
            row.remove(field);
        }

        for (as_name, save_field) in &save.field {
            let field = &save_field.field;
            let value = match save_field.kind {
                ProjectionKind::Count => total.count.get(field).map(|v| json!(v)),
                ProjectionKind::Sum => total.sum.get(field).map(|v| json!(v)),
                ProjectionKind::Min => total.min.get(field).map(|v| json!(v)),
                ProjectionKind::Max => total.max.get(field).map(|v| json!(v)),
                ProjectionKind::First => total.first.get(field).map(|tv| tv.value.clone()),
                ProjectionKind::Last => total.last.get(field).map(|tv| tv.value.clone()),
                ProjectionKind::Dist => {
                    let len = match dist_cache.get(field) {
                        Some(len) => *len,
                        None => {
                            let len = store.hash_len(&format!("dist,{key},{field}")).await?;
                            dist_cache.insert(field.clone(), len);
                            len
                        }
                    };
                    Some(json!(len))
                }
                ProjectionKind::Exclude => {
                    row.remove(as_name);
                    continue;
                }
                ProjectionKind::Value => snapshot.get(field).cloned(),
            };
            row.insert(as_name.clone(), value.unwrap_or(Value::Null));
        }

        let save_key = format!("list,{},{},{}", mark.app, out_table, minute);
        let encoded = serde_json::to_string(&json!([mark.time, Value::Object(row)]))
            .context("serialize output row")?;
        store.hash_set(&save_key, &mark.bucket_id, &encoded).await?;
    }

    // A totals write failure above would have bailed before reaching
    // this; the key is only retired once nothing of it remains.
    if !state.total.contains_key(key) {
        state.jobs.remove(key);
        state.value.remove(key);
        return Ok(true);
    }
    Ok(false)
}

/// Push the per-minute dispatch counters into their day-scoped hashes.
async fn flush_counters(store: &dyn Store, state: &mut PendingState) -> Result<()> {
    let job_ids: Vec<String> = state.counter.keys().cloned().collect();
    for job_id in job_ids {
        let slots = state.counter[&job_id].clone();
        let mut all_records: u64 = 0;
        for (minute_key, slot) in slots {
            let Some((day, minute)) = minute_key.split_once(',') else {
                continue;
            };
            store
                .hash_incr_by(
                    &format!("counter.total.{day}.{job_id}"),
                    minute,
                    slot.records as i64,
                )
                .await?;
            store
                .hash_incr_by(
                    &format!("counter.time.{day}.{job_id}"),
                    minute,
                    slot.elapsed_us as i64,
                )
                .await?;
            all_records += slot.records;
        }
        store.hash_incr_by("counter", &job_id, all_records as i64).await?;
        state.counter.remove(&job_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::dispatch_frame;
    use crate::registry::TaskRegistry;
    use serde_json::json;
    use tallystream_core::{Frame, FuncRegistry, TimedRecord, WireFormat};
    use tallystream_store::MemoryStore;

    const T: f64 = 1_709_612_430.0; // 2024-03-05 04:20:30 UTC

    fn params() -> FlushParams {
        FlushParams {
            lock_stale_secs: 10.0,
            cycle_deadline: Duration::from_millis(500),
        }
    }

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.insert_job(
            serde_json::from_value(json!({
                "key": "job1",
                "table": "events",
                "groupTime": {"type": "m", "limit": 1},
                "function": {
                    "sum": ["value"],
                    "count": ["value"],
                    "dist": ["user"],
                    "value": ["region"],
                },
                "saveAs": {
                    "events_by_minute": {
                        "field": {
                            "total": {"type": "sum", "field": "value"},
                            "hits": {"type": "count", "field": "value"},
                            "users": {"type": "dist", "field": "user"},
                            "region": {"type": "value", "field": "region"},
                        }
                    }
                },
            }))
            .unwrap(),
        );
        registry
    }

    fn seeded_state(registry: &TaskRegistry) -> PendingState {
        let mut state = PendingState::default();
        let frame = Frame {
            tag: "app1.events".into(),
            records: vec![
                TimedRecord {
                    time: T,
                    record: json!({"value": 2, "user": "u1", "region": "eu"})
                        .as_object()
                        .unwrap()
                        .clone(),
                },
                TimedRecord {
                    time: T + 1.0,
                    record: json!({"value": 3, "user": "u2", "region": "eu"})
                        .as_object()
                        .unwrap()
                        .clone(),
                },
            ],
            options: Default::default(),
            format: WireFormat::Json,
        };
        dispatch_frame(&frame, registry, &FuncRegistry::new(), &mut state, Utc::now());
        state
    }

    const KEY: &str = "job1,app1,1m_202403050420";

    #[tokio::test]
    async fn flush_persists_and_drains() {
        let store = MemoryStore::new();
        let registry = registry();
        let mut state = seeded_state(&registry);

        let stats = flush_cycle(&store, &mut state, &registry, params())
            .await
            .unwrap();
        assert_eq!(stats.keys_flushed, 1);
        assert_eq!(stats.keys_remaining, 0);
        assert!(state.is_empty());
        assert!(state.counter.is_empty());

        // Persisted running total.
        let total: Totals =
            serde_json::from_str(&store.get(&format!("total,{KEY}")).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(total.sum["value"], 5.0);
        assert_eq!(total.count["value"], 2);

        // Distinct users recorded and the lock released.
        assert_eq!(store.hash_len(&format!("dist,{KEY},user")).await.unwrap(), 2);
        assert!(store.get(&format!("lock,{KEY}")).await.unwrap().is_none());

        // Output row: one list hash for the app/table/minute.
        let lists = store.keys("list,app1,events_by_minute,*").await.unwrap();
        assert_eq!(lists.len(), 1);
        let raw = store
            .hash_get(&lists[0], "1m_202403050420")
            .await
            .unwrap()
            .unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed[0], json!(T));
        assert_eq!(parsed[1]["_id"], json!("1m_202403050420"));
        assert_eq!(parsed[1]["total"], json!(5.0));
        assert_eq!(parsed[1]["hits"], json!(2));
        assert_eq!(parsed[1]["users"], json!(2));
        assert_eq!(parsed[1]["region"], json!("eu"));

        // Counter hashes keyed by day and minute.
        let counters = store.keys("counter.total.*").await.unwrap();
        assert_eq!(counters.len(), 1);
        assert_eq!(
            store.hash_get("counter", "job1").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn second_flush_merges_into_persisted_total() {
        let store = MemoryStore::new();
        let registry = registry();

        let mut state = seeded_state(&registry);
        flush_cycle(&store, &mut state, &registry, params())
            .await
            .unwrap();
        let mut state = seeded_state(&registry);
        flush_cycle(&store, &mut state, &registry, params())
            .await
            .unwrap();

        let total: Totals =
            serde_json::from_str(&store.get(&format!("total,{KEY}")).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(total.sum["value"], 10.0);
        assert_eq!(total.count["value"], 4);
        // Distinct set is idempotent across flushes.
        assert_eq!(store.hash_len(&format!("dist,{KEY},user")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fresh_lock_defers_key() {
        let store = MemoryStore::new();
        let registry = registry();
        let mut state = seeded_state(&registry);

        let now = Utc::now().timestamp_micros() as f64 / 1e6;
        store
            .set(&format!("lock,{KEY}"), &format!("{now:.6}"))
            .await
            .unwrap();

        let stats = flush_cycle(
            &store,
            &mut state,
            &registry,
            FlushParams {
                lock_stale_secs: 10.0,
                cycle_deadline: Duration::from_millis(20),
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.keys_flushed, 0);
        assert_eq!(stats.keys_remaining, 1);
        assert!(state.jobs.contains_key(KEY));
        // A live lock is not stolen.
        assert!(store.get(&format!("lock,{KEY}")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let store = MemoryStore::new();
        let registry = registry();
        let mut state = seeded_state(&registry);

        let stale = Utc::now().timestamp_micros() as f64 / 1e6 - 30.0;
        store
            .set(&format!("lock,{KEY}"), &format!("{stale:.6}"))
            .await
            .unwrap();

        let stats = flush_cycle(&store, &mut state, &registry, params())
            .await
            .unwrap();
        assert_eq!(stats.keys_flushed, 1);
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn store_outage_preserves_pending_state() {
        let store = MemoryStore::new();
        let registry = registry();
        let mut state = seeded_state(&registry);
        let jobs_before = state.jobs.len();

        store.set_offline(true);
        assert!(flush_cycle(&store, &mut state, &registry, params())
            .await
            .is_err());
        assert_eq!(state.jobs.len(), jobs_before);
        assert!(!state.dist.is_empty());

        store.set_offline(false);
        let stats = flush_cycle(&store, &mut state, &registry, params())
            .await
            .unwrap();
        assert_eq!(stats.keys_flushed, 1);
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn vanished_job_key_is_dropped() {
        let store = MemoryStore::new();
        let registry = registry();
        let mut state = seeded_state(&registry);

        let empty = TaskRegistry::new();
        let stats = flush_cycle(&store, &mut state, &empty, params())
            .await
            .unwrap();
        assert_eq!(stats.keys_remaining, 0);
        assert!(state.jobs.is_empty());
        // Nothing was written for the dropped key.
        assert!(store.get(&format!("total,{KEY}")).await.unwrap().is_none());
    }
}
