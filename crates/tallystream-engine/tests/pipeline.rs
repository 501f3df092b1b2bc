// End-to-end pipeline tests: wire bytes in, store contents out.

use std::sync::Arc;

use serde_json::{json, Value};
use tallystream_config::{FlushConfig, IngestConfig};
use tallystream_core::Totals;
use tallystream_engine::worker::ConnAction;
use tallystream_engine::Worker;
use tallystream_store::{MemoryConnector, Store};

const T: i64 = 1_709_612_430; // 2024-03-05 04:20:30 UTC
const KEY: &str = "job1,app1,1m_202403050420";

fn worker(id: usize, connector: &MemoryConnector, dir: &tempfile::TempDir) -> Worker {
    let mut worker = Worker::new(
        id,
        "node-a".into(),
        Arc::new(connector.clone()),
        &FlushConfig::default(),
        &IngestConfig::default(),
        dir.path().join(format!("dump.{id}.json")),
    );
    worker.registry_mut().insert_job(
        serde_json::from_value(json!({
            "key": "job1",
            "table": "events",
            "groupTime": {"type": "m", "limit": 1},
            "function": {"sum": ["value"], "count": ["value"], "dist": ["user"]},
            "saveAs": {
                "events_1m": {
                    "field": {
                        "total": {"type": "sum", "field": "value"},
                        "hits": {"type": "count", "field": "value"},
                        "users": {"type": "dist", "field": "user"},
                    }
                }
            },
        }))
        .unwrap(),
    );
    worker
}

fn frame_bytes(value: i64, user: &str) -> Vec<u8> {
    serde_json::to_vec(&json!([
        "app1.events",
        T,
        {"value": value, "user": user},
    ]))
    .unwrap()
}

async fn persisted_totals(store: &dyn Store) -> Totals {
    let raw = store
        .get(&format!("total,{KEY}"))
        .await
        .unwrap()
        .expect("persisted total");
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test]
async fn thousand_records_aggregate_exactly() {
    let connector = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let mut worker = worker(0, &connector, &dir);
    assert!(worker.ensure_store().await);

    for i in 1..=1000i64 {
        let action = worker.handle_chunk(1, &frame_bytes(i, &format!("u{}", i % 10)), T);
        assert!(matches!(action, ConnAction::Continue));
    }
    worker.flush().await;

    let store = connector.store();
    let totals = persisted_totals(store.as_ref()).await;
    assert_eq!(totals.sum["value"], 500_500.0);
    assert_eq!(totals.count["value"], 1000);

    // 10 distinct users.
    assert_eq!(
        store.hash_len(&format!("dist,{KEY},user")).await.unwrap(),
        10
    );

    // One output row for the minute, carrying the projections.
    let lists = store.keys("list,app1,events_1m,*").await.unwrap();
    assert_eq!(lists.len(), 1);
    let raw = store
        .hash_get(&lists[0], "1m_202403050420")
        .await
        .unwrap()
        .unwrap();
    let row: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(row[1]["total"], json!(500_500.0));
    assert_eq!(row[1]["hits"], json!(1000));
    assert_eq!(row[1]["users"], json!(10));

    // Nothing left pending after a clean flush.
    assert!(worker.pending().committed().is_empty());
}

#[tokio::test]
async fn two_workers_converge_on_shared_store() {
    let connector = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let mut alpha = worker(0, &connector, &dir);
    let mut beta = worker(1, &connector, &dir);
    assert!(alpha.ensure_store().await);
    assert!(beta.ensure_store().await);

    for i in 1..=1000i64 {
        let target = if i % 2 == 0 { &mut alpha } else { &mut beta };
        target.handle_chunk(1, &frame_bytes(i, &format!("u{}", i % 10)), T);
    }

    // Interleaved flushes; the per-key lock serializes the merges.
    alpha.flush().await;
    beta.flush().await;
    alpha.flush().await;

    let store = connector.store();
    let totals = persisted_totals(store.as_ref()).await;
    assert_eq!(totals.sum["value"], 500_500.0);
    assert_eq!(totals.count["value"], 1000);
    assert_eq!(
        store.hash_len(&format!("dist,{KEY},user")).await.unwrap(),
        10
    );
    assert!(alpha.pending().committed().is_empty());
    assert!(beta.pending().committed().is_empty());
}

#[tokio::test]
async fn msgpack_frame_round_trips_with_ack() {
    let connector = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let mut worker = worker(0, &connector, &dir);
    assert!(worker.ensure_store().await);

    let mut bytes = rmp_serde::to_vec(&json!([
        "app1.events",
        [[T, {"value": 7, "user": "u1"}]],
        {"chunk": "c-77"},
    ]))
    .unwrap();
    bytes.extend_from_slice(b"==\n");

    let ConnAction::Reply(ack) = worker.handle_chunk(1, &bytes, T) else {
        panic!("expected msgpack ack");
    };
    let decoded: Value = rmp_serde::from_slice(&ack).unwrap();
    assert_eq!(decoded, json!({"ack": "c-77"}));
    worker.ack_sent(true);

    worker.flush().await;
    let totals = persisted_totals(connector.store().as_ref()).await;
    assert_eq!(totals.sum["value"], 7.0);
}

#[tokio::test]
async fn fragmented_delivery_matches_single_write() {
    let connector = MemoryConnector::new();
    let dir = tempfile::tempdir().unwrap();
    let mut worker = worker(0, &connector, &dir);
    assert!(worker.ensure_store().await);

    let mut bytes = rmp_serde::to_vec(&json!([
        "app1.events",
        [[T, {"value": 5, "user": "u1"}]],
        {},
    ]))
    .unwrap();
    bytes.extend_from_slice(b"==\n");

    // A binary frame split mid-body; the second read ends with the
    // terminator and completes it.
    let (head, tail) = bytes.split_at(bytes.len() / 2);
    assert!(matches!(
        worker.handle_chunk(2, head, T),
        ConnAction::Continue
    ));
    worker.handle_chunk(2, tail, T);

    assert_eq!(worker.pending().committed().total[KEY].sum["value"], 5.0);
}
