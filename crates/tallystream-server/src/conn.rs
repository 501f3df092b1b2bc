// Connection handling
//
// Each accepted socket gets its own task bound to one worker shard.
// Every read is fed to the decoder whole: a frame completes only when
// the read ends with the terminator (or parses as JSON), so terminator
// bytes inside a binary record payload never cut a frame. The worker
// lock is held from decode through the ack write: the commit decision
// depends on whether the ack reached the socket.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use metrics::counter;
use tallystream_engine::worker::ConnAction;
use tallystream_engine::Worker;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::debug;

pub(crate) async fn accept_loop(
    listener: TcpListener,
    workers: Vec<Arc<Mutex<Worker>>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut next_conn: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                next_conn += 1;
                let conn_id = next_conn;
                counter!("server.connections", 1);
                debug!(%peer, conn = conn_id, "connection accepted");

                let worker = workers[conn_id as usize % workers.len()].clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_conn(socket, conn_id, worker, shutdown).await {
                        debug!(conn = conn_id, %err, "connection ended with error");
                    }
                });
            }
        }
    }
}

async fn serve_conn(
    mut socket: TcpStream,
    conn: u64,
    worker: Arc<Mutex<Worker>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = tokio::select! {
            _ = shutdown.changed() => break,
            read = socket.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }

        let now = Utc::now().timestamp();
        let mut worker = worker.lock().await;
        match worker.handle_chunk(conn, &buf[..n], now) {
            ConnAction::Continue => {}
            ConnAction::Reply(ack) => {
                let ok = socket.write_all(&ack).await.is_ok();
                worker.ack_sent(ok);
                if !ok {
                    break;
                }
            }
            ConnAction::Close => break,
        }
    }

    worker.lock().await.connection_closed(conn);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tallystream_config::{FlushConfig, IngestConfig};
    use tallystream_store::MemoryConnector;

    #[tokio::test]
    async fn ack_round_trips_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(Mutex::new(Worker::new(
            0,
            "node-a".into(),
            Arc::new(MemoryConnector::new()),
            &FlushConfig::default(),
            &IngestConfig::default(),
            dir.path().join("dump.json"),
        )));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, vec![worker.clone()], shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frame =
            serde_json::to_vec(&json!(["app1.events", [[100, {"v": 1}]], {"chunk": "c-9"}]))
                .unwrap();
        client.write_all(&frame).await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let ack: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(ack, json!({"ack": "c-9"}));

        shutdown_tx.send(true).unwrap();
    }

    // Base64-padded payloads contain the terminator byte sequence
    // mid-body; the frame must still decode whole and get its ack.
    #[tokio::test]
    async fn terminator_bytes_inside_payload_are_acked() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(Mutex::new(Worker::new(
            0,
            "node-a".into(),
            Arc::new(MemoryConnector::new()),
            &FlushConfig::default(),
            &IngestConfig::default(),
            dir.path().join("dump.json"),
        )));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, vec![worker.clone()], shutdown_rx));

        let mut frame = rmp_serde::to_vec(&json!([
            "app1.events",
            [[100, {"blob": "QUJD==\n", "v": 1}]],
            {"chunk": "c-3"},
        ]))
        .unwrap();
        frame.extend_from_slice(b"==\n");

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&frame).await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed instead of acking");
        let ack: serde_json::Value = rmp_serde::from_slice(&buf[..n]).unwrap();
        assert_eq!(ack, json!({"ack": "c-3"}));

        shutdown_tx.send(true).unwrap();
    }
}
