// tallystream-store - Key-value store abstraction
//
// The aggregation engine persists totals, distinct-value hashes,
// output rows and job definitions through this trait. The shape
// mirrors a Redis-style server: flat string keys with values, hash
// keys with field maps, setnx for locking and glob-pattern key
// listing for purges.
//
// Implementations:
// - MemoryStore (in-process; tests and single-node deployments)

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

pub use memory::{MemoryConnector, MemoryStore};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend is unreachable; the worker holds its state and
    /// retries the connection.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Redis-style key-value operations used by the aggregation engine.
///
/// All values are strings; callers serialize structured data
/// themselves. Hash operations address a map stored under one key.
#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness probe. A failing ping triggers reconnection.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set only when absent; returns whether the key was written.
    /// This is the locking primitive.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool>;

    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// List keys matching a glob pattern (`*` wildcard only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    async fn hash_set_multi(&self, key: &str, entries: &[(String, String)]) -> Result<()>;

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()>;

    async fn hash_len(&self, key: &str) -> Result<u64>;

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
}

/// Produces store connections. The engine treats every store error as
/// a dead connection, drops the handle and asks the connector for a
/// fresh one on the next cycle.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<std::sync::Arc<dyn Store>>;
}
