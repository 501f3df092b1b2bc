// In-process store backend
//
// Backs tests and single-node deployments. All state lives behind one
// mutex; operations are short and lock-free callers are not a concern
// at this scale. The `offline` flag simulates an unreachable backend
// so reconnection paths can be exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{Result, Store, StoreConnector, StoreError};

#[derive(Debug, Default)]
struct Inner {
    kv: HashMap<String, String>,
    hashes: HashMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

/// Match `*`-wildcard patterns the way a Redis KEYS scan does.
fn glob_match(pattern: &str, key: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if index == 0 {
            match rest.strip_prefix(segment) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if index == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(at) => rest = &rest[at + segment.len()..],
                None => return false,
            }
        }
    }
    // Pattern ends with '*' (or was all wildcards).
    segments.last().map(|s| s.is_empty()).unwrap_or(true)
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.inner.lock().kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.lock().kv.insert(key.into(), value.into());
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.kv.insert(key.into(), value.into());
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        for key in keys {
            inner.kv.remove(key);
            inner.hashes.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let inner = self.inner.lock();
        let mut matched: Vec<String> = inner
            .kv
            .keys()
            .chain(inner.hashes.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        matched.sort();
        matched.dedup();
        Ok(matched)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        let hash = inner.hashes.entry(key.into()).or_default();
        Ok(hash.insert(field.into(), value.into()).is_none())
    }

    async fn hash_set_multi(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        let hash = inner.hashes.entry(key.into()).or_default();
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        if let Some(hash) = inner.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                inner.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn hash_len(&self, key: &str) -> Result<u64> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .map(|hash| hash.len() as u64)
            .unwrap_or(0))
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.check()?;
        let mut inner = self.inner.lock();
        let hash = inner.hashes.entry(key.into()).or_default();
        let current: i64 = hash
            .get(field)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.into(), next.to_string());
        Ok(next)
    }
}

/// Hands out a shared [`MemoryStore`], refusing while marked offline.
#[derive(Debug, Default, Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Store>> {
        self.store.ping().await?;
        Ok(self.store.clone())
    }
}
