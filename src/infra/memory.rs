//! In-process [`KeyValueStore`] backed by a bounded LRU.
//!
//! Stands in for a shared fast store (memcached-like): values expire only by
//! capacity eviction, and the whole store can be switched offline to exercise
//! the degraded paths.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use tracing::debug;

use crate::cache::lock::{rw_read, rw_write};
use crate::cache::{CacheConfig, CacheError, KeyValueStore};

const SOURCE: &str = "infra::memory";
const METRIC_EVICT: &str = "postcache_store_evict_total";

type StoreKey = (String, String);

pub struct MemoryStore {
    entries: RwLock<LruCache<StoreKey, Bytes>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.store_capacity_non_zero())),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Get the number of stored values across all namespaces.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self, op: &'static str) -> Result<(), CacheError> {
        if self.is_offline() {
            return Err(CacheError::store_unavailable(op, "memory store is offline"));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.ensure_online("get")?;
        let lookup = (namespace.to_string(), key.to_string());
        Ok(rw_write(&self.entries, SOURCE, "get").get(&lookup).cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: Bytes) -> Result<(), CacheError> {
        self.ensure_online("set")?;
        let store_key = (namespace.to_string(), key.to_string());
        let evicted = rw_write(&self.entries, SOURCE, "set")
            .push(store_key.clone(), value)
            .map(|(evicted_key, _)| evicted_key)
            .filter(|evicted_key| *evicted_key != store_key);

        if let Some((namespace, key)) = evicted {
            counter!(METRIC_EVICT).increment(1);
            debug!(namespace = %namespace, key = %key, "Evicted least recently used value");
        }
        Ok(())
    }

    fn get_multiple(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> Result<Vec<Option<Bytes>>, CacheError> {
        self.ensure_online("get_multiple")?;
        let mut entries = rw_write(&self.entries, SOURCE, "get_multiple");
        Ok(keys
            .iter()
            .map(|key| {
                entries
                    .get(&(namespace.to_string(), key.clone()))
                    .cloned()
            })
            .collect())
    }
}
