//! Result cache storage.
//!
//! [`KeyValueStore`] is the contract of the shared fast store; [`ResultCache`]
//! is the thin typed layer that keeps `{ids, found_count}` entries in it.
//! Entries are never deleted from here: a scope bump makes them unreachable and
//! the store's own capacity eviction reclaims them.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::CacheError;
use super::keys::{CompositeKey, ObjectId, TenantId, tenant_namespace};

const SOURCE: &str = "cache::store";

/// Shared key-value store used for both result entries and generation tokens.
///
/// Implementations must be safe to call from many threads at once. There is
/// deliberately no delete.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>, CacheError>;

    fn set(&self, namespace: &str, key: &str, value: Bytes) -> Result<(), CacheError>;

    /// Fetch several keys at once, preserving order.
    fn get_multiple(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> Result<Vec<Option<Bytes>>, CacheError> {
        keys.iter().map(|key| self.get(namespace, key)).collect()
    }
}

/// Total number of matches, or the marker that the query asked for no count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoundCount {
    Counted(u64),
    NotTracked,
}

impl FoundCount {
    pub fn counted(self) -> Option<u64> {
        match self {
            Self::Counted(count) => Some(count),
            Self::NotTracked => None,
        }
    }
}

/// A cached query outcome: ordered identifiers plus the found count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub ids: Vec<ObjectId>,
    pub found: FoundCount,
}

impl CacheEntry {
    fn decode(key: &CompositeKey, raw: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(raw).map_err(|err| CacheError::malformed(key.as_str(), err.to_string()))
    }

    fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Typed get/set of [`CacheEntry`] values in a tenant's result namespace.
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Look up an entry. Store failures and undecodable values are misses.
    pub fn get(&self, tenant: TenantId, key: &CompositeKey) -> Option<CacheEntry> {
        let namespace = tenant_namespace(&self.namespace, tenant);
        let raw = match self.store.get(&namespace, key.as_str()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(source = SOURCE, error = %err, key = %key, "Result lookup degraded to miss");
                err.record();
                return None;
            }
        };

        match CacheEntry::decode(key, &raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(source = SOURCE, error = %err, "Discarding malformed result entry");
                err.record();
                None
            }
        }
    }

    /// Fetch several entries in one round trip, in key order.
    pub fn get_many(&self, tenant: TenantId, keys: &[CompositeKey]) -> Vec<Option<CacheEntry>> {
        let namespace = tenant_namespace(&self.namespace, tenant);
        let raw_keys: Vec<String> = keys.iter().map(|key| key.as_str().to_string()).collect();

        match self.store.get_multiple(&namespace, &raw_keys) {
            Ok(values) => keys
                .iter()
                .zip(values)
                .map(|(key, raw)| {
                    CacheEntry::decode(key, &raw?)
                        .inspect_err(|err| {
                            warn!(source = SOURCE, error = %err, "Discarding malformed result entry");
                            err.record();
                        })
                        .ok()
                })
                .collect(),
            Err(err) => {
                warn!(source = SOURCE, error = %err, count = keys.len(), "Bulk lookup degraded to misses");
                err.record();
                vec![None; keys.len()]
            }
        }
    }

    /// Store an entry. Failure is logged and otherwise ignored.
    pub fn set(&self, tenant: TenantId, key: &CompositeKey, entry: &CacheEntry) {
        let namespace = tenant_namespace(&self.namespace, tenant);
        let payload = match entry.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(source = SOURCE, error = %err, key = %key, "Failed to encode result entry");
                return;
            }
        };

        match self.store.set(&namespace, key.as_str(), payload) {
            Ok(()) => debug!(source = SOURCE, key = %key, ids = entry.ids.len(), "Result entry stored"),
            Err(err) => {
                warn!(source = SOURCE, error = %err, key = %key, "Result entry not stored");
                err.record();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::cache::keys::Fingerprinter;
    use crate::cache::salt::GenerationToken;

    #[derive(Default)]
    struct MapStore {
        values: Mutex<HashMap<(String, String), Bytes>>,
        offline: bool,
    }

    impl KeyValueStore for MapStore {
        fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>, CacheError> {
            if self.offline {
                return Err(CacheError::store_unavailable("get", "offline"));
            }
            let values = self.values.lock().expect("map lock");
            Ok(values.get(&(namespace.to_string(), key.to_string())).cloned())
        }

        fn set(&self, namespace: &str, key: &str, value: Bytes) -> Result<(), CacheError> {
            if self.offline {
                return Err(CacheError::store_unavailable("set", "offline"));
            }
            self.values
                .lock()
                .expect("map lock")
                .insert((namespace.to_string(), key.to_string()), value);
            Ok(())
        }
    }

    fn key(token: u64) -> CompositeKey {
        let fp = Fingerprinter::default().fingerprint("SELECT id FROM objects");
        CompositeKey::new(&fp, GenerationToken::new(token))
    }

    #[test]
    fn entry_roundtrip_preserves_order_and_count() {
        let cache = ResultCache::new(Arc::new(MapStore::default()), "results");
        let entry = CacheEntry {
            ids: vec![9, 3, 7],
            found: FoundCount::Counted(12),
        };

        assert!(cache.get(TenantId(1), &key(1)).is_none());
        cache.set(TenantId(1), &key(1), &entry);
        assert_eq!(cache.get(TenantId(1), &key(1)), Some(entry));
    }

    #[test]
    fn not_tracked_count_survives_storage() {
        let cache = ResultCache::new(Arc::new(MapStore::default()), "results");
        let entry = CacheEntry {
            ids: vec![1],
            found: FoundCount::NotTracked,
        };
        cache.set(TenantId(1), &key(5), &entry);
        let cached = cache.get(TenantId(1), &key(5)).expect("cached entry");
        assert_eq!(cached.found.counted(), None);
    }

    #[test]
    fn tenants_do_not_share_entries() {
        let cache = ResultCache::new(Arc::new(MapStore::default()), "results");
        let entry = CacheEntry {
            ids: vec![1, 2],
            found: FoundCount::Counted(2),
        };
        cache.set(TenantId(1), &key(1), &entry);
        assert!(cache.get(TenantId(2), &key(1)).is_none());
    }

    #[test]
    fn malformed_value_is_a_miss() {
        let store = Arc::new(MapStore::default());
        store
            .set("results:1", key(1).as_str(), Bytes::from_static(b"[1,2,3]"))
            .expect("set");
        let cache = ResultCache::new(store, "results");
        assert!(cache.get(TenantId(1), &key(1)).is_none());
    }

    #[test]
    fn offline_store_is_a_miss_and_set_is_silent() {
        let store = Arc::new(MapStore {
            offline: true,
            ..Default::default()
        });
        let cache = ResultCache::new(store, "results");
        let entry = CacheEntry {
            ids: vec![1],
            found: FoundCount::Counted(1),
        };
        cache.set(TenantId(1), &key(1), &entry);
        assert!(cache.get(TenantId(1), &key(1)).is_none());
        assert_eq!(cache.get_many(TenantId(1), &[key(1), key(2)]), vec![None, None]);
    }

    #[test]
    fn get_many_keeps_key_order() {
        let cache = ResultCache::new(Arc::new(MapStore::default()), "results");
        let entry = CacheEntry {
            ids: vec![4],
            found: FoundCount::Counted(1),
        };
        cache.set(TenantId(3), &key(2), &entry);

        let found = cache.get_many(TenantId(3), &[key(1), key(2)]);
        assert_eq!(found, vec![None, Some(entry)]);
    }
}
