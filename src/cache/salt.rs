//! Generation-token registry.
//!
//! Every scope owns a token that is appended to cache keys. Advancing a token
//! orphans every entry written under the previous value in O(1); nothing is
//! enumerated or deleted. Tokens are read through to the shared store on every
//! query so a bump issued by another process is observed immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::catalog::ContentCatalog;
use super::keys::{Scope, TenantId, salt_key, tenant_namespace};
use super::lock::{rw_read, rw_write};
use super::store::KeyValueStore;

const SOURCE: &str = "cache::salt";
const METRIC_SCOPE_BUMP: &str = "postcache_scope_bump_total";

/// Strictly-advancing per-scope value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationToken(u64);

impl GenerationToken {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Stored tokens are plain decimal text; anything else is malformed.
    fn parse(raw: &[u8]) -> Option<Self> {
        std::str::from_utf8(raw)
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .map(Self)
    }

    fn encode(self) -> Bytes {
        Bytes::from(self.0.to_string())
    }
}

impl fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues tokens as `max(now_unix_nanos, last_issued + 1, floor + 1)`.
///
/// The clock keeps tokens ahead of anything a restarted process issued
/// earlier; the sequence keeps two issues in the same tick distinct.
#[derive(Debug, Default)]
pub struct TokenSource {
    last: AtomicU64,
}

impl TokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_after(&self, floor: Option<GenerationToken>) -> GenerationToken {
        let now = now_nanos();
        let floor = floor.map_or(0, |token| token.0.saturating_add(1));
        let candidate = |last: u64| now.max(last.saturating_add(1)).max(floor);

        let previous = match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(candidate(last)))
        {
            Ok(previous) | Err(previous) => previous,
        };
        GenerationToken(candidate(previous))
    }
}

fn now_nanos() -> u64 {
    u64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos()).unwrap_or(0)
}

/// Owns the Scope Map for the active tenant.
pub struct SaltRegistry {
    store: Arc<dyn KeyValueStore>,
    catalog: Arc<dyn ContentCatalog>,
    namespace: String,
    tenant: RwLock<TenantId>,
    scopes: DashMap<Scope, GenerationToken>,
    source: TokenSource,
}

impl SaltRegistry {
    /// Create a registry and sync it from the store for `tenant`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn ContentCatalog>,
        namespace: impl Into<String>,
        tenant: TenantId,
    ) -> Self {
        let registry = Self {
            store,
            catalog,
            namespace: namespace.into(),
            tenant: RwLock::new(tenant),
            scopes: DashMap::new(),
            source: TokenSource::new(),
        };
        registry.load();
        registry
    }

    pub fn tenant(&self) -> TenantId {
        *rw_read(&self.tenant, SOURCE, "tenant")
    }

    /// Drop the current Scope Map and load the one belonging to `tenant`.
    pub fn reload(&self, tenant: TenantId) {
        *rw_write(&self.tenant, SOURCE, "reload") = tenant;
        self.scopes.clear();
        self.load();
        info!(tenant = %tenant, scopes = self.scopes.len(), "Scope map reloaded");
    }

    /// Live token for `scope`, creating one when none is stored.
    pub fn get(&self, scope: &Scope) -> GenerationToken {
        let namespace = self.namespace();
        let key = salt_key(scope);

        let stored = match self.store.get(&namespace, &key) {
            Ok(Some(raw)) => GenerationToken::parse(&raw),
            Ok(None) => None,
            Err(err) => {
                warn!(scope = %scope, error = %err, "Salt read failed; scope treated as reset");
                err.record();
                return self.issue(scope, &namespace, false);
            }
        };

        let Some(stored) = stored else {
            debug!(scope = %scope, "No well-formed salt stored; issuing a fresh one");
            return self.issue(scope, &namespace, true);
        };

        {
            let mut known = self.scopes.entry(scope.clone()).or_insert(stored);
            if stored >= *known {
                *known = stored;
                return stored;
            }
        }

        warn!(scope = %scope, stored = %stored, "Stored salt regressed; issuing a fresh one");
        self.issue(scope, &namespace, true)
    }

    /// Advance `scope`.
    ///
    /// A content-type scope is advanced together with `any`, since queries
    /// resolved to `any` may contain objects of that type. Advancing `any`
    /// advances every tracked and known scope. Known content types that are
    /// not tracked yet are synced along the way. Returns the new token of
    /// `scope` itself.
    pub fn bump(&self, scope: &Scope) -> GenerationToken {
        let namespace = self.namespace();
        let mut targets: BTreeSet<Scope> = self
            .catalog
            .content_types()
            .into_iter()
            .map(Scope::content_type)
            .filter(|known| scope.is_any() || !self.scopes.contains_key(known))
            .collect();
        if scope.is_any() {
            targets.extend(self.scopes.iter().map(|entry| entry.key().clone()));
        }
        targets.insert(Scope::any());
        targets.insert(scope.clone());

        let mut bumped = None;
        for target in &targets {
            let token = self.issue(target, &namespace, true);
            if target == scope {
                bumped = Some(token);
            }
        }

        counter!(METRIC_SCOPE_BUMP, "scope" => scope.to_string()).increment(1);
        let token = bumped.unwrap_or_else(|| self.get(scope));
        info!(
            tenant = %self.tenant(),
            scope = %scope,
            token = %token,
            advanced = targets.len(),
            "Scope salt bumped"
        );
        token
    }

    /// Current tokens of every tracked scope.
    pub fn snapshot(&self) -> BTreeMap<Scope, GenerationToken> {
        self.scopes
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn namespace(&self) -> String {
        tenant_namespace(&self.namespace, self.tenant())
    }

    fn load(&self) {
        let namespace = self.namespace();
        let mut scopes: BTreeSet<Scope> = self
            .catalog
            .content_types()
            .into_iter()
            .map(Scope::content_type)
            .collect();
        scopes.insert(Scope::any());
        let scopes: Vec<Scope> = scopes.into_iter().collect();
        let keys: Vec<String> = scopes.iter().map(salt_key).collect();

        let stored = match self.store.get_multiple(&namespace, &keys) {
            Ok(values) => values,
            Err(err) => {
                warn!(error = %err, "Salt sync failed; every scope treated as reset");
                err.record();
                for scope in &scopes {
                    self.issue(scope, &namespace, false);
                }
                return;
            }
        };

        for (scope, raw) in scopes.iter().zip(stored) {
            match raw.as_deref().and_then(GenerationToken::parse) {
                Some(token) => {
                    self.scopes.insert(scope.clone(), token);
                }
                None => {
                    self.issue(scope, &namespace, true);
                }
            }
        }
    }

    /// Issue a token above everything known for `scope` and optionally write
    /// it through.
    ///
    /// The scope's map entry stays locked until the write completes, so two
    /// concurrent issues for one scope reach the store in token order.
    fn issue(&self, scope: &Scope, namespace: &str, persist: bool) -> GenerationToken {
        let key = salt_key(scope);
        let mut entry = self.scopes.entry(scope.clone()).or_insert(GenerationToken(0));

        let mut floor = *entry;
        if persist {
            match self.store.get(namespace, &key) {
                Ok(Some(raw)) => {
                    if let Some(stored) = GenerationToken::parse(&raw) {
                        floor = floor.max(stored);
                    }
                }
                Ok(None) => {}
                Err(err) => err.record(),
            }
        }

        let token = self.source.next_after(Some(floor));
        *entry = token;

        if persist && let Err(err) = self.store.set(namespace, &key, token.encode()) {
            warn!(scope = %scope, error = %err, "Salt write failed; bump is local only");
            err.record();
        }
        token
    }
}
