//! Cache wiring.
//!
//! [`CacheManager`] owns the salt registry, the result cache and the
//! invalidation router for one process, and hands out a fresh
//! [`QueryInterceptor`] per query.

use std::sync::Arc;

use tracing::info;

use super::catalog::{ContentCatalog, Hydrator};
use super::config::CacheConfig;
use super::interceptor::{CachePolicy, Identified, QueryDescriptor, QueryInterceptor};
use super::keys::{Fingerprint, Fingerprinter, TenantId};
use super::salt::SaltRegistry;
use super::store::{KeyValueStore, ResultCache};
use super::trigger::InvalidationRouter;

pub struct CacheManager {
    config: CacheConfig,
    fingerprinter: Fingerprinter,
    salts: Arc<SaltRegistry>,
    results: ResultCache,
    router: InvalidationRouter,
    catalog: Arc<dyn ContentCatalog>,
    policy: Arc<dyn CachePolicy>,
}

impl CacheManager {
    /// Wire the cache against `store` for the given starting tenant.
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn ContentCatalog>,
        tenant: TenantId,
    ) -> Self {
        let salts = Arc::new(SaltRegistry::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            config.salt_namespace.clone(),
            tenant,
        ));
        let results = ResultCache::new(store, config.result_namespace.clone());
        let router = InvalidationRouter::new(config.clone(), Arc::clone(&salts), Arc::clone(&catalog));

        info!(
            tenant = %tenant,
            enabled = config.enabled,
            scopes = salts.snapshot().len(),
            "Query cache initialised"
        );

        Self {
            fingerprinter: Fingerprinter::new(config.placeholder_markers.clone()),
            config,
            salts,
            results,
            router,
            catalog,
            policy: Arc::new(|_: &QueryDescriptor| true),
        }
    }

    /// Replace the per-query caching policy.
    pub fn with_policy(mut self, policy: impl CachePolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Start intercepting one query. Records are rebuilt through `hydrator`
    /// on hits.
    pub fn begin_query<'a, R: Identified>(
        &'a self,
        query: &QueryDescriptor,
        hydrator: &'a dyn Hydrator<R>,
    ) -> QueryInterceptor<'a, R> {
        QueryInterceptor::new(self, hydrator, query)
    }

    /// The active tenant changed.
    pub fn tenant_switched(&self, new: TenantId, previous: Option<TenantId>) {
        self.router.tenant_switched(new, previous);
    }

    pub fn fingerprint(&self, query_text: &str) -> Fingerprint {
        self.fingerprinter.fingerprint(query_text)
    }

    pub fn tenant(&self) -> TenantId {
        self.salts.tenant()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn router(&self) -> &InvalidationRouter {
        &self.router
    }

    pub fn salts(&self) -> &SaltRegistry {
        &self.salts
    }

    pub fn results(&self) -> &ResultCache {
        &self.results
    }

    pub fn catalog(&self) -> &dyn ContentCatalog {
        self.catalog.as_ref()
    }

    pub(crate) fn policy(&self) -> &dyn CachePolicy {
        self.policy.as_ref()
    }
}
