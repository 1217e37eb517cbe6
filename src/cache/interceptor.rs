//! Query interception.
//!
//! A host query engine drives [`QueryHooks`] in this order for every list
//! query:
//!
//! 1. `before_execute(text)`: `None` means "skip, results will be supplied".
//! 2. the engine runs the query when allowed to.
//! 3. `before_count(text)` and `after_count(count)` when a found count is
//!    tracked; `before_count` returning `None` skips the count query.
//! 4. `after_execute(result)`: may replace the rows wholesale.
//!
//! One [`QueryInterceptor`] exists per query, so its context never leaks into
//! the next one.

use metrics::counter;
use tracing::debug;

use super::catalog::{ContentCatalog, Hydrator};
use super::keys::{CompositeKey, Fingerprint, ObjectId, Scope, TenantId};
use super::manager::CacheManager;
use super::pagination;
use super::store::{CacheEntry, FoundCount};

const METRIC_HIT: &str = "postcache_query_hit_total";
const METRIC_MISS: &str = "postcache_query_miss_total";
const METRIC_BYPASS: &str = "postcache_query_bypass_total";

/// Shape of the rows a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// Bare identifiers; cached hits are replayed without hydration.
    Ids,
    #[default]
    Records,
}

/// What the host knows about a query before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    /// Declared content types; empty when the query did not declare any.
    pub content_types: Vec<String>,
    /// Rows per page; `<= 0` means unlimited.
    pub page_size: i64,
    /// Whether the total match count is wanted.
    pub track_found: bool,
    pub projection: Projection,
}

impl Default for QueryDescriptor {
    fn default() -> Self {
        Self {
            content_types: Vec::new(),
            page_size: 10,
            track_found: true,
            projection: Projection::Records,
        }
    }
}

/// Anything that carries the identifier it was loaded from.
pub trait Identified {
    fn object_id(&self) -> ObjectId;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultRows<R> {
    Ids(Vec<ObjectId>),
    Records(Vec<R>),
}

impl<R: Identified> ResultRows<R> {
    pub fn ids(&self) -> Vec<ObjectId> {
        match self {
            Self::Ids(ids) => ids.clone(),
            Self::Records(records) => records.iter().map(Identified::object_id).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Ids(ids) => ids.len(),
            Self::Records(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The query result object the host hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSet<R> {
    pub rows: ResultRows<R>,
    pub found: FoundCount,
    pub max_pages: Option<u64>,
}

/// Extension points a host query engine calls around each query.
pub trait QueryHooks<R> {
    fn before_execute(&mut self, query_text: String) -> Option<String>;

    fn after_execute(&mut self, result: ResultSet<R>) -> ResultSet<R>;

    fn before_count(&mut self, count_text: String) -> Option<String>;

    fn after_count(&mut self, count: u64) -> u64;
}

/// Lets a caller opt a single query out of caching.
pub trait CachePolicy: Send + Sync {
    fn should_cache(&self, query: &QueryDescriptor) -> bool;
}

impl<F> CachePolicy for F
where
    F: Fn(&QueryDescriptor) -> bool + Send + Sync,
{
    fn should_cache(&self, query: &QueryDescriptor) -> bool {
        self(query)
    }
}

/// Per-query decision so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No lookup happened yet.
    Pending,
    /// Caching was off for this query.
    Bypass,
    Hit,
    Miss,
}

/// Transient state for one query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub tenant: TenantId,
    pub scope: Scope,
    pub fingerprint: Option<Fingerprint>,
    pub key: Option<CompositeKey>,
    pub entry: Option<CacheEntry>,
    pub projection: Projection,
    pub page_size: i64,
    pub track_found: bool,
    pub cacheable: bool,
}

/// Resolve the invalidation scope a query belongs to.
///
/// A single declared, registered content type is its own scope; no
/// declaration, several types, `any` or an unregistered type all fall back
/// to `any`.
pub fn resolve_scope(query: &QueryDescriptor, catalog: &dyn ContentCatalog) -> Scope {
    match query.content_types.as_slice() {
        [single] if single != Scope::ANY && catalog.type_exists(single) => {
            Scope::content_type(single.as_str())
        }
        _ => Scope::any(),
    }
}

/// Drives one query through the cache.
pub struct QueryInterceptor<'a, R> {
    manager: &'a CacheManager,
    hydrator: &'a dyn Hydrator<R>,
    context: QueryContext,
    outcome: Outcome,
}

impl<'a, R: Identified> QueryInterceptor<'a, R> {
    pub(crate) fn new(
        manager: &'a CacheManager,
        hydrator: &'a dyn Hydrator<R>,
        query: &QueryDescriptor,
    ) -> Self {
        let cacheable = manager.config().enabled && manager.policy().should_cache(query);
        let context = QueryContext {
            tenant: manager.tenant(),
            scope: resolve_scope(query, manager.catalog()),
            fingerprint: None,
            key: None,
            entry: None,
            projection: query.projection,
            page_size: query.page_size,
            track_found: query.track_found,
            cacheable,
        };
        Self {
            manager,
            hydrator,
            context,
            outcome: Outcome::Pending,
        }
    }

    pub fn context(&self) -> &QueryContext {
        &self.context
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_hit(&self) -> bool {
        self.outcome == Outcome::Hit
    }

    fn replay(&self, entry: &CacheEntry) -> ResultRows<R> {
        match self.context.projection {
            Projection::Ids => ResultRows::Ids(entry.ids.clone()),
            Projection::Records => ResultRows::Records(self.hydrator.hydrate(&entry.ids)),
        }
    }

    fn populate(&self, result: &ResultSet<R>) {
        let Some(key) = self.context.key.as_ref() else {
            return;
        };
        let found = if self.context.track_found {
            result.found
        } else {
            FoundCount::NotTracked
        };
        let entry = CacheEntry {
            ids: result.rows.ids(),
            found,
        };
        self.manager.results().set(self.context.tenant, key, &entry);
    }
}

impl<R: Identified> QueryHooks<R> for QueryInterceptor<'_, R> {
    fn before_execute(&mut self, query_text: String) -> Option<String> {
        if !self.context.cacheable {
            self.outcome = Outcome::Bypass;
            counter!(METRIC_BYPASS).increment(1);
            return Some(query_text);
        }

        let fingerprint = self.manager.fingerprint(&query_text);
        let token = self.manager.salts().get(&self.context.scope);
        let key = CompositeKey::new(&fingerprint, token);
        // An entry stored without a found count cannot answer a query that
        // paginates; running it again overwrites the entry with a counted one.
        let track_found = self.context.track_found;
        let entry = self
            .manager
            .results()
            .get(self.context.tenant, &key)
            .filter(|entry| !(track_found && entry.found == FoundCount::NotTracked));

        let outcome = if entry.is_some() { "hit" } else { "miss" };
        debug!(
            tenant = %self.context.tenant,
            scope = %self.context.scope,
            token = %token,
            fingerprint = %fingerprint,
            outcome,
            "Query cache lookup"
        );

        self.context.fingerprint = Some(fingerprint);
        self.context.key = Some(key);

        match entry {
            Some(entry) => {
                self.context.entry = Some(entry);
                self.outcome = Outcome::Hit;
                counter!(METRIC_HIT, "scope" => self.context.scope.to_string()).increment(1);
                None
            }
            None => {
                self.outcome = Outcome::Miss;
                counter!(METRIC_MISS, "scope" => self.context.scope.to_string()).increment(1);
                Some(query_text)
            }
        }
    }

    fn after_execute(&mut self, mut result: ResultSet<R>) -> ResultSet<R> {
        match self.outcome {
            Outcome::Hit => {
                if let Some(entry) = self.context.entry.as_ref() {
                    result.rows = self.replay(entry);
                    result.found = entry.found;
                }
            }
            Outcome::Miss => self.populate(&result),
            Outcome::Pending | Outcome::Bypass => {}
        }

        pagination::reconcile(result.found, self.context.page_size, &mut result.max_pages);
        result
    }

    fn before_count(&mut self, count_text: String) -> Option<String> {
        if self.is_hit() { None } else { Some(count_text) }
    }

    fn after_count(&mut self, count: u64) -> u64 {
        if !self.is_hit() {
            return count;
        }
        self.context
            .entry
            .as_ref()
            .and_then(|entry| entry.found.counted())
            .unwrap_or(count)
    }
}
