//! Query result cache
//!
//! Caches the identifier list and found count of list queries, keyed by a
//! fingerprint of the query text plus a per-scope generation token:
//!
//! - **Salts**: one token per scope (`any` plus one per content type), kept
//!   in a shared store so every process sees every bump
//! - **Results**: entries live under `"{fingerprint}.{token}"`; advancing a
//!   token orphans every entry built on the old one, nothing is deleted
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `postcache.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! result_namespace = "post_query_cache"
//! salt_namespace = "post_query_salts"
//! # ... see config.rs for all options
//! ```

mod catalog;
mod config;
mod error;
mod events;
mod interceptor;
mod keys;
pub(crate) mod lock;
mod manager;
mod pagination;
mod planner;
mod salt;
mod store;
mod trigger;

pub use catalog::{ContentCatalog, Hydrator, ObjectInfo};
pub use config::CacheConfig;
pub use error::CacheError;
pub use events::{EventKind, MutationEvent, WriteOrigin};
pub use interceptor::{
    CachePolicy, Identified, Outcome, Projection, QueryContext, QueryDescriptor, QueryHooks,
    QueryInterceptor, ResultRows, ResultSet, resolve_scope,
};
pub use keys::{CompositeKey, Fingerprint, Fingerprinter, ObjectId, Scope, TenantId};
pub use manager::CacheManager;
pub use pagination::{max_pages, reconcile};
pub use planner::{InvalidationPlan, SkipReason};
pub use salt::{GenerationToken, SaltRegistry, TokenSource};
pub use store::{CacheEntry, FoundCount, KeyValueStore, ResultCache};
pub use trigger::{InvalidationRouter, SuppressionGuard};
