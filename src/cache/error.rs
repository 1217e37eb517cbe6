//! Internal fault taxonomy.
//!
//! None of these ever reach a caller of the query hooks or the router: each one
//! is logged, counted, and then degraded to the cost of an uncached execution.

use metrics::counter;
use thiserror::Error;

const METRIC_STORE_ERROR: &str = "postcache_store_error_total";
const METRIC_MALFORMED_ENTRY: &str = "postcache_malformed_entry_total";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("shared store unavailable during `{op}`: {message}")]
    StoreUnavailable { op: &'static str, message: String },
    #[error("malformed cache entry at `{key}`: {reason}")]
    MalformedCacheEntry { key: String, reason: String },
    #[error("no invalidation scope resolvable for {subject}")]
    UnknownScope { subject: String },
}

impl CacheError {
    pub fn store_unavailable(op: &'static str, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            op,
            message: message.into(),
        }
    }

    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedCacheEntry {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_scope(subject: impl Into<String>) -> Self {
        Self::UnknownScope {
            subject: subject.into(),
        }
    }

    /// Bump the counter that tracks this kind of degradation.
    pub(crate) fn record(&self) {
        match self {
            Self::StoreUnavailable { op, .. } => {
                counter!(METRIC_STORE_ERROR, "op" => *op).increment(1);
            }
            Self::MalformedCacheEntry { .. } => counter!(METRIC_MALFORMED_ENTRY).increment(1),
            Self::UnknownScope { .. } => {}
        }
    }
}
