//! Generational result cache for list queries.
//!
//! Query results are cached under a fingerprint of the query text plus the
//! generation token of the query's scope; writes advance tokens instead of
//! deleting entries.

pub mod cache;
pub mod config;
pub mod host;
pub mod infra;
