//! Cache configuration.
//!
//! Controls the query result cache via the `[cache]` section of `postcache.toml`.

use std::num::NonZeroUsize;

use serde::Deserialize;

// Default values for cache configuration
pub(crate) const DEFAULT_RESULT_NAMESPACE: &str = "post_query_cache";
pub(crate) const DEFAULT_SALT_NAMESPACE: &str = "post_query_salts";
pub(crate) const DEFAULT_STORE_CAPACITY: usize = 10_000;

/// Cache configuration from `postcache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. When off every hook passes through and no salt moves.
    pub enabled: bool,
    /// Store namespace prefix for result entries.
    pub result_namespace: String,
    /// Store namespace prefix for generation tokens.
    pub salt_namespace: String,
    /// Backend placeholder-escape strings stripped before fingerprinting.
    pub placeholder_markers: Vec<String>,
    /// Capacity of the in-memory store, in entries.
    pub store_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            result_namespace: DEFAULT_RESULT_NAMESPACE.to_string(),
            salt_namespace: DEFAULT_SALT_NAMESPACE.to_string(),
            placeholder_markers: Vec::new(),
            store_capacity: DEFAULT_STORE_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            result_namespace: settings.result_namespace.clone(),
            salt_namespace: settings.salt_namespace.clone(),
            placeholder_markers: settings.placeholder_markers.clone(),
            store_capacity: settings.store_capacity.get(),
        }
    }
}

impl CacheConfig {
    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn store_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.store_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.result_namespace, "post_query_cache");
        assert_eq!(config.salt_namespace, "post_query_salts");
        assert!(config.placeholder_markers.is_empty());
        assert_eq!(config.store_capacity, 10_000);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            store_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.store_capacity_non_zero().get(), 1);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{ "enabled": false }"#).expect("valid config");
        assert!(!config.enabled);
        assert_eq!(config.store_capacity, DEFAULT_STORE_CAPACITY);
    }
}
