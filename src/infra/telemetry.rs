use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "postcache_query_hit_total",
            Unit::Count,
            "Total number of list queries answered from the result cache."
        );
        describe_counter!(
            "postcache_query_miss_total",
            Unit::Count,
            "Total number of cacheable list queries that had to execute."
        );
        describe_counter!(
            "postcache_query_bypass_total",
            Unit::Count,
            "Total number of list queries that skipped the cache entirely."
        );
        describe_counter!(
            "postcache_store_error_total",
            Unit::Count,
            "Total number of shared-store operations that failed and degraded to a miss."
        );
        describe_counter!(
            "postcache_malformed_entry_total",
            Unit::Count,
            "Total number of cache entries that failed to decode."
        );
        describe_counter!(
            "postcache_scope_bump_total",
            Unit::Count,
            "Total number of scope salt bumps."
        );
        describe_counter!(
            "postcache_bump_suppressed_total",
            Unit::Count,
            "Total number of mutation events that advanced no salt."
        );
        describe_counter!(
            "postcache_store_evict_total",
            Unit::Count,
            "Total number of in-memory store evictions due to capacity."
        );
    });
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::*;

    #[test]
    fn second_init_reports_error_instead_of_panicking() {
        let logging = LoggingSettings {
            level: LevelFilter::WARN,
            format: LogFormat::Compact,
        };
        let _ = init(&logging);
        let second = init(&logging);

        assert!(matches!(second, Err(InfraError::Telemetry(_))));
    }
}
