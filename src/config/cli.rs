use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the postcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "postcache",
    version,
    about = "Generational result cache for list queries"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "POSTCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache against an in-memory host and log every step.
    Simulate(SimulateArgs),
    /// Print the canonical fingerprint of a query.
    Fingerprint(FingerprintArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Number of objects seeded before the first query.
    #[arg(long, default_value_t = 10)]
    pub items: u64,

    /// Rows per page for the simulated list query.
    #[arg(long = "page-size", default_value_t = 2, allow_negative_numbers = true)]
    pub page_size: i64,

    /// Tenant the simulation starts in.
    #[arg(long, default_value_t = 1)]
    pub tenant: u64,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            items: 10,
            page_size: 2,
            tenant: 1,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct FingerprintArgs {
    /// Query text to fingerprint.
    #[arg(value_name = "QUERY")]
    pub query: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Toggle the query cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub cache_enabled: Option<bool>,

    /// Override the in-memory store capacity.
    #[arg(long = "cache-store-capacity", value_name = "COUNT", global = true)]
    pub cache_store_capacity: Option<usize>,
}
