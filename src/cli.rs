use clap::{Parser, Subcommand, ValueEnum};

/// Operator tool for the query result cache.
#[derive(Parser, Debug)]
#[command(name = "qtt-cache", version, about)]
pub struct Args {
    /// Log output format
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show connection and policy details
    Info,
    /// Show hit/miss/coalescing statistics
    Stats,
    /// Probe the store
    Ping,
    /// Derive the cache key for a query
    Key(KeyArgs),
    /// Read a cached value
    Get { key: String },
    /// Store a value
    Put {
        key: String,
        value: String,
        /// TTL in seconds; the configured default when omitted
        #[arg(long)]
        ttl: Option<u32>,
    },
    /// Delete one key
    Delete { key: String },
    /// Delete every cached result of a route
    Invalidate { route: String },
    /// Count keys matching a glob pattern
    Count { pattern: String },
    /// Delete every key under the configured prefix
    Clear,
}

#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct KeyArgs {
    pub route: String,
    pub query: String,
    #[arg(long)]
    pub graph: Option<String>,
    #[arg(long)]
    pub layers: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingFormat {
    Pretty,
    Json,
}

/// Pretty in debug builds, JSON in release builds.
fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}
