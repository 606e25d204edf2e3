//! Command-line interface definitions for `rolegate`.

use clap::Parser;

/// Authorization caching gateway in front of a Zitadel-shaped IdP
///
/// Answers "what roles does this user have?" from a Redis-backed cache,
/// falling back to the identity provider behind a retrying, circuit-broken
/// client, and acts as a write-through facade for role management.
#[derive(Parser, Debug)]
#[command(name = "rolegate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Port to listen on (overrides the PORT environment variable)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Minimum log level: trace, debug, info, warn, or error
    #[arg(long, default_value = "info", env = "ROLEGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format: "text" for human-readable, "json" for structured
    #[arg(long, env = "ROLEGATE_LOG_FORMAT")]
    pub log_format: Option<String>,
}
