//! Rolegate - authorization caching gateway
//!
//! Sits between application services and an upstream identity provider,
//! answering "what roles does user U have?" from a Redis-backed cache.
//!
//! # Features
//!
//! - **Cache-aside reads**: single-flight coalescing per user, bounded
//!   exponential-backoff retry, circuit breaker around the IdP
//! - **Write-through role management**: create, assign, revoke, delete with
//!   targeted cache invalidation
//! - **Bulk cleanup jobs**: cursor-paged removal of a deleted role from every
//!   cached snapshot, with queryable progress
//! - **Eventual consistency**: bounded by TTL and explicit invalidation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod kv;
pub mod server;
pub mod service;
pub mod singleflight;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
