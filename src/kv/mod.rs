//! Key-value store abstraction
//!
//! The cache and job engine speak this narrow surface (GET, SET with
//! optional expiration, DEL, TTL, cursored SCAN, MGET, pipelined writes).
//! [`redis::RedisBackend`] is the production implementation;
//! [`memory::MemoryBackend`] serves single-instance deployments and tests.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

pub use memory::MemoryBackend;
pub use redis::RedisBackend;

/// Remaining lifetime of a key as reported by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist
    Missing,
    /// The key exists and never expires
    NoExpiry,
    /// The key expires after this duration
    Remaining(Duration),
}

/// Minimal key-value backend surface
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Liveness check
    async fn ping(&self) -> Result<()>;

    /// Fetch a value, `None` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value; `ttl` of `None` means no expiration
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key; absence is not an error
    async fn del(&self, key: &str) -> Result<()>;

    /// Remaining lifetime of a key
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// One step of a cursored scan over keys matching `pattern`.
    ///
    /// Returns the next cursor (0 when exhausted) and a batch of keys; a
    /// step may legitimately return an empty batch with a nonzero cursor.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;

    /// Fetch several values in one round trip, position-aligned with `keys`
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Write several entries in one pipelined round trip
    async fn set_batch(&self, entries: &[(String, String, Option<Duration>)]) -> Result<()>;
}

/// Match a key against a glob pattern supporting `*` wildcards.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while t < txt.len() {
        if p < pat.len() && (pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
