//! In-process key-value backend
//!
//! Single-instance stand-in for Redis with the same TTL and scan
//! semantics. Expired entries are evicted lazily on access.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{glob_match, KeyTtl, KvBackend};
use crate::Result;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// DashMap-backed [`KvBackend`]
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
}

impl MemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                None
            } else {
                Some(entry.value.clone())
            }
        } else {
            None
        }
    }

    fn insert(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(KeyTtl::Missing);
        };
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return Ok(KeyTtl::Missing);
        }
        Ok(match entry.expires_at {
            None => KeyTtl::NoExpiry,
            Some(at) => KeyTtl::Remaining(at.saturating_duration_since(Instant::now())),
        })
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        // The cursor is an offset into the sorted live-key snapshot; stable
        // enough for the cleanup engine, which only rewrites values.
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired() && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();

        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(keys.len());
        let end = start.saturating_add(count.max(1)).min(keys.len());
        let batch = keys[start..end].to_vec();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, batch))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        Ok(keys.iter().map(|k| self.live_value(k)).collect())
    }

    async fn set_batch(&self, entries: &[(String, String, Option<Duration>)]) -> Result<()> {
        for (key, value, ttl) in entries {
            self.insert(key, value, *ttl);
        }
        Ok(())
    }
}
