//! Redis key-value backend
//!
//! Pooled connections via deadpool; millisecond TTL precision (PTTL / SET
//! PX) so cleanup rewrites preserve per-entry freshness faithfully.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};

use super::{KeyTtl, KvBackend};
use crate::{Error, Result};

/// Redis-backed [`KvBackend`]
pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// Create a backend for the given `redis://` URL
    pub fn new(url: &str) -> Result<Self> {
        let pool = PoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Store(format!("redis pool: {e}")))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Store(format!("redis connection: {e}")))
    }
}

fn store_err(e: ::redis::RedisError) -> Error {
    Error::Store(e.to_string())
}

#[allow(clippy::cast_possible_truncation)]
fn ttl_millis(ttl: Duration) -> u64 {
    // SET PX rejects a zero expiry; clamp to the smallest positive value.
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        ::redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<()>(&mut conn).await.map_err(store_err)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        ::redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn().await?;
        let millis: i64 = ::redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::NoExpiry,
            ms => KeyTtl::Remaining(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut conn = self.conn().await?;
        let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok((next, keys))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut cmd = ::redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async(&mut conn).await.map_err(store_err)
    }

    async fn set_batch(&self, entries: &[(String, String, Option<Duration>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = ::redis::pipe();
        for (key, value, ttl) in entries {
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(*ttl));
            }
            cmd.ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(store_err)
    }
}
