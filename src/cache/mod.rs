//! Per-user role snapshot cache
//!
//! Snapshots live under `roles:<user_id>`, cleanup job records under
//! `job:roles_cleanup:<job_id>`; both are JSON. Entries are overwritten
//! wholesale (last writer wins) and evicted by TTL or explicit
//! invalidation.

pub mod job;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kv::KvBackend;
use crate::{Error, Result};

pub use job::{CleanupJob, JobStatus};

/// Snapshot format marker written into every cached entry
pub const SNAPSHOT_VERSION: &str = "v1";

/// Cached point-in-time view of one user's roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSnapshot {
    /// Role keys as returned by the upstream
    pub roles: Vec<String>,
    /// When the snapshot was fetched
    pub fetched_at: DateTime<Utc>,
    /// Format marker, currently `"v1"`
    #[serde(default)]
    pub version: String,
}

impl RoleSnapshot {
    fn new(roles: Vec<String>) -> Self {
        Self {
            roles,
            fetched_at: Utc::now(),
            version: SNAPSHOT_VERSION.to_string(),
        }
    }
}

pub(crate) fn roles_key(user_id: &str) -> String {
    format!("roles:{user_id}")
}

pub(crate) fn job_key(job_id: &str) -> String {
    format!("job:roles_cleanup:{job_id}")
}

/// Role snapshot cache plus the cleanup job engine over a shared KV store
#[derive(Clone)]
pub struct RoleCache {
    kv: Arc<dyn KvBackend>,
    default_ttl: Duration,
}

impl RoleCache {
    /// Create a cache over `kv` with the given default snapshot TTL
    #[must_use]
    pub fn new(kv: Arc<dyn KvBackend>, default_ttl: Duration) -> Self {
        Self { kv, default_ttl }
    }

    /// Fetch a user's cached roles, `None` on miss
    pub async fn get_roles(&self, user_id: &str) -> Result<Option<Vec<String>>> {
        let Some(raw) = self.kv.get(&roles_key(user_id)).await? else {
            return Ok(None);
        };
        let snapshot: RoleSnapshot = serde_json::from_str(&raw)?;
        Ok(Some(snapshot.roles))
    }

    /// Write a user's role snapshot.
    ///
    /// A `ttl` of zero means "use the configured default TTL".
    pub async fn set_roles(&self, user_id: &str, roles: &[String], ttl: Duration) -> Result<()> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let snapshot = RoleSnapshot::new(roles.to_vec());
        let raw = serde_json::to_string(&snapshot)?;
        self.kv.set(&roles_key(user_id), &raw, Some(ttl)).await?;
        debug!(user_id, ttl_secs = ttl.as_secs(), "cached role snapshot");
        Ok(())
    }

    /// Delete a user's snapshot; absence is not an error
    pub async fn invalidate_roles(&self, user_id: &str) -> Result<()> {
        self.kv.del(&roles_key(user_id)).await?;
        debug!(user_id, "invalidated role snapshot");
        Ok(())
    }

    /// Remove `role` from every cached snapshot, synchronously.
    ///
    /// Tooling-only variant; the async path via
    /// [`start_remove_role_job`](Self::start_remove_role_job) is preferred.
    pub async fn remove_role_from_all(&self, role: &str) -> Result<usize> {
        let mut cursor = 0u64;
        let mut updated = 0usize;
        loop {
            let (next, keys) = self.kv.scan(cursor, "roles:*", job::SCAN_BATCH).await?;
            cursor = next;
            if keys.is_empty() {
                if cursor == 0 {
                    break;
                }
                continue;
            }

            let values = self.kv.mget(&keys).await?;
            let mut writes = Vec::new();
            for (key, raw) in keys.iter().zip(values) {
                let Some(raw) = raw else { continue };
                if let Some(write) =
                    job::plan_rewrite(self.kv.as_ref(), self.default_ttl, key, &raw, role).await
                {
                    writes.push(write);
                    updated += 1;
                }
            }
            self.kv.set_batch(&writes).await?;

            if cursor == 0 {
                break;
            }
        }
        Ok(updated)
    }

    /// Start an asynchronous cleanup job removing `role` from every cached
    /// snapshot, returning its id immediately.
    ///
    /// The worker runs detached from the caller: it is spawned on the
    /// runtime's root scope and outlives the originating request.
    pub async fn start_remove_role_job(&self, role: &str) -> Result<String> {
        let job_id = job::next_job_id();
        let record = CleanupJob::started(&job_id, role);
        job::persist(self.kv.as_ref(), &record).await?;

        let kv = Arc::clone(&self.kv);
        let default_ttl = self.default_ttl;
        let id = job_id.clone();
        let role = role.to_string();
        tokio::spawn(async move {
            job::run_remove_role_job(kv, default_ttl, id, role).await;
        });

        Ok(job_id)
    }

    /// Current snapshot of a cleanup job
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the job is unknown or its record
    /// has expired.
    pub async fn job_status(&self, job_id: &str) -> Result<CleanupJob> {
        let Some(raw) = self.kv.get(&job_key(job_id)).await? else {
            return Err(Error::NotFound(format!("cleanup job {job_id}")));
        };
        Ok(serde_json::from_str(&raw)?)
    }
}
