//! Cleanup job engine
//!
//! A cleanup job walks every `roles:*` key with a cursored scan, removes
//! one role from each snapshot that carries it, and reports progress
//! through a job record readable by id. Workers are detached from the
//! request that started them; a process shutdown leaves the last persisted
//! snapshot in `running` until the record's TTL expires.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{job_key, RoleSnapshot};
use crate::kv::{KeyTtl, KvBackend};
use crate::Result;

/// Keys requested per SCAN step
pub(crate) const SCAN_BATCH: usize = 100;
/// Persist an intermediate job snapshot every this many processed entries
const PROGRESS_EVERY: u64 = 50;
/// Job records expire after this long
const JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifecycle state of a cleanup job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Worker is still scanning
    Running,
    /// Scan completed
    Done,
    /// Worker hit a store error and stopped
    Failed,
}

/// Progress record of one cleanup job
///
/// `processed` and `updated` are non-decreasing across observations; a
/// terminal status sets `finished_at`, and `failed` carries an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupJob {
    /// Job identifier (nanosecond start timestamp)
    pub job_id: String,
    /// Role being removed
    pub role: String,
    /// Entries examined so far
    pub processed: u64,
    /// Entries actually rewritten
    pub updated: u64,
    /// Current lifecycle state
    pub status: JobStatus,
    /// When the job started
    pub started_at: DateTime<Utc>,
    /// When the job reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message when `status == failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CleanupJob {
    pub(crate) fn started(job_id: &str, role: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            role: role.to_string(),
            processed: 0,
            updated: 0,
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    fn finish_done(&mut self) {
        self.status = JobStatus::Done;
        self.finished_at = Some(Utc::now());
    }

    fn finish_failed(&mut self, message: String) {
        self.status = JobStatus::Failed;
        self.error = Some(message);
        self.finished_at = Some(Utc::now());
    }
}

/// Allocate a job id from the monotonic wall clock.
///
/// Nanosecond timestamps are unique enough under modest start rates; two
/// simultaneous starts would overwrite each other, which is acceptable
/// given that job state is best-effort. A collision-critical deployment
/// would substitute a 128-bit random id.
pub(crate) fn next_job_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos}")
}

/// Persist the current job record under its 24 h TTL.
pub(crate) async fn persist(kv: &dyn KvBackend, job: &CleanupJob) -> Result<()> {
    let raw = serde_json::to_string(job)?;
    kv.set(&job_key(&job.job_id), &raw, Some(JOB_TTL)).await
}

/// Decide whether `raw` needs `role` removed and under which expiration.
///
/// Returns the rewrite to queue, or `None` when the snapshot does not
/// carry the role, fails to decode, or vanished from the store mid-scan.
/// The existing TTL is preserved: a positive remainder is reapplied
/// verbatim, a no-expiry entry stays non-expiring, and a TTL lookup error
/// falls back to the default TTL.
pub(crate) async fn plan_rewrite(
    kv: &dyn KvBackend,
    default_ttl: Duration,
    key: &str,
    raw: &str,
    role: &str,
) -> Option<(String, String, Option<Duration>)> {
    let mut snapshot: RoleSnapshot = match serde_json::from_str(raw) {
        Ok(s) => s,
        Err(e) => {
            warn!(key, error = %e, "skipping undecodable snapshot");
            return None;
        }
    };

    let before = snapshot.roles.len();
    snapshot.roles.retain(|r| r != role);
    if snapshot.roles.len() == before {
        return None;
    }

    let ttl = match kv.ttl(key).await {
        Ok(KeyTtl::Remaining(remaining)) => Some(remaining),
        Ok(KeyTtl::NoExpiry) => None,
        Ok(KeyTtl::Missing) => return None,
        Err(e) => {
            warn!(key, error = %e, "TTL lookup failed, falling back to default");
            Some(default_ttl)
        }
    };

    let value = match serde_json::to_string(&snapshot) {
        Ok(v) => v,
        Err(e) => {
            warn!(key, error = %e, "skipping unencodable snapshot");
            return None;
        }
    };
    Some((key.to_string(), value, ttl))
}

/// Worker loop of one cleanup job.
pub(crate) async fn run_remove_role_job(
    kv: Arc<dyn KvBackend>,
    default_ttl: Duration,
    job_id: String,
    role: String,
) {
    let mut job = CleanupJob::started(&job_id, &role);
    let _ = persist(kv.as_ref(), &job).await;
    info!(job_id = %job_id, role = %role, "cleanup job started");

    let mut cursor = 0u64;
    loop {
        let (next, keys) = match kv.scan(cursor, "roles:*", SCAN_BATCH).await {
            Ok(step) => step,
            Err(e) => return fail(kv.as_ref(), &mut job, e.to_string()).await,
        };
        cursor = next;
        if keys.is_empty() {
            if cursor == 0 {
                break;
            }
            continue;
        }

        let values = match kv.mget(&keys).await {
            Ok(values) => values,
            Err(e) => return fail(kv.as_ref(), &mut job, e.to_string()).await,
        };

        let mut writes = Vec::new();
        for (key, raw) in keys.iter().zip(values) {
            job.processed += 1;
            if let Some(raw) = raw {
                if let Some(write) =
                    plan_rewrite(kv.as_ref(), default_ttl, key, &raw, &role).await
                {
                    writes.push(write);
                    job.updated += 1;
                }
            }
            if job.processed % PROGRESS_EVERY == 0 {
                let _ = persist(kv.as_ref(), &job).await;
            }
        }

        if let Err(e) = kv.set_batch(&writes).await {
            return fail(kv.as_ref(), &mut job, e.to_string()).await;
        }
        let _ = persist(kv.as_ref(), &job).await;

        if cursor == 0 {
            break;
        }
    }

    job.finish_done();
    let _ = persist(kv.as_ref(), &job).await;
    info!(
        job_id = %job.job_id,
        role = %job.role,
        processed = job.processed,
        updated = job.updated,
        "cleanup job done"
    );
}

async fn fail(kv: &dyn KvBackend, job: &mut CleanupJob, message: String) {
    error!(job_id = %job.job_id, role = %job.role, error = %message, "cleanup job failed");
    job.finish_failed(message);
    let _ = persist(kv, job).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryBackend;

    fn snapshot_json(roles: &[&str]) -> String {
        serde_json::to_string(&RoleSnapshot {
            roles: roles.iter().map(ToString::to_string).collect(),
            fetched_at: Utc::now(),
            version: super::super::SNAPSHOT_VERSION.to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn plan_rewrite_skips_snapshot_without_role() {
        let kv = MemoryBackend::new();
        let raw = snapshot_json(&["viewer"]);
        kv.set("roles:u1", &raw, None).await.unwrap();
        let plan = plan_rewrite(&kv, Duration::from_secs(300), "roles:u1", &raw, "admin").await;
        assert!(plan.is_none());
    }

    #[tokio::test]
    async fn plan_rewrite_preserves_positive_ttl() {
        let kv = MemoryBackend::new();
        let raw = snapshot_json(&["admin", "viewer"]);
        kv.set("roles:u1", &raw, Some(Duration::from_secs(42)))
            .await
            .unwrap();
        let (key, value, ttl) =
            plan_rewrite(&kv, Duration::from_secs(300), "roles:u1", &raw, "admin")
                .await
                .expect("rewrite planned");
        assert_eq!(key, "roles:u1");
        let snapshot: RoleSnapshot = serde_json::from_str(&value).unwrap();
        assert_eq!(snapshot.roles, vec!["viewer".to_string()]);
        let ttl = ttl.expect("ttl preserved");
        assert!(ttl <= Duration::from_secs(42) && ttl > Duration::from_secs(40));
    }

    #[tokio::test]
    async fn plan_rewrite_keeps_no_expiry() {
        let kv = MemoryBackend::new();
        let raw = snapshot_json(&["admin"]);
        kv.set("roles:u1", &raw, None).await.unwrap();
        let (_, _, ttl) = plan_rewrite(&kv, Duration::from_secs(300), "roles:u1", &raw, "admin")
            .await
            .expect("rewrite planned");
        assert_eq!(ttl, None);
    }

    #[tokio::test]
    async fn plan_rewrite_skips_vanished_key() {
        let kv = MemoryBackend::new();
        let raw = snapshot_json(&["admin"]);
        // Key never written: the TTL probe reports it missing.
        let plan = plan_rewrite(&kv, Duration::from_secs(300), "roles:gone", &raw, "admin").await;
        assert!(plan.is_none());
    }

    #[tokio::test]
    async fn plan_rewrite_skips_corrupt_value() {
        let kv = MemoryBackend::new();
        kv.set("roles:u1", "not json", None).await.unwrap();
        let plan =
            plan_rewrite(&kv, Duration::from_secs(300), "roles:u1", "not json", "admin").await;
        assert!(plan.is_none());
    }

    #[test]
    fn job_ids_are_monotone_nanos() {
        let a: u128 = next_job_id().parse().unwrap();
        let b: u128 = next_job_id().parse().unwrap();
        assert!(b >= a);
    }

    #[test]
    fn terminal_states_set_finished_at() {
        let mut job = CleanupJob::started("1", "admin");
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.finished_at.is_none());

        job.finish_done();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.finished_at.is_some());

        let mut failed = CleanupJob::started("2", "admin");
        failed.finish_failed("scan error".into());
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("scan error"));
        assert!(failed.finished_at.is_some());
    }

    #[test]
    fn job_record_serializes_status_lowercase() {
        let mut job = CleanupJob::started("1", "admin");
        job.finish_done();
        let raw = serde_json::to_string(&job).unwrap();
        assert!(raw.contains(r#""status":"done""#));
    }
}
