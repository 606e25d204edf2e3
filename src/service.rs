//! Roles service orchestrator
//!
//! Ties the cache, the upstream client, and the cleanup engine together.
//! Reads are availability-biased: cache errors degrade to misses and a
//! failed cache fill never fails the call. Writes are correctness-biased:
//! the cache is only touched after the upstream accepted the mutation.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use tracing::{info, warn};

use crate::cache::{CleanupJob, RoleCache};
use crate::singleflight::FlightGroup;
use crate::upstream::{IdpClient, RoleInput};
use crate::{Error, Result};

/// Total elapsed cap for the whole-operation retry around an upstream
/// fetch. The per-request retry inside the client handles transient
/// 5xx/transport flaps; this coarse layer rides out logical failures such
/// as a transiently open breaker.
const FETCH_ELAPSED_CAP: Duration = Duration::from_secs(10);

/// Orchestrator for role reads, writes, and cleanup jobs
pub struct RolesService {
    idp: Arc<dyn IdpClient>,
    cache: RoleCache,
    flight: FlightGroup<Vec<String>>,
    ttl: Duration,
}

impl RolesService {
    /// Create a service caching snapshots for `ttl`
    #[must_use]
    pub fn new(idp: Arc<dyn IdpClient>, cache: RoleCache, ttl: Duration) -> Self {
        Self {
            idp,
            cache,
            flight: FlightGroup::new(),
            ttl,
        }
    }

    /// Resolve a user's roles, cache-aside.
    ///
    /// Concurrent misses for the same user coalesce into one upstream
    /// fetch whose result (or error) every caller shares.
    pub async fn get_user_roles(&self, user_id: &str) -> Result<Vec<String>> {
        match self.cache.get_roles(user_id).await {
            Ok(Some(roles)) => return Ok(roles),
            Ok(None) => {}
            Err(e) => {
                warn!(user_id, error = %e, "cache read failed, treating as miss");
            }
        }

        let idp = Arc::clone(&self.idp);
        let cache = self.cache.clone();
        let ttl = self.ttl;
        let user = user_id.to_string();
        self.flight
            .run(&format!("roles:{user_id}"), move || async move {
                let roles = fetch_with_backoff(idp.as_ref(), &user).await?;
                if let Err(e) = cache.set_roles(&user, &roles, ttl).await {
                    warn!(user_id = %user, error = %e, "cache fill failed");
                }
                Ok(roles)
            })
            .await
            .map_err(Error::coalesced)
    }

    /// Create a single role upstream
    pub async fn create_role(&self, name: &str, desc: &str) -> Result<String> {
        self.idp.create_role(name, desc).await
    }

    /// Create several roles upstream
    pub async fn create_roles(&self, roles: &[RoleInput]) -> Result<Vec<String>> {
        self.idp.create_roles(roles).await
    }

    /// Grant a role to a user, then invalidate their snapshot
    pub async fn assign_role(&self, role_id: &str, user_id: &str) -> Result<()> {
        self.idp.assign_role_to_user(role_id, user_id).await?;
        self.cache.invalidate_roles(user_id).await
    }

    /// Grant several roles to a user, then invalidate their snapshot.
    ///
    /// An empty list is a successful no-op that never reaches the
    /// upstream.
    pub async fn assign_roles_to_user(&self, user_id: &str, role_ids: &[String]) -> Result<()> {
        if role_ids.is_empty() {
            return Ok(());
        }
        self.idp.assign_roles_to_user(user_id, role_ids).await?;
        self.cache.invalidate_roles(user_id).await
    }

    /// Delete a role upstream, then start a fleet-wide cleanup job.
    ///
    /// Only the job-creation error is surfaced; callers that want the job
    /// id use [`start_remove_role_cleanup`](Self::start_remove_role_cleanup).
    pub async fn delete_role(&self, role_id: &str) -> Result<()> {
        self.idp.delete_role(role_id).await?;
        self.start_remove_role_cleanup(role_id).await.map(|_| ())
    }

    /// Revoke a role from a user, then invalidate their snapshot
    pub async fn remove_role_from_user(&self, role_id: &str, user_id: &str) -> Result<()> {
        self.idp.remove_role_from_user(role_id, user_id).await?;
        self.cache.invalidate_roles(user_id).await
    }

    /// Drop a user's cached snapshot (webhook-driven external invalidation)
    pub async fn invalidate_roles(&self, user_id: &str) -> Result<()> {
        self.cache.invalidate_roles(user_id).await
    }

    /// Start a cleanup job removing `role` from every cached snapshot
    pub async fn start_remove_role_cleanup(&self, role: &str) -> Result<String> {
        let job_id = self.cache.start_remove_role_job(role).await?;
        info!(role, job_id = %job_id, "started role cleanup job");
        Ok(job_id)
    }

    /// Current snapshot of a cleanup job
    pub async fn cleanup_job_status(&self, job_id: &str) -> Result<CleanupJob> {
        self.cache.job_status(job_id).await
    }

    /// React to an IdP webhook event. Errors are swallowed; the webhook
    /// always succeeds at the transport level.
    pub async fn handle_webhook_event(
        &self,
        user_id: Option<&str>,
        event_type: Option<&str>,
        role: Option<&str>,
    ) {
        if let Some(user_id) = user_id.filter(|u| !u.is_empty()) {
            if let Err(e) = self.invalidate_roles(user_id).await {
                warn!(user_id, error = %e, "webhook invalidation failed");
            }
        }
        if event_type == Some("role.deleted") {
            if let Some(role) = role.filter(|r| !r.is_empty()) {
                if let Err(e) = self.start_remove_role_cleanup(role).await {
                    warn!(role, error = %e, "webhook cleanup start failed");
                }
            }
        }
    }
}

/// Whether the coarse retry layer should try the operation again.
fn is_transient(error: &Error) -> bool {
    match error {
        Error::CircuitOpen(_) | Error::Transport(_) | Error::Http(_) | Error::Store(_) => true,
        Error::UpstreamStatus { status, .. } => *status >= 500,
        _ => false,
    }
}

/// Fetch a user's roles under the whole-operation backoff policy.
async fn fetch_with_backoff(idp: &dyn IdpClient, user_id: &str) -> Result<Vec<String>> {
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(FETCH_ELAPSED_CAP),
        ..ExponentialBackoff::default()
    };
    backoff::future::retry(policy, || async {
        idp.get_user_roles(user_id).await.map_err(|e| {
            if is_transient(&e) {
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    })
    .await
}
