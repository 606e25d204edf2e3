//! Inbound subject resolution
//!
//! Role-protected routes accept either a trusted `X-User-ID` header or a
//! bearer token that is resolved to a subject id through the IdP's
//! userinfo endpoint.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::router::{ApiError, AppState};
use crate::{Error, Result};

/// Timeout for the userinfo lookup
const USERINFO_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves inbound credentials to a subject id
pub struct SubjectResolver {
    http: reqwest::Client,
    userinfo_url: String,
}

impl SubjectResolver {
    /// Create a resolver against the given IdP base URL
    pub fn new(zitadel_domain: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(USERINFO_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            http,
            userinfo_url: format!("{}/oidc/v1/userinfo", zitadel_domain.trim_end_matches('/')),
        })
    }

    /// Resolve the caller's user id from request headers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] when neither an `X-User-ID` header
    /// nor a resolvable bearer token is present.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<String> {
        if let Some(user_id) = headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return Ok(user_id.to_string());
        }

        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Unauthorized("missing user id or bearer token".into()))?;

        self.fetch_subject(token).await
    }

    async fn fetch_subject(&self, token: &str) -> Result<String> {
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::Unauthorized(format!("userinfo request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Unauthorized(format!(
                "userinfo returned {}",
                response.status().as_u16()
            )));
        }

        let info: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Unauthorized(format!("userinfo decode failed: {e}")))?;
        info.get("sub")
            .and_then(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| Error::Unauthorized("sub not present in userinfo response".into()))
    }
}

/// Caller identity attached to role-protected requests
#[derive(Debug, Clone)]
pub struct Subject {
    /// Resolved user id
    pub user_id: String,
    /// Roles the user holds, as cached or fetched
    pub roles: Vec<String>,
}

/// Whether the user holds at least one of the given roles
#[must_use]
pub fn has_any_role(user_roles: &[String], wanted: &[&str]) -> bool {
    let held: HashSet<&str> = user_roles.iter().map(String::as_str).collect();
    wanted.iter().any(|role| held.contains(role))
}

/// Middleware resolving the caller and loading their roles.
///
/// On success a [`Subject`] extension is attached to the request.
pub async fn roles_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let user_id = match state.resolver.resolve(request.headers()).await {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!(error = %e, "subject resolution failed");
            return ApiError(e).into_response();
        }
    };

    let roles = match state.service.get_user_roles(&user_id).await {
        Ok(roles) => roles,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "failed to fetch roles for caller");
            return ApiError(e).into_response();
        }
    };

    debug!(user_id = %user_id, roles = roles.len(), "resolved caller");
    request.extensions_mut().insert(Subject { user_id, roles });
    next.run(request).await
}
