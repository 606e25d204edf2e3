//! Zitadel management-API client
//!
//! Requests run through a three-layer pipeline: bearer-token injection,
//! bounded exponential-backoff retry (transport errors and 5xx only), and
//! a circuit breaker wrapping the whole retried call so one logical
//! operation counts once toward the breaker regardless of attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{IdpClient, RoleInput};
use crate::config::Config;
use crate::failsafe::{with_retry, CircuitBreaker, RetryPolicy};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct BulkCreateResponse {
    #[serde(default)]
    roles: Vec<CreatedRole>,
}

#[derive(Debug, Deserialize)]
struct CreatedRole {
    key: String,
}

#[derive(Debug, Deserialize)]
struct GrantSearchResponse {
    #[serde(default)]
    result: Vec<Grant>,
}

#[derive(Debug, Deserialize)]
struct Grant {
    #[serde(default, rename = "grantId")]
    grant_id: String,
    #[serde(default)]
    id: String,
    #[serde(default, rename = "roleKeys")]
    role_keys: Vec<String>,
}

impl Grant {
    /// The id to delete this grant by; `grantId` when present, else `id`.
    fn delete_id(&self) -> &str {
        if self.grant_id.is_empty() {
            &self.id
        } else {
            &self.grant_id
        }
    }
}

/// HTTP client for the Zitadel management API
pub struct ZitadelClient {
    http: Client,
    base: Url,
    token: String,
    project: String,
    project_grant: String,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl ZitadelClient {
    /// Create a client from the gateway configuration, sharing `breaker`
    /// across every operation.
    pub fn new(config: &Config, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let base = Url::parse(&config.zitadel_domain)
            .map_err(|e| Error::Config(format!("invalid ZITADEL_DOMAIN: {e}")))?;

        Ok(Self {
            http,
            base,
            token: config.service_account_token.clone(),
            project: config.project_id.clone(),
            project_grant: config.project_grant_id.clone(),
            retry: RetryPolicy::new(config.retry_max),
            breaker,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let cleaned = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        self.base
            .join(&cleaned)
            .map_err(|e| Error::Internal(format!("bad endpoint {path}: {e}")))
    }

    /// Issue one logical request through the retry and breaker layers.
    ///
    /// A 5xx response is converted into an error before it reaches the
    /// breaker; lower statuses are returned for the caller to interpret.
    async fn dispatch(
        &self,
        name: &'static str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        let url = self.endpoint(path)?;
        self.breaker
            .call(|| async {
                with_retry(&self.retry, name, || async {
                    let mut request = self
                        .http
                        .request(method.clone(), url.clone())
                        .bearer_auth(&self.token)
                        .header(header::CONTENT_TYPE, "application/json");
                    if let Some(body) = &body {
                        request = request.json(body);
                    }
                    let response = request
                        .send()
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;

                    let status = response.status().as_u16();
                    if status >= 500 {
                        let detail = response.text().await.unwrap_or_default();
                        return Err(Error::UpstreamStatus { status, detail });
                    }
                    Ok(response)
                })
                .await
            })
            .await
    }

    /// Reject any remaining non-2xx response, carrying the body fragment
    /// for diagnostics.
    async fn ensure_success(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        let status = response.status().as_u16();
        if status >= 300 {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus {
                status,
                detail: format!("{operation}: {detail}"),
            });
        }
        Ok(response)
    }

    async fn search_grants(&self, user_id: &str) -> Result<Vec<Grant>> {
        let body = json!({
            "queries": [
                { "user_id_query": { "user_id": user_id } }
            ]
        });
        let response = self
            .dispatch(
                "search_grants",
                Method::POST,
                "/management/v1/users/grants/_search",
                Some(body),
            )
            .await?;
        let response = Self::ensure_success("search grants", response).await?;
        let decoded: GrantSearchResponse = response.json().await?;
        Ok(decoded.result)
    }
}

#[async_trait]
impl IdpClient for ZitadelClient {
    async fn create_roles(&self, roles: &[RoleInput]) -> Result<Vec<String>> {
        let bulk: Vec<Value> = roles
            .iter()
            .map(|r| {
                json!({
                    "key": r.name,
                    "displayName": r.desc,
                    "group": "default",
                })
            })
            .collect();
        let path = format!("/management/v1/projects/{}/roles/_bulk", self.project);
        let response = self
            .dispatch(
                "create_roles",
                Method::POST,
                &path,
                Some(json!({ "roles": bulk })),
            )
            .await?;
        let response = Self::ensure_success("create roles bulk", response).await?;

        // An empty or unexpected body still counts as success; the caller
        // just gets no ids back.
        let decoded: BulkCreateResponse = response.json().await.unwrap_or(BulkCreateResponse {
            roles: Vec::new(),
        });
        Ok(decoded.roles.into_iter().map(|r| r.key).collect())
    }

    async fn assign_roles_to_user(&self, user_id: &str, role_keys: &[String]) -> Result<()> {
        if role_keys.is_empty() {
            return Ok(());
        }
        let body = json!({
            "projectId": self.project,
            "projectGrantId": self.project_grant,
            "roleKeys": role_keys,
        });
        let path = format!("/management/v1/users/{user_id}/grants");
        let response = self
            .dispatch("assign_roles", Method::POST, &path, Some(body))
            .await?;
        Self::ensure_success("assign roles", response).await?;
        Ok(())
    }

    async fn delete_role(&self, role_key: &str) -> Result<()> {
        let path = format!(
            "/management/v1/projects/{}/roles/{role_key}",
            self.project
        );
        let response = self
            .dispatch("delete_role", Method::DELETE, &path, None)
            .await?;
        Self::ensure_success("delete role", response).await?;
        Ok(())
    }

    async fn remove_role_from_user(&self, role_key: &str, user_id: &str) -> Result<()> {
        let grants = self.search_grants(user_id).await?;
        let grant = grants
            .iter()
            .find(|g| g.role_keys.iter().any(|r| r == role_key))
            .ok_or_else(|| {
                Error::NotFound(format!("grant for user {user_id} and role {role_key}"))
            })?;

        debug!(user_id, role = role_key, grant = grant.delete_id(), "deleting grant");
        let path = format!(
            "/management/v1/users/{user_id}/grants/{}",
            grant.delete_id()
        );
        let response = self
            .dispatch("delete_grant", Method::DELETE, &path, None)
            .await?;
        Self::ensure_success("delete grant", response).await?;
        Ok(())
    }

    async fn get_user_roles(&self, user_id: &str) -> Result<Vec<String>> {
        let grants = self.search_grants(user_id).await?;
        Ok(grants.into_iter().flat_map(|g| g.role_keys).collect())
    }
}
