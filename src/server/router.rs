//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    extract::{FromRequest, Path, Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use super::auth::{roles_middleware, Subject, SubjectResolver};
use crate::failsafe::CircuitBreaker;
use crate::kv::KvBackend;
use crate::service::RolesService;
use crate::upstream::RoleInput;
use crate::Error;

/// Shared application state
pub struct AppState {
    /// Roles service orchestrator
    pub service: Arc<RolesService>,
    /// Inbound subject resolver
    pub resolver: Arc<SubjectResolver>,
    /// Cache store handle, used for liveness checks
    pub kv: Arc<dyn KvBackend>,
    /// Upstream circuit breaker, surfaced in health output
    pub breaker: Arc<CircuitBreaker>,
}

/// Error wrapper mapping [`Error`] onto `{error, detail}` responses
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            // CircuitOpen surfaces here distinctly even though callers see
            // a generic upstream failure.
            error!(error = %self.0, code = self.0.code(), "request failed");
        } else {
            warn!(error = %self.0, code = self.0.code(), "request rejected");
        }
        let body = json!({ "error": self.0.code(), "detail": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// JSON extractor that rejects malformed bodies with a 400 instead of
/// axum's default 422.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(Error::BadRequest(rejection.body_text()))),
        }
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/me/profile", get(me_profile))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            roles_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/v1/roles", post(create_role))
        .route("/v1/roles/batch", post(create_roles_batch))
        .route("/v1/roles/assign", post(assign_role))
        .route("/v1/roles/assign/batch", post(assign_roles_batch))
        .route("/v1/roles/{role}", delete(delete_role))
        .route("/v1/roles/{role}/users/{user}", delete(remove_role_from_user))
        .route("/v1/roles/remove/async", post(start_cleanup))
        .route("/v1/jobs/{id}", get(job_status))
        .route("/v1/webhook/zitadel", post(webhook))
        .merge(protected)
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = match state.kv.ping().await {
        Ok(()) => "up",
        Err(e) => {
            warn!(error = %e, "store liveness check failed");
            "down"
        }
    };
    Json(json!({
        "status": "ok",
        "store": store,
        "breaker": state.breaker.state().as_str(),
    }))
}

#[derive(Debug, Deserialize)]
struct CreateRoleRequest {
    name: String,
    #[serde(default)]
    desc: String,
}

async fn create_role(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(Error::BadRequest("name is required".into()).into());
    }
    let role_id = state.service.create_role(&req.name, &req.desc).await?;
    Ok((StatusCode::CREATED, Json(json!({ "role_id": role_id }))))
}

async fn create_roles_batch(
    State(state): State<Arc<AppState>>,
    ApiJson(roles): ApiJson<Vec<RoleInput>>,
) -> Result<impl IntoResponse, ApiError> {
    if roles.iter().any(|r| r.name.trim().is_empty()) {
        return Err(Error::BadRequest("every role needs a name".into()).into());
    }
    state.service.create_roles(&roles).await?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true }))))
}

#[derive(Debug, Deserialize)]
struct AssignRoleRequest {
    role_id: String,
    user_id: String,
}

async fn assign_role(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<AssignRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.role_id.is_empty() || req.user_id.is_empty() {
        return Err(Error::BadRequest("role_id and user_id are required".into()).into());
    }
    state.service.assign_role(&req.role_id, &req.user_id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct AssignRolesBatchRequest {
    user_id: String,
    role_ids: Vec<String>,
}

async fn assign_roles_batch(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<AssignRolesBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.user_id.is_empty() {
        return Err(Error::BadRequest("user_id is required".into()).into());
    }
    state
        .service
        .assign_roles_to_user(&req.user_id, &req.role_ids)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_role(
    State(state): State<Arc<AppState>>,
    Path(role): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete_role(&role).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn remove_role_from_user(
    State(state): State<Arc<AppState>>,
    Path((role, user)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.remove_role_from_user(&role, &user).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct StartCleanupRequest {
    role: String,
}

async fn start_cleanup(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<StartCleanupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.role.is_empty() {
        return Err(Error::BadRequest("role is required".into()).into());
    }
    let job_id = state.service.start_remove_role_cleanup(&req.role).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.cleanup_job_status(&id).await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default, rename = "type")]
    event_type: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    ApiJson(event): ApiJson<WebhookEvent>,
) -> impl IntoResponse {
    let request_id = uuid::Uuid::new_v4();
    info!(
        request_id = %request_id,
        event_type = event.event_type.as_deref().unwrap_or(""),
        "received IdP webhook"
    );
    state
        .service
        .handle_webhook_event(
            event.user_id.as_deref(),
            event.event_type.as_deref(),
            event.role.as_deref(),
        )
        .await;
    StatusCode::OK
}

async fn me_profile(Extension(subject): Extension<Subject>) -> impl IntoResponse {
    Json(json!({ "user": subject.user_id, "roles": subject.roles }))
}
