//! Error types for rolegate

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for rolegate
pub type Result<T> = std::result::Result<T, Error>;

/// Rolegate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Requested entity does not exist (job, grant)
    #[error("not found: {0}")]
    NotFound(String),

    /// Inbound caller could not be authenticated
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed inbound request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Upstream IdP answered with a non-2xx status
    #[error("upstream returned {status}: {detail}")]
    UpstreamStatus {
        /// HTTP status code
        status: u16,
        /// Decoded response body fragment
        detail: String,
    },

    /// Transport-level failure talking to the upstream
    #[error("transport error: {0}")]
    Transport(String),

    /// Circuit breaker rejected the call before it reached the network
    #[error("circuit breaker open: {0}")]
    CircuitOpen(String),

    /// Cache store failure
    #[error("store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error shared between coalesced callers of the same in-flight fetch
    #[error(transparent)]
    Coalesced(Arc<Error>),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Unwrap a shared error back into an owned one where possible.
    pub(crate) fn coalesced(err: Arc<Error>) -> Self {
        match Arc::try_unwrap(err) {
            Ok(e) => e,
            Err(shared) => Self::Coalesced(shared),
        }
    }

    /// HTTP status this error maps onto at the API surface.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Unauthorized(_) => 401,
            Self::BadRequest(_) => 400,
            Self::Coalesced(inner) => inner.status_code(),
            _ => 500,
        }
    }

    /// Short machine-readable code used in error response bodies.
    ///
    /// An open circuit is reported as an upstream failure to callers; the
    /// distinction is visible in logs only.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::BadRequest(_) => "invalid",
            Self::UpstreamStatus { .. } | Self::Transport(_) | Self::Http(_) | Self::CircuitOpen(_) => {
                "upstream_failed"
            }
            Self::Store(_) => "store_failed",
            Self::Coalesced(inner) => inner.code(),
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => "internal",
        }
    }
}
