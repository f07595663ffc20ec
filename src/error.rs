//! Error types for Fedicore
//!
//! HTTP-facing errors are `AppError`, which implements `IntoResponse`.
//! Federation failures are `FederationError`, classified as permanent
//! (dropped at the inbox boundary) or retryable (propagated to the queue).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// This enum represents all possible errors that can occur
/// in the application. It implements `IntoResponse` to
/// automatically convert errors to appropriate HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbox queue is closed or full (503)
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "http_client"),
            AppError::Federation(_) => (StatusCode::BAD_GATEWAY, "federation"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }

    /// Convert to a response with a status code only.
    ///
    /// Federation surfaces answer client protocol errors without a body.
    pub fn into_bodyless_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        record_error(error_type);
        status.into_response()
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_type) = self.status_and_type();
        let error_message = match &self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        record_error(error_type);

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

fn record_error(error_type: &str) {
    use crate::metrics::ERRORS_TOTAL;
    ERRORS_TOTAL
        .with_label_values(&[error_type, "unknown"])
        .inc();
}

/// Failures raised while resolving, authenticating or dispatching federated input
#[derive(Debug, Error)]
pub enum FederationError {
    /// The value handed to the resolver was null
    #[error("resolvee is null")]
    InvalidInput,

    /// The identifier was already dereferenced in this resolution chain
    #[error("cannot resolve already resolved identifier: {0}")]
    AlreadyResolved(String),

    /// The fetched body is absent or does not declare the federation namespace
    #[error("invalid response from {0}")]
    InvalidResponse(String),

    /// The document is not a Collection/OrderedCollection (or page)
    #[error("unknown collection type: {0}")]
    UnknownCollectionType(String),

    /// The remote answered with a non-success status
    #[error("remote {uri} responded with HTTP {status}")]
    RemoteStatus { uri: String, status: u16 },

    /// The identifier points at a scheme or destination this server will not fetch
    #[error("refusing to fetch {0}")]
    Refused(String),

    /// Network failure, timeout, or undecodable body
    #[error("transport error: {0}")]
    Transport(String),

    /// An identifier inside the activity is hosted elsewhere than the signer
    #[error("{0}")]
    HostMismatch(String),

    /// `acct:` key id without a host
    #[error("request was made by local user: @{0}")]
    LocalActorClaim(String),

    /// keyId is neither a URI nor an `acct:` handle
    #[error("invalid keyId: {0}")]
    InvalidKeyId(String),

    /// The activity payload could not be interpreted
    #[error("invalid activity: {0}")]
    InvalidActivity(String),

    /// The fetched actor document is unusable
    #[error("invalid actor: {0}")]
    InvalidActor(String),

    /// HTTP signature did not verify
    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    /// Local persistence failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A store call failed for a reason other than the database driver
    #[error("store error: {0}")]
    Store(String),
}

impl From<AppError> for FederationError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Database(e) => FederationError::Database(e),
            AppError::Federation(e) => e,
            other => FederationError::Store(other.to_string()),
        }
    }
}

impl FederationError {
    /// HTTP status reported by the remote, when the failure carries one
    pub fn status(&self) -> Option<u16> {
        match self {
            FederationError::RemoteStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for 4xx answers, which mean the remote object does not exist for us
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|status| (400..500).contains(&status))
    }

    /// Whether the queue should re-attempt the delivery that produced this error
    pub fn is_retryable(&self) -> bool {
        match self {
            FederationError::Transport(_)
            | FederationError::Database(_)
            | FederationError::Store(_) => true,
            FederationError::RemoteStatus { status, .. } => !(400..500).contains(status),
            FederationError::InvalidResponse(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FederationError {
    fn from(err: reqwest::Error) -> Self {
        FederationError::Transport(err.to_string())
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
