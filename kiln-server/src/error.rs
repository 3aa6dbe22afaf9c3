//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.
//!
//! **Security note:** internal errors (store, upstream services) are logged
//! with full detail but only a generic message is returned to the caller so
//! that file paths, SQL, or other implementation details never leak.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kiln_core::OrchestrateError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// All errors that can occur in the kiln-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the orchestration engine.
    #[error("engine error: {0}")]
    Engine(#[from] OrchestrateError),

    /// Propagated from the SQLite store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            // Client-facing errors: expose the message directly.
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),

            ServerError::Engine(e) => match e {
                OrchestrateError::NotPermitted(m) => (StatusCode::FORBIDDEN, m.clone()),
                OrchestrateError::ConcurrencyExceeded { .. } => {
                    (StatusCode::TOO_MANY_REQUESTS, e.to_string())
                }
                OrchestrateError::InsufficientCredits(m) => {
                    (StatusCode::PAYMENT_REQUIRED, m.clone())
                }
                OrchestrateError::QueueFull { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
                }
                OrchestrateError::TaskNotFound(id) => {
                    (StatusCode::NOT_FOUND, format!("task {id} not found"))
                }
                // Everything else is an engine-internal condition; log the
                // detail and keep the response generic.
                _ => {
                    error!(error = %e, "engine error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_owned(),
                    )
                }
            },
            ServerError::Database(e) => {
                error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::Internal(e.to_string())
    }
}
