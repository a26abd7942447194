use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy shared by the dispatch engine and the RPC surface.
#[derive(Debug, Error)]
pub enum AppError {
    /// Database I/O failure. Safe to retry on a later pass.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The ledger gate is already claimed for this pair.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unparseable checkpoint or structurally invalid preference document.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Provider rejected the request, was unreachable or answered garbage.
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Setup failure that must stop the process from starting.
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a later pass may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::DeliveryFailed(_))
    }

    /// Stable snake_case name of the variant, used in logs and RPC error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "transient_io",
            AppError::Conflict(_) => "conflict",
            AppError::MalformedInput(_) => "malformed_input",
            AppError::DeliveryFailed(_) => "delivery_failed",
            AppError::Fatal(_) => "fatal",
            AppError::Config(_) => "config",
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::MalformedInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::DeliveryFailed(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Fatal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = json!({ "error": message, "kind": self.kind() });
        (status, Json(body)).into_response()
    }
}
