//! Error handling for the Ops Manager control tower

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Registry / configuration error (fatal at startup)
    #[error("Config error: {0}")]
    Config(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error (bad request input)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network error (connection failure to a managed server)
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication rejected by a managed server
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Non-2xx application response from a managed server
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Cache file unreadable; recovered internally as a cache miss
    #[error("Cache corrupt: {0}")]
    CacheCorrupt(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                msg.clone(),
            ),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::Network(msg) => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR", msg.clone()),
            Error::Auth(msg) => (StatusCode::BAD_GATEWAY, "AUTH_ERROR", msg.clone()),
            Error::Api { status, message } => (
                StatusCode::BAD_GATEWAY,
                "API_ERROR",
                format!("upstream HTTP {}: {}", status, message),
            ),
            Error::CacheCorrupt(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CACHE_CORRUPT",
                msg.clone(),
            ),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string()),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e.to_string()),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
