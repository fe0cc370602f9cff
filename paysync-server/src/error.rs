//! Server error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use paysync_core::envelope::EnvelopeError;
use paysync_core::money::Amount;

/// Server error types mapped to HTTP status codes.
#[derive(Debug)]
pub enum ServerError {
    Envelope(EnvelopeError),
    Database(String),
    Auth(String),
    NotFound(String),
    NoSuffixAvailable(Amount),
    RateLimited,
    BadRequest(String),
    Internal(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Envelope(e) => write!(f, "{}", e),
            Self::Database(e) => write!(f, "Database error: {}", e),
            Self::Auth(e) => write!(f, "Auth error: {}", e),
            Self::NotFound(e) => write!(f, "Not found: {}", e),
            Self::NoSuffixAvailable(base) => {
                write!(f, "No suffix available for base amount {}", base)
            }
            Self::RateLimited => write!(f, "Rate limited"),
            Self::BadRequest(e) => write!(f, "Bad request: {}", e),
            Self::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Envelope(e) => match e {
                EnvelopeError::TimestampExpired
                | EnvelopeError::InvalidSignature
                | EnvelopeError::NonceReplayed => StatusCode::UNAUTHORIZED,
                EnvelopeError::DecryptionFailed | EnvelopeError::ValidationFailed(_) => {
                    StatusCode::BAD_REQUEST
                }
                EnvelopeError::LedgerUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoSuffixAvailable(_) => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Database(_) | Self::Internal(_) => {
                tracing::error!(error = %self, "Request failed");
                "Internal server error".to_string()
            }
            Self::Envelope(EnvelopeError::LedgerUnavailable(_)) => {
                tracing::error!(error = %self, "Nonce ledger unavailable");
                "Internal server error".to_string()
            }
            Self::Auth(e) | Self::NotFound(e) | Self::BadRequest(e) => e.clone(),
            _ => self.to_string(),
        };

        let body = serde_json::json!({ "success": false, "message": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<EnvelopeError> for ServerError {
    fn from(e: EnvelopeError) -> Self {
        Self::Envelope(e)
    }
}

impl From<rusqlite::Error> for ServerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", e))
    }
}
