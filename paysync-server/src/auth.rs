//! Request authentication: the shared API key on every `/api/v1` route, and
//! the envelope headers plus nonce ledger for notification submissions.

use crate::error::ServerError;
use crate::state::AppState;
use crate::storage::ServerStorage;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use paysync_core::envelope::{EnvelopeError, NonceLedger, SealedEnvelope};
use paysync_core::protocol::{
    HEADER_API_KEY, HEADER_DEVICE_ID, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use rusqlite::params;
use subtle::ConstantTimeEq;

/// Rejects any request whose `X-Api-Key` differs from the configured key.
pub async fn api_key_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ServerError> {
    let presented = header(request.headers(), HEADER_API_KEY)
        .ok_or_else(|| ServerError::Auth("Missing API key".to_string()))?;

    let expected = state.config.api_key.as_bytes();
    if !bool::from(presented.as_bytes().ct_eq(expected)) {
        return Err(ServerError::Auth("Invalid API key".to_string()));
    }

    Ok(next.run(request).await)
}

pub fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn device_id(headers: &HeaderMap) -> Option<&str> {
    header(headers, HEADER_DEVICE_ID)
}

/// Rebuild the sealed envelope from the submission headers and body.
pub fn envelope_from_headers(
    headers: &HeaderMap,
    data: String,
) -> Result<SealedEnvelope, EnvelopeError> {
    let required = |name: &str| {
        header(headers, name)
            .map(str::to_string)
            .ok_or_else(|| EnvelopeError::ValidationFailed(format!("missing {} header", name)))
    };

    let timestamp = required(HEADER_TIMESTAMP)?;
    let timestamp_ms = timestamp.parse::<i64>().map_err(|_| {
        EnvelopeError::ValidationFailed(format!("invalid {} header", HEADER_TIMESTAMP))
    })?;

    Ok(SealedEnvelope {
        data,
        nonce: required(HEADER_NONCE)?,
        timestamp_ms,
        signature: required(HEADER_SIGNATURE)?,
    })
}

/// Nonce ledger in the `seen_nonces` table. The primary key on
/// `(device_id, nonce)` makes `INSERT OR IGNORE` the check-and-insert.
#[derive(Clone)]
pub struct SqliteNonceLedger {
    storage: ServerStorage,
}

impl SqliteNonceLedger {
    pub fn new(storage: ServerStorage) -> Self {
        Self { storage }
    }

    /// Forget nonces seen before `cutoff_ms`.
    pub fn prune(&self, cutoff_ms: i64) -> Result<usize, ServerError> {
        let conn = self.storage.conn()?;
        let removed = conn.execute(
            "DELETE FROM seen_nonces WHERE seen_at_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(removed)
    }
}

impl NonceLedger for SqliteNonceLedger {
    fn record(&self, device_id: &str, nonce: &str, seen_at_ms: i64) -> Result<bool, EnvelopeError> {
        let conn = self
            .storage
            .conn()
            .map_err(|e| EnvelopeError::LedgerUnavailable(e.to_string()))?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO seen_nonces (device_id, nonce, seen_at_ms)
                 VALUES (?1, ?2, ?3)",
                params![device_id, nonce, seen_at_ms],
            )
            .map_err(|e| EnvelopeError::LedgerUnavailable(e.to_string()))?;
        Ok(inserted == 1)
    }
}
