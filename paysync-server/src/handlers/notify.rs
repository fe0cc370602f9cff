//! Notification submission: verify the envelope, then reconcile.

use crate::auth::{device_id, envelope_from_headers};
use crate::error::ServerError;
use crate::matcher::MatchOutcome;
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use paysync_core::envelope::EnvelopeError;
use paysync_core::protocol::{NotifyRequest, NotifyResponse};
use tracing::warn;

pub async fn notify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NotifyRequest>,
) -> Result<Json<NotifyResponse>, ServerError> {
    let device_id = device_id(&headers)
        .ok_or_else(|| EnvelopeError::ValidationFailed("missing X-Device-Id header".to_string()))?
        .to_string();

    if !state.throttle.admit(&device_id) {
        warn!(device_id, "Notification rate limit exceeded");
        return Err(ServerError::RateLimited);
    }

    let sealed = envelope_from_headers(&headers, req.data)?;
    let tx = state
        .envelope
        .open_transaction(&sealed, &device_id, &state.nonces)
        .inspect_err(|e| warn!(device_id, error = %e, "Rejected notification"))?;

    let outcome = state.matcher.process(&tx, &device_id)?;
    let message = outcome.message().to_string();
    let response = match outcome {
        MatchOutcome::Matched(details) => NotifyResponse {
            success: true,
            message,
            matched: Some(true),
            match_details: Some(details),
        },
        MatchOutcome::Unmatched | MatchOutcome::Recorded => NotifyResponse {
            success: true,
            message,
            matched: Some(false),
            match_details: None,
        },
    };
    Ok(Json(response))
}
