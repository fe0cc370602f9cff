//! Unique-amount issuance for checkout.

use crate::error::ServerError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use chrono::DateTime;
use paysync_core::protocol::{ActionResponse, GenerateAmountRequest, GenerateAmountResponse};

pub async fn generate_amount(
    State(state): State<AppState>,
    Json(req): Json<GenerateAmountRequest>,
) -> Result<Json<GenerateAmountResponse>, ServerError> {
    let expiry_minutes = req
        .expiry_minutes
        .unwrap_or(state.config.default_expiry_minutes);
    let reservation = state
        .allocator
        .reserve(req.base_amount, expiry_minutes, req.order_id.as_deref())?;

    let expires_at = DateTime::from_timestamp_millis(reservation.expires_at_ms)
        .ok_or_else(|| ServerError::Internal("expiry out of range".to_string()))?;

    Ok(Json(GenerateAmountResponse {
        success: true,
        reservation_id: reservation.id,
        unique_amount: reservation.unique_amount,
        expires_at,
    }))
}

pub async fn cancel_amount(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ActionResponse>, ServerError> {
    let reservation = state
        .allocator
        .get(id)?
        .ok_or_else(|| ServerError::NotFound(format!("reservation {} not found", id)))?;

    let message = if state.allocator.cancel(id)? {
        "Reservation cancelled".to_string()
    } else {
        format!("Reservation already {}", reservation.status.as_str())
    };
    Ok(Json(ActionResponse {
        success: true,
        message,
        approval: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::state;
    use axum::http::StatusCode;
    use paysync_core::models::ApprovalMode;
    use paysync_core::money::Amount;

    fn request(base: &str) -> Json<GenerateAmountRequest> {
        Json(GenerateAmountRequest {
            base_amount: Amount::parse(base).unwrap(),
            expiry_minutes: None,
            order_id: None,
        })
    }

    #[tokio::test]
    async fn issues_suffixed_amounts_until_exhausted() {
        let mut config = (*state(ApprovalMode::Auto).config).clone();
        config.max_suffix = 2;
        let state = AppState::new(config, crate::storage::ServerStorage::in_memory().unwrap());

        let Json(first) = generate_amount(State(state.clone()), request("500")).await.unwrap();
        assert_eq!(first.unique_amount, Amount::parse("500.01").unwrap());
        assert!(first.expires_at > chrono::Utc::now());

        let Json(second) = generate_amount(State(state.clone()), request("500")).await.unwrap();
        assert_eq!(second.unique_amount, Amount::parse("500.02").unwrap());

        let err = generate_amount(State(state.clone()), request("500")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        // Cancelling frees the suffix for the next checkout
        let Json(resp) = cancel_amount(State(state.clone()), Path(first.reservation_id))
            .await
            .unwrap();
        assert_eq!(resp.message, "Reservation cancelled");
        let Json(again) = generate_amount(State(state.clone()), request("500")).await.unwrap();
        assert_eq!(again.unique_amount, Amount::parse("500.01").unwrap());
    }

    #[tokio::test]
    async fn cancel_unknown_reservation() {
        let state = state(ApprovalMode::Auto);
        let err = cancel_amount(State(state), Path(7)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
