//! Order registration, incremental sync and approve/reject.

use crate::auth::device_id;
use crate::error::ServerError;
use crate::state::AppState;
use crate::storage::{approvals, current_version};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use paysync_core::now_ms;
use paysync_core::protocol::{
    ActionResponse, ApproveRequest, RegisterOrderRequest, RejectRequest, SyncPullData,
    SyncPullResponse,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub since_version: i64,
    pub limit: Option<u32>,
}

pub async fn register_order(
    State(state): State<AppState>,
    Json(req): Json<RegisterOrderRequest>,
) -> Result<Json<ActionResponse>, ServerError> {
    let transition = state.matcher.register_order(&req, now_ms())?;
    let message = if transition.changed {
        "Order registered"
    } else {
        "Order already registered"
    };
    Ok(Json(ActionResponse {
        success: true,
        message: message.to_string(),
        approval: Some(transition.approval),
    }))
}

/// Approvals changed after `since_version`, ascending, one page at a time.
pub async fn sync(
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncPullResponse>, ServerError> {
    let limit = query
        .limit
        .unwrap_or(state.config.page_limit())
        .clamp(1, state.config.page_limit());

    let conn = state.storage.conn()?;
    let orders = approvals::list_since(&conn, query.since_version.max(0), limit)?;
    let latest_version = current_version(&conn)?;

    tracing::debug!(
        since_version = query.since_version,
        returned = orders.len(),
        latest_version,
        "Sync pull"
    );
    Ok(Json(SyncPullResponse {
        success: true,
        data: SyncPullData {
            orders,
            latest_version,
        },
    }))
}

/// The body is optional; an empty body is a manual approval.
pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ActionResponse>, ServerError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ApproveRequest::manual()
    } else {
        serde_json::from_slice::<ApproveRequest>(&body)
            .map_err(|e| ServerError::BadRequest(format!("Invalid approve request: {}", e)))?
    };
    if let Some(evidence) = &request.orphan {
        evidence
            .transaction
            .validate()
            .map_err(ServerError::BadRequest)?;
    }

    let actor = device_id(&headers).unwrap_or("api");
    let transition = state.matcher.approve(id, &request, actor)?;
    let message = if transition.changed {
        "Approval approved".to_string()
    } else {
        format!("Approval already {}", transition.approval.status.as_str())
    };
    Ok(Json(ActionResponse {
        success: true,
        message,
        approval: Some(transition.approval),
    }))
}

pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<ActionResponse>, ServerError> {
    let transition = state.matcher.reject(id, &req.reason)?;
    let message = if transition.changed {
        "Approval rejected".to_string()
    } else {
        format!("Approval already {}", transition.approval.status.as_str())
    };
    Ok(Json(ActionResponse {
        success: true,
        message,
        approval: Some(transition.approval),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::state;
    use paysync_core::models::{ApprovalMode, ApprovalStatus};
    use paysync_core::money::Amount;

    async fn register(state: &AppState, order_id: &str, total: &str) -> i64 {
        let Json(resp) = register_order(
            State(state.clone()),
            Json(RegisterOrderRequest {
                order_id: order_id.into(),
                total: Amount::parse(total).unwrap(),
                bank_hint: None,
            }),
        )
        .await
        .unwrap();
        resp.approval.unwrap().id
    }

    async fn pull(state: &AppState, since_version: i64, limit: Option<u32>) -> SyncPullData {
        let Json(resp) = sync(
            State(state.clone()),
            Query(SyncQuery {
                since_version,
                limit,
            }),
        )
        .await
        .unwrap();
        resp.data
    }

    #[tokio::test]
    async fn sync_pages_by_version() {
        let state = state(ApprovalMode::Auto);
        for i in 0..5 {
            register(&state, &format!("o-{}", i), "10.00").await;
        }

        let page = pull(&state, 0, Some(2)).await;
        assert_eq!(page.orders.len(), 2);
        assert_eq!(page.latest_version, 5);
        let cursor = page.orders.last().unwrap().synced_version;

        let rest = pull(&state, cursor, None).await;
        assert_eq!(rest.orders.len(), 3);
        assert!(rest.orders.iter().all(|o| o.synced_version > cursor));
        assert!(pull(&state, 5, None).await.orders.is_empty());
    }

    #[tokio::test]
    async fn register_is_idempotent_per_order() {
        let state = state(ApprovalMode::Auto);
        let first = register(&state, "o-1", "10.00").await;
        let second = register(&state, "o-1", "10.00").await;
        assert_eq!(first, second);
        assert_eq!(pull(&state, 0, None).await.orders.len(), 1);
    }

    #[tokio::test]
    async fn approve_twice_is_not_an_error() {
        let state = state(ApprovalMode::Auto);
        let id = register(&state, "o-1", "10.00").await;

        for _ in 0..2 {
            let Json(resp) = approve(State(state.clone()), Path(id), HeaderMap::new(), Bytes::new())
                .await
                .unwrap();
            assert!(resp.success);
            assert_eq!(resp.approval.unwrap().status, ApprovalStatus::ManuallyApproved);
        }

        let Json(resp) = reject(
            State(state.clone()),
            Path(id),
            Json(RejectRequest {
                reason: "too late".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.approval.unwrap().status, ApprovalStatus::ManuallyApproved);
    }

    #[tokio::test]
    async fn malformed_approve_body_and_unknown_ids() {
        let state = state(ApprovalMode::Auto);
        let id = register(&state, "o-1", "10.00").await;

        let err = approve(
            State(state.clone()),
            Path(id),
            HeaderMap::new(),
            Bytes::from_static(b"{not json"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));

        let err = approve(State(state.clone()), Path(404), HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }
}
