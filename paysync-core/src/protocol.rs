//! Wire format for the device/server HTTP API and the realtime channel.

use crate::models::{ApprovalRecord, ApprovalStatus, Confidence, Transaction};
use crate::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HEADER_API_KEY: &str = "X-Api-Key";
pub const HEADER_DEVICE_ID: &str = "X-Device-Id";
pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const HEADER_NONCE: &str = "X-Nonce";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";

pub const PATH_NOTIFY: &str = "/api/v1/notify";
pub const PATH_ORDERS_SYNC: &str = "/api/v1/orders/sync";
pub const PATH_REALTIME: &str = "/api/v1/realtime";

/// Server cap on approvals returned by one sync pull.
pub const MAX_SYNC_PAGE: u32 = 100;

pub fn approve_path(approval_id: i64) -> String {
    format!("/api/v1/orders/{}/approve", approval_id)
}

pub fn reject_path(approval_id: i64) -> String {
    format!("/api/v1/orders/{}/reject", approval_id)
}

/// Body of a notification submission. `data` is `base64(iv || ciphertext || tag)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDetails {
    pub approval_id: i64,
    #[serde(default)]
    pub order_id: Option<String>,
    pub confidence: Confidence,
    pub status: ApprovalStatus,
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_details: Option<MatchDetails>,
}

impl NotifyResponse {
    pub fn is_matched(&self) -> bool {
        self.matched.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPullData {
    pub orders: Vec<ApprovalRecord>,
    pub latest_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPullResponse {
    pub success: bool,
    pub data: SyncPullData,
}

/// Who asked for an approval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalSource {
    #[default]
    Manual,
    /// The device paired a previously orphaned transaction with this order.
    OrphanMatch,
}

/// Transaction evidence carried by an orphan-sourced approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanEvidence {
    pub transaction: Transaction,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub source: ApprovalSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphan: Option<OrphanEvidence>,
}

impl ApproveRequest {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn from_orphan(transaction: Transaction, confidence: Confidence) -> Self {
        Self {
            source: ApprovalSource::OrphanMatch,
            orphan: Some(OrphanEvidence {
                transaction,
                confidence,
            }),
        }
    }

    /// Status this request moves a pending approval into.
    pub fn target_status(&self) -> ApprovalStatus {
        match self.source {
            ApprovalSource::Manual => ApprovalStatus::ManuallyApproved,
            ApprovalSource::OrphanMatch => ApprovalStatus::AutoApproved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: String,
}

/// Response to approve/reject. Both are idempotent, so `success` is true
/// even when the approval was already terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateAmountRequest {
    pub base_amount: Amount,
    #[serde(default)]
    pub expiry_minutes: Option<i64>,
    #[serde(default)]
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateAmountResponse {
    pub success: bool,
    pub reservation_id: i64,
    pub unique_amount: Amount,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterOrderRequest {
    pub order_id: String,
    pub total: Amount,
    #[serde(default)]
    pub bank_hint: Option<String>,
}

/// Frame on the realtime channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChannelFrame {
    pub const NEW_ORDER: &'static str = "new_order";
    pub const ORDER_UPDATE: &'static str = "order_update";
    pub const SYNC_REQUEST: &'static str = "sync_request";
    pub const PING: &'static str = "ping";

    pub fn new(kind: &str, data: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            timestamp: None,
        }
    }

    pub fn ping(timestamp_ms: i64) -> Self {
        Self {
            kind: Self::PING.to_string(),
            data: serde_json::Value::Null,
            timestamp: Some(timestamp_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_frame_shape() {
        let json = serde_json::to_value(ChannelFrame::ping(42)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping", "timestamp": 42}));
    }

    #[test]
    fn approve_request_defaults_to_manual() {
        let req: ApproveRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.source, ApprovalSource::Manual);
        assert_eq!(req.target_status(), ApprovalStatus::ManuallyApproved);
    }

    #[test]
    fn notify_response_without_match_fields() {
        let resp: NotifyResponse =
            serde_json::from_str(r#"{"success": true, "message": "recorded"}"#).unwrap();
        assert!(!resp.is_matched());
    }
}
