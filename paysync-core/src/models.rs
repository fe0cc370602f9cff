//! Domain model shared by the device and the server.

use crate::money::Amount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a bank transfer as seen from the merchant account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "CREDIT",
            Self::Debit => "DEBIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREDIT" => Some(Self::Credit),
            "DEBIT" => Some(Self::Debit),
            _ => None,
        }
    }
}

/// Where the device observed the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureSource {
    Sms,
    Notification,
}

impl CaptureSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "SMS",
            Self::Notification => "NOTIFICATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SMS" => Some(Self::Sms),
            "NOTIFICATION" => Some(Self::Notification),
            _ => None,
        }
    }
}

/// A payment event observed on the device, already parsed upstream.
///
/// `id` is a deterministic fingerprint of the payment fields, so the same
/// SMS captured twice produces the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub id: Uuid,
    pub bank_code: String,
    pub direction: Direction,
    pub amount: Amount,
    #[serde(default)]
    pub account_fragment: Option<String>,
    #[serde(default)]
    pub counterparty: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    /// Device clock, milliseconds since the Unix epoch.
    pub observed_at_ms: i64,
    pub source: CaptureSource,
}

impl Transaction {
    pub fn new(
        bank_code: impl Into<String>,
        direction: Direction,
        amount: Amount,
        observed_at_ms: i64,
        source: CaptureSource,
    ) -> Self {
        let mut tx = Self {
            id: Uuid::nil(),
            bank_code: bank_code.into(),
            direction,
            amount,
            account_fragment: None,
            counterparty: None,
            reference: None,
            observed_at_ms,
            source,
        };
        tx.id = tx.fingerprint();
        tx
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self.id = self.fingerprint();
        self
    }

    pub fn with_counterparty(mut self, counterparty: impl Into<String>) -> Self {
        self.counterparty = Some(counterparty.into());
        self
    }

    pub fn with_account_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.account_fragment = Some(fragment.into());
        self
    }

    /// UUIDv5 over the fields that identify one real-world payment.
    pub fn fingerprint(&self) -> Uuid {
        let name = format!(
            "{}|{}|{}|{}|{}|{}",
            self.bank_code.to_ascii_uppercase(),
            self.direction.as_str(),
            self.amount.minor(),
            self.reference.as_deref().unwrap_or(""),
            self.observed_at_ms,
            self.source.as_str(),
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    /// Fills in the fingerprint when upstream supplied no id.
    pub fn normalized(mut self) -> Self {
        if self.id.is_nil() {
            self.id = self.fingerprint();
        }
        self
    }

    pub fn is_credit(&self) -> bool {
        self.direction == Direction::Credit
    }

    /// Field-level validation of an inbound transaction.
    pub fn validate(&self) -> Result<(), String> {
        if self.bank_code.trim().is_empty() {
            return Err("bank_code is required".to_string());
        }
        if !self.amount.is_positive() {
            return Err(format!("amount must be positive, got {}", self.amount));
        }
        if self.observed_at_ms <= 0 {
            return Err("observed_at_ms must be a positive epoch timestamp".to_string());
        }
        Ok(())
    }
}

/// Review status of an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    PendingReview,
    AutoApproved,
    ManuallyApproved,
    Rejected,
    Expired,
    Cancelled,
    Deleted,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "PENDING_REVIEW",
            Self::AutoApproved => "AUTO_APPROVED",
            Self::ManuallyApproved => "MANUALLY_APPROVED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
            Self::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_REVIEW" => Some(Self::PendingReview),
            "AUTO_APPROVED" => Some(Self::AutoApproved),
            "MANUALLY_APPROVED" => Some(Self::ManuallyApproved),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            "CANCELLED" => Some(Self::Cancelled),
            "DELETED" => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::PendingReview)
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::AutoApproved | Self::ManuallyApproved)
    }
}

/// How sure the matcher is about an order/transaction pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    High,
    Medium,
    Ambiguous,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Ambiguous => "AMBIGUOUS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "AMBIGUOUS" => Some(Self::Ambiguous),
            _ => None,
        }
    }
}

/// Whether matches are approved without a human in the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    #[default]
    Auto,
    Manual,
}

/// An approval as exposed by the sync protocol.
///
/// An approval with no transaction attached is an order still waiting for
/// its payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: i64,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub reservation_id: Option<i64>,
    /// Expected order amount (the unique amount when one was reserved).
    pub amount: Amount,
    #[serde(default)]
    pub transaction: Option<Transaction>,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub bank_hint: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub synced_version: i64,
}
