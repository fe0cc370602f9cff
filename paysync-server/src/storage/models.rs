//! Server storage model types and row mappers.

use paysync_core::models::{ApprovalRecord, ApprovalStatus, Confidence, Transaction};
use paysync_core::money::Amount;
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Reserved,
    Used,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Used => "used",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(Self::Reserved),
            "used" => Some(Self::Used),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReservation {
    pub id: i64,
    pub base_amount: i64,
    pub decimal_suffix: u8,
    pub unique_amount: Amount,
    pub order_id: Option<String>,
    pub status: ReservationStatus,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub used_at_ms: Option<i64>,
}

pub const RESERVATION_COLUMNS: &str = "id, base_amount, decimal_suffix, unique_amount_minor, \
     order_id, status, created_at_ms, expires_at_ms, used_at_ms";

impl StoredReservation {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            base_amount: row.get(1)?,
            decimal_suffix: row.get(2)?,
            unique_amount: Amount::from_minor(row.get(3)?),
            order_id: row.get(4)?,
            status: ReservationStatus::parse(&status).ok_or_else(|| bad_column(5, &status))?,
            created_at_ms: row.get(6)?,
            expires_at_ms: row.get(7)?,
            used_at_ms: row.get(8)?,
        })
    }
}

pub const APPROVAL_COLUMNS: &str = "id, order_id, reservation_id, amount_minor, transaction_json, \
     status, confidence, approved_by, reason, bank_hint, created_at_ms, updated_at_ms, \
     synced_version";

pub fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalRecord> {
    let transaction_json: Option<String> = row.get(4)?;
    let transaction = match transaction_json {
        Some(json) => Some(
            serde_json::from_str::<Transaction>(&json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        ),
        None => None,
    };
    let status: String = row.get(5)?;
    let confidence: Option<String> = row.get(6)?;
    let confidence = match confidence {
        Some(c) => Some(Confidence::parse(&c).ok_or_else(|| bad_column(6, &c))?),
        None => None,
    };

    Ok(ApprovalRecord {
        id: row.get(0)?,
        order_id: row.get(1)?,
        reservation_id: row.get(2)?,
        amount: Amount::from_minor(row.get(3)?),
        transaction,
        status: ApprovalStatus::parse(&status).ok_or_else(|| bad_column(5, &status))?,
        confidence,
        approved_by: row.get(7)?,
        reason: row.get(8)?,
        bank_hint: row.get(9)?,
        created_at_ms: row.get(10)?,
        updated_at_ms: row.get(11)?,
        synced_version: row.get(12)?,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub order_id: String,
    pub total: Amount,
    pub bank_hint: Option<String>,
    pub created_at_ms: i64,
}

fn bad_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value {:?}", value).into(),
    )
}
