//! Local mirror of server approvals, keyed by (server id, remote id).

use crate::models::{ApprovalRecord, ApprovalStatus, Confidence, Transaction};
use crate::money::Amount;
use crate::store::{bad_column, LocalStore};
use crate::{now_ms, DatabaseError, Result};
use rusqlite::{params, OptionalExtension, Row};

const SELECT_COLUMNS: &str = "remote_id, order_id, reservation_id, amount_minor, transaction_json,
    status, confidence, approved_by, reason, bank_hint, created_at_ms, updated_at_ms,
    synced_version";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ApprovalRecord> {
    let tx_json: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    let confidence: Option<String> = row.get(6)?;

    let transaction = match tx_json {
        Some(json) => Some(
            serde_json::from_str::<Transaction>(&json)
                .map_err(|_| bad_column(4, "transaction", &json))?,
        ),
        None => None,
    };
    let confidence = match confidence {
        Some(c) => Some(Confidence::parse(&c).ok_or_else(|| bad_column(6, "confidence", &c))?),
        None => None,
    };

    Ok(ApprovalRecord {
        id: row.get(0)?,
        order_id: row.get(1)?,
        reservation_id: row.get(2)?,
        amount: Amount::from_minor(row.get(3)?),
        transaction,
        status: ApprovalStatus::parse(&status).ok_or_else(|| bad_column(5, "status", &status))?,
        confidence,
        approved_by: row.get(7)?,
        reason: row.get(8)?,
        bank_hint: row.get(9)?,
        created_at_ms: row.get(10)?,
        updated_at_ms: row.get(11)?,
        synced_version: row.get(12)?,
    })
}

#[derive(Clone)]
pub struct ApprovalMirror {
    store: LocalStore,
}

impl ApprovalMirror {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Insert or overwrite the local copy of a server approval.
    pub fn upsert(&self, server_id: &str, record: &ApprovalRecord) -> Result<()> {
        let tx_json = record
            .transaction
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO approvals (server_id, remote_id, order_id, reservation_id, amount_minor,
                transaction_json, status, confidence, approved_by, reason, bank_hint,
                created_at_ms, updated_at_ms, synced_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(server_id, remote_id) DO UPDATE SET
                order_id = excluded.order_id,
                reservation_id = excluded.reservation_id,
                amount_minor = excluded.amount_minor,
                transaction_json = excluded.transaction_json,
                status = excluded.status,
                confidence = excluded.confidence,
                approved_by = excluded.approved_by,
                reason = excluded.reason,
                bank_hint = excluded.bank_hint,
                created_at_ms = excluded.created_at_ms,
                updated_at_ms = excluded.updated_at_ms,
                synced_version = excluded.synced_version",
            params![
                server_id,
                record.id,
                record.order_id,
                record.reservation_id,
                record.amount.minor(),
                tx_json,
                record.status.as_str(),
                record.confidence.map(|c| c.as_str()),
                record.approved_by,
                record.reason,
                record.bank_hint,
                record.created_at_ms,
                record.updated_at_ms,
                record.synced_version,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, server_id: &str, remote_id: i64) -> Result<Option<ApprovalRecord>> {
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT {} FROM approvals WHERE server_id = ?1 AND remote_id = ?2",
            SELECT_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![server_id, remote_id], row_to_record)
            .optional()?)
    }

    /// Locally reflect a user decision that has not reached the server yet.
    pub fn set_status(
        &self,
        server_id: &str,
        remote_id: i64,
        status: ApprovalStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE approvals SET status = ?3, reason = COALESCE(?4, reason), updated_at_ms = ?5
             WHERE server_id = ?1 AND remote_id = ?2",
            params![server_id, remote_id, status.as_str(), reason, now_ms()],
        )?;
        Ok(changed == 1)
    }

    /// Approvals still waiting for a payment: in review, no transaction
    /// attached and no local action queued. Oldest first.
    pub fn awaiting_payment(&self, server_id: &str) -> Result<Vec<ApprovalRecord>> {
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT {} FROM approvals a
             WHERE a.server_id = ?1 AND a.status = ?2 AND a.transaction_json IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM pending_actions p
                   WHERE p.server_id = a.server_id AND p.approval_id = a.remote_id
               )
             ORDER BY a.created_at_ms ASC, a.remote_id ASC",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![server_id, ApprovalStatus::PendingReview.as_str()],
                row_to_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All mirrored approvals for a server, ascending by version.
    pub fn list(&self, server_id: &str) -> Result<Vec<ApprovalRecord>> {
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT {} FROM approvals WHERE server_id = ?1 ORDER BY synced_version ASC",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([server_id], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
