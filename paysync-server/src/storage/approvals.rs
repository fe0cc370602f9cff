//! Approval and transaction queries. Every function runs on a connection the
//! caller already holds, so multi-statement updates stay atomic.

use super::models::{approval_from_row, APPROVAL_COLUMNS};
use super::next_version;
use crate::error::ServerError;
use paysync_core::models::{ApprovalRecord, ApprovalStatus, Confidence, Transaction};
use paysync_core::money::Amount;
use paysync_core::protocol::{ApprovalSource, ApproveRequest};
use rusqlite::{params, Connection, OptionalExtension};

/// `approved_by` for approvals nobody reviewed.
pub const SYSTEM_ACTOR: &str = "system";

/// Result of a state transition. `changed` is false for idempotent replays.
#[derive(Debug, Clone)]
pub struct Transition {
    pub approval: ApprovalRecord,
    pub changed: bool,
}

pub struct NewApproval<'a> {
    pub order_id: Option<&'a str>,
    pub reservation_id: Option<i64>,
    pub amount: Amount,
    pub transaction: Option<&'a Transaction>,
    pub status: ApprovalStatus,
    pub confidence: Option<Confidence>,
    pub approved_by: Option<&'a str>,
    pub bank_hint: Option<&'a str>,
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<ApprovalRecord>, ServerError> {
    let approval = conn
        .query_row(
            &format!("SELECT {} FROM approvals WHERE id = ?1", APPROVAL_COLUMNS),
            params![id],
            approval_from_row,
        )
        .optional()?;
    Ok(approval)
}

pub fn for_order(conn: &Connection, order_id: &str) -> Result<Option<ApprovalRecord>, ServerError> {
    let approval = conn
        .query_row(
            &format!(
                "SELECT {} FROM approvals WHERE order_id = ?1 ORDER BY id ASC LIMIT 1",
                APPROVAL_COLUMNS
            ),
            params![order_id],
            approval_from_row,
        )
        .optional()?;
    Ok(approval)
}

/// The order's approval if it is still waiting for a payment.
pub fn awaiting_for_order(
    conn: &Connection,
    order_id: &str,
) -> Result<Option<ApprovalRecord>, ServerError> {
    let approval = conn
        .query_row(
            &format!(
                "SELECT {} FROM approvals
                 WHERE order_id = ?1 AND status = 'PENDING_REVIEW' AND transaction_json IS NULL
                 ORDER BY id ASC LIMIT 1",
                APPROVAL_COLUMNS
            ),
            params![order_id],
            approval_from_row,
        )
        .optional()?;
    Ok(approval)
}

/// Whether a live approval already pairs a payment with this order.
pub fn order_claimed(conn: &Connection, order_id: &str) -> Result<bool, ServerError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM approvals
         WHERE order_id = ?1 AND transaction_json IS NOT NULL
           AND status IN ('PENDING_REVIEW', 'AUTO_APPROVED', 'MANUALLY_APPROVED')",
        params![order_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn insert(
    conn: &Connection,
    new: NewApproval<'_>,
    now_ms: i64,
) -> Result<ApprovalRecord, ServerError> {
    let transaction_json = new.transaction.map(serde_json::to_string).transpose()?;
    let version = next_version(conn)?;
    conn.execute(
        "INSERT INTO approvals
            (order_id, reservation_id, amount_minor, transaction_id, transaction_json, status,
             confidence, approved_by, bank_hint, created_at_ms, updated_at_ms, synced_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11)",
        params![
            new.order_id,
            new.reservation_id,
            new.amount.minor(),
            new.transaction.map(|tx| tx.id.to_string()),
            transaction_json,
            new.status.as_str(),
            new.confidence.map(|c| c.as_str()),
            new.approved_by,
            new.bank_hint,
            now_ms,
            version,
        ],
    )?;
    let id = conn.last_insert_rowid();
    get(conn, id)?.ok_or_else(|| ServerError::Internal(format!("approval {} vanished", id)))
}

/// Pair a transaction with an approval that was waiting for one.
#[allow(clippy::too_many_arguments)]
pub fn attach(
    conn: &Connection,
    id: i64,
    tx: &Transaction,
    reservation_id: Option<i64>,
    status: ApprovalStatus,
    confidence: Confidence,
    approved_by: Option<&str>,
    now_ms: i64,
) -> Result<ApprovalRecord, ServerError> {
    let version = next_version(conn)?;
    conn.execute(
        "UPDATE approvals SET
            transaction_id = ?2, transaction_json = ?3,
            reservation_id = COALESCE(reservation_id, ?4),
            status = ?5, confidence = ?6, approved_by = ?7,
            updated_at_ms = ?8, synced_version = ?9
         WHERE id = ?1",
        params![
            id,
            tx.id.to_string(),
            serde_json::to_string(tx)?,
            reservation_id,
            status.as_str(),
            confidence.as_str(),
            approved_by,
            now_ms,
            version,
        ],
    )?;
    get(conn, id)?.ok_or_else(|| ServerError::NotFound(format!("approval {}", id)))
}

/// PENDING_REVIEW to an approved state. Anything else is returned unchanged.
pub fn approve(
    conn: &Connection,
    id: i64,
    request: &ApproveRequest,
    actor: &str,
    now_ms: i64,
) -> Result<Option<Transition>, ServerError> {
    let Some(current) = get(conn, id)? else {
        return Ok(None);
    };
    if current.status != ApprovalStatus::PendingReview {
        return Ok(Some(Transition {
            approval: current,
            changed: false,
        }));
    }

    let approved_by = match request.source {
        ApprovalSource::OrphanMatch => SYSTEM_ACTOR,
        ApprovalSource::Manual => actor,
    };
    let evidence = request.orphan.as_ref();
    let transaction_json = evidence
        .map(|e| serde_json::to_string(&e.transaction))
        .transpose()?;

    let version = next_version(conn)?;
    conn.execute(
        "UPDATE approvals SET
            status = ?2, approved_by = ?3,
            transaction_id = COALESCE(transaction_id, ?4),
            transaction_json = COALESCE(transaction_json, ?5),
            confidence = COALESCE(confidence, ?6),
            updated_at_ms = ?7, synced_version = ?8
         WHERE id = ?1 AND status = 'PENDING_REVIEW'",
        params![
            id,
            request.target_status().as_str(),
            approved_by,
            evidence.map(|e| e.transaction.id.to_string()),
            transaction_json,
            evidence.map(|e| e.confidence.as_str()),
            now_ms,
            version,
        ],
    )?;
    if let Some(e) = evidence {
        record_transaction(conn, &e.transaction, actor, Some(id), now_ms)?;
        link_transaction(conn, &e.transaction.id.to_string(), id)?;
    }

    let approval = get(conn, id)?.ok_or_else(|| ServerError::NotFound(format!("approval {}", id)))?;
    Ok(Some(Transition {
        approval,
        changed: true,
    }))
}

/// PENDING_REVIEW to REJECTED. Anything else is returned unchanged.
pub fn reject(
    conn: &Connection,
    id: i64,
    reason: &str,
    now_ms: i64,
) -> Result<Option<Transition>, ServerError> {
    let Some(current) = get(conn, id)? else {
        return Ok(None);
    };
    if current.status != ApprovalStatus::PendingReview {
        return Ok(Some(Transition {
            approval: current,
            changed: false,
        }));
    }

    let version = next_version(conn)?;
    conn.execute(
        "UPDATE approvals SET status = 'REJECTED', reason = ?2, updated_at_ms = ?3,
            synced_version = ?4
         WHERE id = ?1 AND status = 'PENDING_REVIEW'",
        params![id, reason, now_ms, version],
    )?;
    let approval = get(conn, id)?.ok_or_else(|| ServerError::NotFound(format!("approval {}", id)))?;
    Ok(Some(Transition {
        approval,
        changed: true,
    }))
}

/// Approvals changed after `since_version`, oldest change first.
pub fn list_since(
    conn: &Connection,
    since_version: i64,
    limit: u32,
) -> Result<Vec<ApprovalRecord>, ServerError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM approvals WHERE synced_version > ?1
         ORDER BY synced_version ASC LIMIT ?2",
        APPROVAL_COLUMNS
    ))?;
    let rows = stmt.query_map(params![since_version, limit], approval_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Store an inbound transaction. Returns false if it was already recorded.
pub fn record_transaction(
    conn: &Connection,
    tx: &Transaction,
    device_id: &str,
    approval_id: Option<i64>,
    now_ms: i64,
) -> Result<bool, ServerError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO transactions
            (id, device_id, bank_code, direction, amount_minor, observed_at_ms, payload_json,
             approval_id, received_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            tx.id.to_string(),
            device_id,
            tx.bank_code,
            tx.direction.as_str(),
            tx.amount.minor(),
            tx.observed_at_ms,
            serde_json::to_string(tx)?,
            approval_id,
            now_ms,
        ],
    )?;
    Ok(inserted == 1)
}

pub fn link_transaction(
    conn: &Connection,
    transaction_id: &str,
    approval_id: i64,
) -> Result<(), ServerError> {
    conn.execute(
        "UPDATE transactions SET approval_id = ?2 WHERE id = ?1",
        params![transaction_id, approval_id],
    )?;
    Ok(())
}

/// The approval a recorded transaction ended up in, if any.
pub fn for_transaction(
    conn: &Connection,
    transaction_id: &str,
) -> Result<Option<ApprovalRecord>, ServerError> {
    let approval = conn
        .query_row(
            &format!(
                "SELECT {} FROM approvals WHERE transaction_id = ?1 ORDER BY id ASC LIMIT 1",
                APPROVAL_COLUMNS
            ),
            params![transaction_id],
            approval_from_row,
        )
        .optional()?;
    Ok(approval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ServerStorage;
    use paysync_core::models::{CaptureSource, Direction};

    fn awaiting(conn: &Connection, order_id: &str) -> ApprovalRecord {
        insert(
            conn,
            NewApproval {
                order_id: Some(order_id),
                reservation_id: None,
                amount: Amount::parse("750.00").unwrap(),
                transaction: None,
                status: ApprovalStatus::PendingReview,
                confidence: None,
                approved_by: None,
                bank_hint: None,
            },
            1,
        )
        .unwrap()
    }

    #[test]
    fn approve_is_idempotent() {
        let storage = ServerStorage::in_memory().unwrap();
        let conn = storage.conn().unwrap();
        let a = awaiting(&conn, "o-1");

        let first = approve(&conn, a.id, &ApproveRequest::manual(), "dev-1", 2)
            .unwrap()
            .unwrap();
        assert!(first.changed);
        assert_eq!(first.approval.status, ApprovalStatus::ManuallyApproved);
        assert_eq!(first.approval.approved_by.as_deref(), Some("dev-1"));

        let second = approve(&conn, a.id, &ApproveRequest::manual(), "dev-1", 3)
            .unwrap()
            .unwrap();
        assert!(!second.changed);
        assert_eq!(second.approval.status, ApprovalStatus::ManuallyApproved);
        assert_eq!(second.approval.synced_version, first.approval.synced_version);

        // Reject after approve is a no-op too
        let rejected = reject(&conn, a.id, "late", 4).unwrap().unwrap();
        assert!(!rejected.changed);
        assert_eq!(rejected.approval.status, ApprovalStatus::ManuallyApproved);

        assert!(approve(&conn, 999, &ApproveRequest::manual(), "dev-1", 5)
            .unwrap()
            .is_none());
    }

    #[test]
    fn orphan_approval_attaches_evidence() {
        let storage = ServerStorage::in_memory().unwrap();
        let conn = storage.conn().unwrap();
        let a = awaiting(&conn, "o-1");
        let tx = Transaction::new(
            "BCA",
            Direction::Credit,
            Amount::parse("750.00").unwrap(),
            10,
            CaptureSource::Sms,
        );

        let t = approve(
            &conn,
            a.id,
            &ApproveRequest::from_orphan(tx.clone(), Confidence::Medium),
            "dev-1",
            2,
        )
        .unwrap()
        .unwrap();
        assert_eq!(t.approval.status, ApprovalStatus::AutoApproved);
        assert_eq!(t.approval.approved_by.as_deref(), Some(SYSTEM_ACTOR));
        assert_eq!(t.approval.confidence, Some(Confidence::Medium));
        assert_eq!(t.approval.transaction, Some(tx.clone()));
        assert!(order_claimed(&conn, "o-1").unwrap());
        assert_eq!(
            for_transaction(&conn, &tx.id.to_string()).unwrap().unwrap().id,
            a.id
        );
    }

    #[test]
    fn list_since_returns_latest_versions_in_order() {
        let storage = ServerStorage::in_memory().unwrap();
        let conn = storage.conn().unwrap();
        let a = awaiting(&conn, "o-1");
        let b = awaiting(&conn, "o-2");
        reject(&conn, a.id, "duplicate", 3).unwrap();

        let all = list_since(&conn, 0, 100).unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
        assert_eq!(all[1].reason.as_deref(), Some("duplicate"));

        let tail = list_since(&conn, all[0].synced_version, 100).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(list_since(&conn, 0, 1).unwrap().len(), 1);
    }
}
