//! Offline action queue.
//!
//! A pending action records the user's approve/reject intent for an approval
//! whose server call could not be delivered. It is replayed every sync cycle
//! until the server confirms it, and while it exists the local state of that
//! approval wins over anything pulled from the server.

use crate::protocol::ApproveRequest;
use crate::store::{bad_column, LocalStore};
use crate::{now_ms, DatabaseError, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueuedAction {
    Approve(ApproveRequest),
    Reject { reason: String },
}

impl QueuedAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Approve(_) => "APPROVE",
            Self::Reject { .. } => "REJECT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub server_id: String,
    pub approval_id: i64,
    pub action: QueuedAction,
    pub created_at_ms: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<PendingAction> {
    let kind: String = row.get(2)?;
    let payload: String = row.get(3)?;
    let action: QueuedAction =
        serde_json::from_str(&payload).map_err(|_| bad_column(3, "queued action", &kind))?;
    Ok(PendingAction {
        server_id: row.get(0)?,
        approval_id: row.get(1)?,
        action,
        created_at_ms: row.get(4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
    })
}

const SELECT_COLUMNS: &str =
    "server_id, approval_id, kind, payload, created_at_ms, attempts, last_error";

#[derive(Clone)]
pub struct ActionQueue {
    store: LocalStore,
}

impl ActionQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Queue an action. A later intent for the same approval replaces the
    /// earlier one.
    pub fn enqueue(&self, server_id: &str, approval_id: i64, action: &QueuedAction) -> Result<()> {
        let payload = serde_json::to_string(action)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO pending_actions (server_id, approval_id, kind, payload, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(server_id, approval_id) DO UPDATE SET
                kind = excluded.kind,
                payload = excluded.payload,
                created_at_ms = excluded.created_at_ms,
                attempts = 0,
                last_error = NULL",
            params![server_id, approval_id, action.kind(), payload, now_ms()],
        )?;
        Ok(())
    }

    pub fn get(&self, server_id: &str, approval_id: i64) -> Result<Option<PendingAction>> {
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT {} FROM pending_actions WHERE server_id = ?1 AND approval_id = ?2",
            SELECT_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![server_id, approval_id], row_to_action)
            .optional()?)
    }

    pub fn has_pending(&self, server_id: &str, approval_id: i64) -> Result<bool> {
        let conn = self.store.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pending_actions WHERE server_id = ?1 AND approval_id = ?2)",
            params![server_id, approval_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Actions for one server, oldest first.
    pub fn pending(&self, server_id: &str) -> Result<Vec<PendingAction>> {
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT {} FROM pending_actions WHERE server_id = ?1
             ORDER BY created_at_ms ASC, approval_id ASC",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([server_id], row_to_action)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn all(&self) -> Result<Vec<PendingAction>> {
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT {} FROM pending_actions ORDER BY server_id, created_at_ms ASC",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_action)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn clear(&self, server_id: &str, approval_id: i64) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "DELETE FROM pending_actions WHERE server_id = ?1 AND approval_id = ?2",
            params![server_id, approval_id],
        )?;
        Ok(())
    }

    pub fn record_failure(&self, server_id: &str, approval_id: i64, error: &str) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE pending_actions SET attempts = attempts + 1, last_error = ?3
             WHERE server_id = ?1 AND approval_id = ?2",
            params![server_id, approval_id, error],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> ActionQueue {
        ActionQueue::new(LocalStore::in_memory().unwrap())
    }

    #[test]
    fn enqueue_replaces_previous_intent() {
        let q = queue();
        q.enqueue("shop", 7, &QueuedAction::Approve(ApproveRequest::manual()))
            .unwrap();
        q.record_failure("shop", 7, "timeout").unwrap();
        q.enqueue(
            "shop",
            7,
            &QueuedAction::Reject {
                reason: "duplicate".into(),
            },
        )
        .unwrap();

        let action = q.get("shop", 7).unwrap().unwrap();
        assert_eq!(action.action.kind(), "REJECT");
        assert_eq!(action.attempts, 0);
        assert!(action.last_error.is_none());
        assert_eq!(q.pending("shop").unwrap().len(), 1);
    }

    #[test]
    fn actions_are_scoped_per_server() {
        let q = queue();
        q.enqueue("a", 1, &QueuedAction::Approve(ApproveRequest::manual()))
            .unwrap();
        q.enqueue("b", 1, &QueuedAction::Approve(ApproveRequest::manual()))
            .unwrap();

        assert!(q.has_pending("a", 1).unwrap());
        q.clear("a", 1).unwrap();
        assert!(!q.has_pending("a", 1).unwrap());
        assert!(q.has_pending("b", 1).unwrap());
        assert_eq!(q.all().unwrap().len(), 1);
    }

    #[test]
    fn failures_are_counted() {
        let q = queue();
        q.enqueue("shop", 3, &QueuedAction::Approve(ApproveRequest::manual()))
            .unwrap();
        q.record_failure("shop", 3, "connection refused").unwrap();
        q.record_failure("shop", 3, "timeout").unwrap();

        let action = q.get("shop", 3).unwrap().unwrap();
        assert_eq!(action.attempts, 2);
        assert_eq!(action.last_error.as_deref(), Some("timeout"));
    }
}
