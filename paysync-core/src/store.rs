//! SQLite storage for device-local state.

use crate::DatabaseError;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Thread-safe device storage handle. Clones share one connection.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orphan_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transaction_id TEXT NOT NULL UNIQUE,
                bank_code TEXT NOT NULL,
                direction TEXT NOT NULL,
                amount_minor INTEGER NOT NULL,
                account_fragment TEXT,
                counterparty TEXT,
                reference TEXT,
                observed_at_ms INTEGER NOT NULL,
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                matched_order_id TEXT,
                matched_server_id TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS approvals (
                server_id TEXT NOT NULL,
                remote_id INTEGER NOT NULL,
                order_id TEXT,
                reservation_id INTEGER,
                amount_minor INTEGER NOT NULL,
                transaction_json TEXT,
                status TEXT NOT NULL,
                confidence TEXT,
                approved_by TEXT,
                reason TEXT,
                bank_hint TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                synced_version INTEGER NOT NULL,
                PRIMARY KEY (server_id, remote_id)
            );

            CREATE TABLE IF NOT EXISTS pending_actions (
                server_id TEXT NOT NULL,
                approval_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                PRIMARY KEY (server_id, approval_id)
            );

            CREATE TABLE IF NOT EXISTS sync_cursors (
                server_id TEXT PRIMARY KEY,
                last_synced_version INTEGER NOT NULL DEFAULT 0,
                last_sync_at_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_orphans_status_amount
                ON orphan_transactions(status, amount_minor);
            CREATE INDEX IF NOT EXISTS idx_orphans_created
                ON orphan_transactions(created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_approvals_status
                ON approvals(server_id, status);",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn
            .lock()
            .map_err(|e| DatabaseError::LockPoisoned(format!("local store: {}", e)))
    }
}

/// Builds a column conversion error for a stored enum string that no longer
/// parses.
pub(crate) fn bad_column(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {} {:?}", what, value).into(),
    )
}
