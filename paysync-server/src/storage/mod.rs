//! SQLite storage backend for the server.

pub mod approvals;
pub mod models;

use crate::error::ServerError;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe server storage.
#[derive(Clone)]
pub struct ServerStorage {
    conn: Arc<Mutex<Connection>>,
}

impl ServerStorage {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self, anyhow::Error> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                bank_code TEXT NOT NULL,
                direction TEXT NOT NULL,
                amount_minor INTEGER NOT NULL,
                observed_at_ms INTEGER NOT NULL,
                payload_json TEXT NOT NULL,
                approval_id INTEGER,
                received_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS suffix_reservations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                base_amount INTEGER NOT NULL,
                decimal_suffix INTEGER NOT NULL CHECK (decimal_suffix BETWEEN 1 AND 99),
                unique_amount_minor INTEGER NOT NULL,
                order_id TEXT,
                status TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                used_at_ms INTEGER
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_live
                ON suffix_reservations(base_amount, decimal_suffix)
                WHERE status = 'reserved';
            CREATE INDEX IF NOT EXISTS idx_reservations_amount
                ON suffix_reservations(unique_amount_minor, status);

            CREATE TABLE IF NOT EXISTS approvals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT,
                reservation_id INTEGER,
                amount_minor INTEGER NOT NULL,
                transaction_id TEXT,
                transaction_json TEXT,
                status TEXT NOT NULL,
                confidence TEXT,
                approved_by TEXT,
                reason TEXT,
                bank_hint TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                synced_version INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_approvals_version
                ON approvals(synced_version);
            CREATE INDEX IF NOT EXISTS idx_approvals_order
                ON approvals(order_id);

            CREATE TABLE IF NOT EXISTS version_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                current INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO version_counter (id, current) VALUES (1, 0);

            CREATE TABLE IF NOT EXISTS seen_nonces (
                device_id TEXT NOT NULL,
                nonce TEXT NOT NULL,
                seen_at_ms INTEGER NOT NULL,
                PRIMARY KEY (device_id, nonce)
            );
            CREATE INDEX IF NOT EXISTS idx_seen_nonces_seen_at
                ON seen_nonces(seen_at_ms);

            CREATE TABLE IF NOT EXISTS pending_orders (
                order_id TEXT PRIMARY KEY,
                total_minor INTEGER NOT NULL,
                bank_hint TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at_ms INTEGER NOT NULL,
                paid_at_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_pending_orders_total
                ON pending_orders(status, total_minor);",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ServerError> {
        self.conn
            .lock()
            .map_err(|e| ServerError::Internal(format!("Lock error: {}", e)))
    }
}

/// Allocate the next approval version. Every approval mutation takes one.
pub fn next_version(conn: &Connection) -> Result<i64, ServerError> {
    let version = conn.query_row(
        "UPDATE version_counter SET current = current + 1 WHERE id = 1 RETURNING current",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

pub fn current_version(conn: &Connection) -> Result<i64, ServerError> {
    let version = conn.query_row("SELECT current FROM version_counter WHERE id = 1", [], |row| {
        row.get(0)
    })?;
    Ok(version)
}
