//! Orphan transactions: payments the device saw before any order matched them.
//!
//! An orphan stays `PENDING` until a later-synced order claims it
//! (`MATCHED`), the user handles it (`MANUALLY_RESOLVED` / `IGNORED`), or the
//! retention sweep expires it.

use crate::models::{CaptureSource, Confidence, Direction, Transaction};
use crate::money::Amount;
use crate::store::{bad_column, LocalStore};
use crate::{now_ms, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Half-width of the window used to prefer orphans observed near the order's
/// creation time.
pub const TIME_WINDOW_MS: i64 = 30 * 60 * 1000;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrphanStatus {
    Pending,
    Matched,
    ManuallyResolved,
    Ignored,
    Expired,
}

impl OrphanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Matched => "MATCHED",
            Self::ManuallyResolved => "MANUALLY_RESOLVED",
            Self::Ignored => "IGNORED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "MATCHED" => Some(Self::Matched),
            "MANUALLY_RESOLVED" | "RESOLVED" => Some(Self::ManuallyResolved),
            "IGNORED" => Some(Self::Ignored),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A stored orphan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanTransaction {
    pub id: i64,
    pub transaction: Transaction,
    pub status: OrphanStatus,
    pub matched_order_id: Option<String>,
    pub matched_server_id: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Which lookup strategy produced a match. Earlier strategies are stricter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    BankAndAmount,
    Amount,
    FuzzyAmount,
}

impl MatchStrategy {
    pub fn confidence(&self) -> Confidence {
        match self {
            Self::BankAndAmount => Confidence::High,
            Self::Amount => Confidence::Medium,
            Self::FuzzyAmount => Confidence::Ambiguous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanMatch {
    pub orphan: OrphanTransaction,
    pub strategy: MatchStrategy,
}

/// Retention windows for the cleanup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrphanRetention {
    /// PENDING orphans older than this become EXPIRED.
    pub expire_after: Duration,
    /// EXPIRED/MATCHED/IGNORED orphans older than this are deleted.
    pub purge_after: Duration,
}

impl Default for OrphanRetention {
    fn default() -> Self {
        Self::from_days(7, 30)
    }
}

impl OrphanRetention {
    pub fn from_days(expire_days: u64, purge_days: u64) -> Self {
        Self {
            expire_after: Duration::from_millis(expire_days * DAY_MS as u64),
            purge_after: Duration::from_millis(purge_days * DAY_MS as u64),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: usize,
    pub purged: usize,
}

const SELECT_COLUMNS: &str = "id, transaction_id, bank_code, direction, amount_minor,
    account_fragment, counterparty, reference, observed_at_ms, source, status,
    matched_order_id, matched_server_id, created_at_ms, updated_at_ms";

fn row_to_orphan(row: &Row<'_>) -> rusqlite::Result<OrphanTransaction> {
    let tx_id: String = row.get(1)?;
    let direction: String = row.get(3)?;
    let source: String = row.get(9)?;
    let status: String = row.get(10)?;

    let transaction = Transaction {
        id: Uuid::parse_str(&tx_id).map_err(|_| bad_column(1, "transaction id", &tx_id))?,
        bank_code: row.get(2)?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| bad_column(3, "direction", &direction))?,
        amount: Amount::from_minor(row.get(4)?),
        account_fragment: row.get(5)?,
        counterparty: row.get(6)?,
        reference: row.get(7)?,
        observed_at_ms: row.get(8)?,
        source: CaptureSource::parse(&source).ok_or_else(|| bad_column(9, "source", &source))?,
    };

    Ok(OrphanTransaction {
        id: row.get(0)?,
        transaction,
        status: OrphanStatus::parse(&status).ok_or_else(|| bad_column(10, "status", &status))?,
        matched_order_id: row.get(11)?,
        matched_server_id: row.get(12)?,
        created_at_ms: row.get(13)?,
        updated_at_ms: row.get(14)?,
    })
}

/// Device-side store of unmatched transactions.
#[derive(Clone)]
pub struct OrphanStore {
    store: LocalStore,
}

impl OrphanStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Stores `tx` as a PENDING orphan. Returns false when the same
    /// transaction was already stored.
    pub fn save_orphan(&self, tx: &Transaction) -> Result<bool> {
        self.save_orphan_at(tx, now_ms())
    }

    pub fn save_orphan_at(&self, tx: &Transaction, now_ms: i64) -> Result<bool> {
        let tx = tx.clone().normalized();
        let conn = self.store.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO orphan_transactions
                (transaction_id, bank_code, direction, amount_minor, account_fragment,
                 counterparty, reference, observed_at_ms, source, status,
                 created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'PENDING', ?10, ?10)",
            params![
                tx.id.to_string(),
                tx.bank_code,
                tx.direction.as_str(),
                tx.amount.minor(),
                tx.account_fragment,
                tx.counterparty,
                tx.reference,
                tx.observed_at_ms,
                tx.source.as_str(),
                now_ms,
            ],
        )?;

        if inserted == 1 {
            info!(transaction_id = %tx.id, amount = %tx.amount, bank = %tx.bank_code, "Saved orphan transaction");
        } else {
            debug!(transaction_id = %tx.id, "Orphan already stored");
        }
        Ok(inserted == 1)
    }

    /// Finds the best PENDING orphan for an order.
    ///
    /// Strategies run in order and stop at the first that has any candidate:
    /// exact amount and bank (newest first), exact amount (closest to
    /// `order_created_at_ms` within the time window, else newest), then
    /// amount within one minor unit (closest amount first).
    pub fn find_match(
        &self,
        amount: Amount,
        bank: Option<&str>,
        order_created_at_ms: Option<i64>,
    ) -> Result<Option<OrphanMatch>> {
        let conn = self.store.conn()?;
        let minor = amount.minor();

        if let Some(bank) = bank.filter(|b| !b.trim().is_empty()) {
            let sql = format!(
                "SELECT {} FROM orphan_transactions
                 WHERE status = 'PENDING' AND amount_minor = ?1
                   AND UPPER(bank_code) = UPPER(?2)
                 ORDER BY observed_at_ms DESC, id DESC LIMIT 1",
                SELECT_COLUMNS
            );
            let hit = conn
                .query_row(&sql, params![minor, bank.trim()], row_to_orphan)
                .optional()?;
            if let Some(orphan) = hit {
                return Ok(Some(OrphanMatch {
                    orphan,
                    strategy: MatchStrategy::BankAndAmount,
                }));
            }
        }

        if let Some(created_at) = order_created_at_ms {
            let sql = format!(
                "SELECT {} FROM orphan_transactions
                 WHERE status = 'PENDING' AND amount_minor = ?1
                   AND ABS(observed_at_ms - ?2) <= ?3
                 ORDER BY ABS(observed_at_ms - ?2) ASC, observed_at_ms DESC, id DESC LIMIT 1",
                SELECT_COLUMNS
            );
            let hit = conn
                .query_row(&sql, params![minor, created_at, TIME_WINDOW_MS], row_to_orphan)
                .optional()?;
            if let Some(orphan) = hit {
                return Ok(Some(OrphanMatch {
                    orphan,
                    strategy: MatchStrategy::Amount,
                }));
            }
        }

        let sql = format!(
            "SELECT {} FROM orphan_transactions
             WHERE status = 'PENDING' AND amount_minor = ?1
             ORDER BY observed_at_ms DESC, id DESC LIMIT 1",
            SELECT_COLUMNS
        );
        if let Some(orphan) = conn.query_row(&sql, params![minor], row_to_orphan).optional()? {
            return Ok(Some(OrphanMatch {
                orphan,
                strategy: MatchStrategy::Amount,
            }));
        }

        let sql = format!(
            "SELECT {} FROM orphan_transactions
             WHERE status = 'PENDING' AND amount_minor BETWEEN ?1 AND ?2
             ORDER BY ABS(amount_minor - ?3) ASC, observed_at_ms DESC, id DESC LIMIT 1",
            SELECT_COLUMNS
        );
        let tolerance = Amount::TOLERANCE.minor();
        let hit = conn
            .query_row(
                &sql,
                params![minor.saturating_sub(tolerance), minor.saturating_add(tolerance), minor],
                row_to_orphan,
            )
            .optional()?;

        Ok(hit.map(|orphan| OrphanMatch {
            orphan,
            strategy: MatchStrategy::FuzzyAmount,
        }))
    }

    /// Claims a PENDING orphan for an order. Returns false if another caller
    /// already claimed it, or it is no longer PENDING.
    pub fn mark_matched(&self, orphan_id: i64, order_id: &str, server_id: &str) -> Result<bool> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE orphan_transactions
             SET status = 'MATCHED', matched_order_id = ?2, matched_server_id = ?3,
                 updated_at_ms = ?4
             WHERE id = ?1 AND status = 'PENDING'",
            params![orphan_id, order_id, server_id, now_ms()],
        )?;
        Ok(changed == 1)
    }

    /// Returns a claimed orphan to PENDING when the approval it was claimed
    /// for did not take.
    pub fn release(&self, orphan_id: i64) -> Result<bool> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE orphan_transactions
             SET status = 'PENDING', matched_order_id = NULL, matched_server_id = NULL,
                 updated_at_ms = ?2
             WHERE id = ?1 AND status = 'MATCHED'",
            params![orphan_id, now_ms()],
        )?;
        Ok(changed == 1)
    }

    /// `release` for the orphan holding transaction `tx_id`.
    pub fn release_transaction(&self, tx_id: &Uuid) -> Result<bool> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE orphan_transactions
             SET status = 'PENDING', matched_order_id = NULL, matched_server_id = NULL,
                 updated_at_ms = ?2
             WHERE transaction_id = ?1 AND status = 'MATCHED'",
            params![tx_id.to_string(), now_ms()],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_ignored(&self, orphan_id: i64) -> Result<bool> {
        self.close_pending(orphan_id, OrphanStatus::Ignored)
    }

    pub fn mark_resolved(&self, orphan_id: i64) -> Result<bool> {
        self.close_pending(orphan_id, OrphanStatus::ManuallyResolved)
    }

    fn close_pending(&self, orphan_id: i64, status: OrphanStatus) -> Result<bool> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE orphan_transactions SET status = ?2, updated_at_ms = ?3
             WHERE id = ?1 AND status = 'PENDING'",
            params![orphan_id, status.as_str(), now_ms()],
        )?;
        Ok(changed == 1)
    }

    pub fn get(&self, orphan_id: i64) -> Result<Option<OrphanTransaction>> {
        let conn = self.store.conn()?;
        let sql = format!("SELECT {} FROM orphan_transactions WHERE id = ?1", SELECT_COLUMNS);
        Ok(conn.query_row(&sql, [orphan_id], row_to_orphan).optional()?)
    }

    /// Lists orphans, newest observation first.
    pub fn list(&self, status: Option<OrphanStatus>) -> Result<Vec<OrphanTransaction>> {
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT {} FROM orphan_transactions
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY observed_at_ms DESC, id DESC",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([status.map(|s| s.as_str())], row_to_orphan)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Expires stale PENDING orphans, then purges old terminal ones.
    /// Age is measured from when the orphan was stored.
    pub fn cleanup(&self, retention: OrphanRetention, now_ms: i64) -> Result<CleanupReport> {
        let expire_cutoff = now_ms - retention.expire_after.as_millis() as i64;
        let purge_cutoff = now_ms - retention.purge_after.as_millis() as i64;

        let conn = self.store.conn()?;
        let expired = conn.execute(
            "UPDATE orphan_transactions SET status = 'EXPIRED', updated_at_ms = ?2
             WHERE status = 'PENDING' AND created_at_ms < ?1",
            params![expire_cutoff, now_ms],
        )?;
        let purged = conn.execute(
            "DELETE FROM orphan_transactions
             WHERE status IN ('EXPIRED', 'MATCHED', 'IGNORED') AND created_at_ms < ?1",
            [purge_cutoff],
        )?;

        if expired > 0 || purged > 0 {
            info!(expired, purged, "Orphan cleanup");
        }
        Ok(CleanupReport { expired, purged })
    }
}
