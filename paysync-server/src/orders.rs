//! The order book: pending-order totals for fallback matching and the
//! "mark paid" callback fired when an approval settles.

use crate::error::ServerError;
use crate::storage::models::PendingOrder;
use crate::storage::ServerStorage;
use paysync_core::money::Amount;
use rusqlite::params;
use tracing::info;

/// The upstream order subsystem as the matcher sees it.
pub trait OrderBook: Send + Sync {
    /// Pending orders whose total is within `tolerance` of `amount`, oldest first.
    fn pending_with_total(
        &self,
        amount: Amount,
        tolerance: Amount,
    ) -> Result<Vec<PendingOrder>, ServerError>;

    /// Returns false when the order was already known.
    fn register(&self, order: &PendingOrder) -> Result<bool, ServerError>;

    fn mark_paid(&self, order_id: &str, paid_at_ms: i64) -> Result<(), ServerError>;
}

/// Order book kept in the server database.
#[derive(Clone)]
pub struct SqliteOrderBook {
    storage: ServerStorage,
}

impl SqliteOrderBook {
    pub fn new(storage: ServerStorage) -> Self {
        Self { storage }
    }

    pub fn is_paid(&self, order_id: &str) -> Result<bool, ServerError> {
        let conn = self.storage.conn()?;
        let paid = conn.query_row(
            "SELECT COUNT(*) FROM pending_orders WHERE order_id = ?1 AND status = 'paid'",
            params![order_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(paid > 0)
    }
}

impl OrderBook for SqliteOrderBook {
    fn pending_with_total(
        &self,
        amount: Amount,
        tolerance: Amount,
    ) -> Result<Vec<PendingOrder>, ServerError> {
        let conn = self.storage.conn()?;
        let mut stmt = conn.prepare(
            "SELECT order_id, total_minor, bank_hint, created_at_ms FROM pending_orders
             WHERE status = 'pending' AND total_minor BETWEEN ?1 AND ?2
             ORDER BY created_at_ms ASC, order_id ASC",
        )?;
        let rows = stmt.query_map(
            params![
                amount.minor().saturating_sub(tolerance.minor()),
                amount.minor().saturating_add(tolerance.minor())
            ],
            |row| {
                Ok(PendingOrder {
                    order_id: row.get(0)?,
                    total: Amount::from_minor(row.get(1)?),
                    bank_hint: row.get(2)?,
                    created_at_ms: row.get(3)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn register(&self, order: &PendingOrder) -> Result<bool, ServerError> {
        let conn = self.storage.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO pending_orders (order_id, total_minor, bank_hint, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                order.order_id,
                order.total.minor(),
                order.bank_hint,
                order.created_at_ms
            ],
        )?;
        Ok(inserted == 1)
    }

    fn mark_paid(&self, order_id: &str, paid_at_ms: i64) -> Result<(), ServerError> {
        let conn = self.storage.conn()?;
        let changed = conn.execute(
            "UPDATE pending_orders SET status = 'paid', paid_at_ms = ?2
             WHERE order_id = ?1 AND status = 'pending'",
            params![order_id, paid_at_ms],
        )?;
        if changed == 1 {
            info!(order_id, "Order marked paid");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: &str, total: &str, created_at_ms: i64) -> PendingOrder {
        PendingOrder {
            order_id: id.to_string(),
            total: Amount::parse(total).unwrap(),
            bank_hint: None,
            created_at_ms,
        }
    }

    #[test]
    fn totals_match_within_tolerance_oldest_first() {
        let book = SqliteOrderBook::new(ServerStorage::in_memory().unwrap());
        assert!(book.register(&order("b", "100.01", 2)).unwrap());
        assert!(book.register(&order("a", "100.00", 1)).unwrap());
        assert!(book.register(&order("c", "100.02", 3)).unwrap());
        assert!(!book.register(&order("a", "100.00", 1)).unwrap());

        let hits = book
            .pending_with_total(Amount::parse("100.00").unwrap(), Amount::TOLERANCE)
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let exact = book
            .pending_with_total(Amount::parse("100.02").unwrap(), Amount::ZERO)
            .unwrap();
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn extreme_amounts_do_not_overflow_the_range() {
        let book = SqliteOrderBook::new(ServerStorage::in_memory().unwrap());
        book.register(&order("a", "20.00", 1)).unwrap();
        assert!(book
            .pending_with_total(Amount::from_minor(i64::MAX), Amount::TOLERANCE)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn paid_orders_leave_the_book() {
        let book = SqliteOrderBook::new(ServerStorage::in_memory().unwrap());
        book.register(&order("a", "20.00", 1)).unwrap();
        book.mark_paid("a", 5).unwrap();
        assert!(book.is_paid("a").unwrap());
        assert!(book
            .pending_with_total(Amount::parse("20.00").unwrap(), Amount::TOLERANCE)
            .unwrap()
            .is_empty());
    }
}
