//! Unique-amount allocation.
//!
//! A checkout amount is the order's integer base plus a two-digit suffix
//! (500 becomes 500.01, 500.02, ...). The partial unique index on
//! `(base_amount, decimal_suffix) WHERE status = 'reserved'` is the claim: at
//! most one live reservation per suffix, whatever the number of writers.

use crate::error::ServerError;
use crate::storage::models::{ReservationStatus, StoredReservation, RESERVATION_COLUMNS};
use crate::storage::ServerStorage;
use paysync_core::money::Amount;
use paysync_core::now_ms;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Clone)]
pub struct SuffixAllocator {
    storage: ServerStorage,
    max_suffix: u8,
}

impl SuffixAllocator {
    pub fn new(storage: ServerStorage, max_suffix: u8) -> Self {
        Self {
            storage,
            max_suffix: max_suffix.clamp(1, 99),
        }
    }

    pub fn reserve(
        &self,
        base: Amount,
        expiry_minutes: i64,
        order_id: Option<&str>,
    ) -> Result<StoredReservation, ServerError> {
        self.reserve_at(base, expiry_minutes, order_id, now_ms())
    }

    /// Claim the lowest free suffix for the integer floor of `base`.
    pub fn reserve_at(
        &self,
        base: Amount,
        expiry_minutes: i64,
        order_id: Option<&str>,
        now_ms: i64,
    ) -> Result<StoredReservation, ServerError> {
        if expiry_minutes <= 0 {
            return Err(ServerError::BadRequest(
                "expiry_minutes must be positive".to_string(),
            ));
        }
        let base_units = base.floor_units();
        if base_units < 1 {
            return Err(ServerError::NoSuffixAvailable(base));
        }
        let expires_at_ms = expiry_minutes
            .checked_mul(60_000)
            .and_then(|ms| now_ms.checked_add(ms))
            .ok_or_else(|| {
                ServerError::BadRequest(format!("expiry_minutes {} is too large", expiry_minutes))
            })?;

        let conn = self.storage.conn()?;
        expire_stale_locked(&conn, now_ms)?;

        let taken = {
            let mut stmt = conn.prepare(
                "SELECT decimal_suffix FROM suffix_reservations
                 WHERE base_amount = ?1 AND status = 'reserved'",
            )?;
            let rows = stmt.query_map(params![base_units], |row| row.get::<_, u8>(0))?;
            rows.collect::<Result<HashSet<_>, _>>()?
        };

        for suffix in 1..=self.max_suffix {
            if taken.contains(&suffix) {
                continue;
            }
            let unique_amount = Amount::with_suffix(base_units, suffix)
                .map_err(|e| ServerError::BadRequest(e.to_string()))?;
            let inserted = conn.execute(
                "INSERT INTO suffix_reservations
                    (base_amount, decimal_suffix, unique_amount_minor, order_id, status,
                     created_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4, 'reserved', ?5, ?6)",
                params![
                    base_units,
                    suffix,
                    unique_amount.minor(),
                    order_id,
                    now_ms,
                    expires_at_ms
                ],
            );
            match inserted {
                Ok(_) => {
                    let reservation = StoredReservation {
                        id: conn.last_insert_rowid(),
                        base_amount: base_units,
                        decimal_suffix: suffix,
                        unique_amount,
                        order_id: order_id.map(str::to_string),
                        status: ReservationStatus::Reserved,
                        created_at_ms: now_ms,
                        expires_at_ms,
                        used_at_ms: None,
                    };
                    info!(
                        reservation_id = reservation.id,
                        unique_amount = %unique_amount,
                        "Reserved unique amount"
                    );
                    return Ok(reservation);
                }
                // Lost the claim to a concurrent writer; try the next suffix
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    debug!(base_units, suffix, "Suffix claimed concurrently");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServerError::NoSuffixAvailable(base))
    }

    pub fn match_amount(&self, amount: Amount) -> Result<Option<StoredReservation>, ServerError> {
        self.match_amount_at(amount, now_ms())
    }

    pub fn match_amount_at(
        &self,
        amount: Amount,
        now_ms: i64,
    ) -> Result<Option<StoredReservation>, ServerError> {
        let conn = self.storage.conn()?;
        match_locked(&conn, amount, now_ms)
    }

    pub fn cancel(&self, reservation_id: i64) -> Result<bool, ServerError> {
        let conn = self.storage.conn()?;
        let changed = conn.execute(
            "UPDATE suffix_reservations SET status = 'cancelled'
             WHERE id = ?1 AND status = 'reserved'",
            params![reservation_id],
        )?;
        Ok(changed == 1)
    }

    pub fn get(&self, reservation_id: i64) -> Result<Option<StoredReservation>, ServerError> {
        let conn = self.storage.conn()?;
        let reservation = conn
            .query_row(
                &format!(
                    "SELECT {} FROM suffix_reservations WHERE id = ?1",
                    RESERVATION_COLUMNS
                ),
                params![reservation_id],
                StoredReservation::from_row,
            )
            .optional()?;
        Ok(reservation)
    }

    pub fn expire_stale(&self, now_ms: i64) -> Result<usize, ServerError> {
        let conn = self.storage.conn()?;
        expire_stale_locked(&conn, now_ms)
    }
}

/// Exact lookup against live reservations, flipping the hit to USED in the
/// same statement. A reservation can be consumed at most once.
pub(crate) fn match_locked(
    conn: &Connection,
    amount: Amount,
    now_ms: i64,
) -> Result<Option<StoredReservation>, ServerError> {
    let reservation = conn
        .query_row(
            &format!(
                "UPDATE suffix_reservations SET status = 'used', used_at_ms = ?1
                 WHERE id = (
                    SELECT id FROM suffix_reservations
                    WHERE unique_amount_minor = ?2 AND status = 'reserved'
                      AND expires_at_ms > ?1
                    ORDER BY id LIMIT 1
                 )
                 RETURNING {}",
                RESERVATION_COLUMNS
            ),
            params![now_ms, amount.minor()],
            StoredReservation::from_row,
        )
        .optional()?;
    Ok(reservation)
}

fn expire_stale_locked(conn: &Connection, now_ms: i64) -> Result<usize, ServerError> {
    let expired = conn.execute(
        "UPDATE suffix_reservations SET status = 'expired'
         WHERE status = 'reserved' AND expires_at_ms <= ?1",
        params![now_ms],
    )?;
    if expired > 0 {
        debug!(expired, "Expired stale reservations");
    }
    Ok(expired)
}
