//! Reconciliation of verified transactions against orders.
//!
//! Credits first try the reservation table (exact unique amount, HIGH), then
//! the order book (total within one minor unit, MEDIUM, or AMBIGUOUS when
//! more than one order fits). Anything else is only recorded; the device
//! keeps it as an orphan.

use crate::allocator;
use crate::error::ServerError;
use crate::orders::OrderBook;
use crate::storage::approvals::{self, NewApproval, Transition, SYSTEM_ACTOR};
use crate::storage::models::PendingOrder;
use crate::storage::ServerStorage;
use paysync_core::models::{ApprovalMode, ApprovalRecord, ApprovalStatus, Confidence, Transaction};
use paysync_core::money::Amount;
use paysync_core::now_ms;
use paysync_core::protocol::{ApproveRequest, ChannelFrame, MatchDetails, RegisterOrderRequest};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Matched(MatchDetails),
    /// A credit with no reservation and no order.
    Unmatched,
    /// A debit; stored, never matched.
    Recorded,
}

impl MatchOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Matched(_) => "Transaction matched",
            Self::Unmatched => "Transaction recorded, no matching order",
            Self::Recorded => "Transaction recorded",
        }
    }
}

struct Candidate {
    order_id: Option<String>,
    reservation_id: Option<i64>,
    amount: Amount,
    bank_hint: Option<String>,
    confidence: Confidence,
}

#[derive(Clone)]
pub struct ReconciliationMatcher {
    storage: ServerStorage,
    order_book: Arc<dyn OrderBook>,
    mode: ApprovalMode,
    bus: broadcast::Sender<ChannelFrame>,
}

impl ReconciliationMatcher {
    pub fn new(
        storage: ServerStorage,
        order_book: Arc<dyn OrderBook>,
        mode: ApprovalMode,
        bus: broadcast::Sender<ChannelFrame>,
    ) -> Self {
        Self {
            storage,
            order_book,
            mode,
            bus,
        }
    }

    pub fn process(&self, tx: &Transaction, device_id: &str) -> Result<MatchOutcome, ServerError> {
        self.process_at(tx, device_id, now_ms())
    }

    pub fn process_at(
        &self,
        tx: &Transaction,
        device_id: &str,
        now_ms: i64,
    ) -> Result<MatchOutcome, ServerError> {
        let reserved = {
            let conn = self.storage.conn()?;
            if !approvals::record_transaction(&conn, tx, device_id, None, now_ms)? {
                // Resubmission of a payment already handled
                debug!(transaction_id = %tx.id, "Transaction already recorded");
                return Ok(match approvals::for_transaction(&conn, &tx.id.to_string())? {
                    Some(approval) => MatchOutcome::Matched(details(&approval)),
                    None if tx.is_credit() => MatchOutcome::Unmatched,
                    None => MatchOutcome::Recorded,
                });
            }
            if !tx.is_credit() {
                return Ok(MatchOutcome::Recorded);
            }
            allocator::match_locked(&conn, tx.amount, now_ms)?
        };

        let candidate = match reserved {
            Some(r) => Candidate {
                order_id: r.order_id,
                reservation_id: Some(r.id),
                amount: r.unique_amount,
                bank_hint: None,
                confidence: Confidence::High,
            },
            None => match self.direct_match(tx.amount)? {
                Some(c) => c,
                None => {
                    info!(transaction_id = %tx.id, amount = %tx.amount, "No matching order");
                    return Ok(MatchOutcome::Unmatched);
                }
            },
        };

        let needs_review =
            self.mode == ApprovalMode::Manual || candidate.confidence == Confidence::Ambiguous;
        let status = if needs_review {
            ApprovalStatus::PendingReview
        } else {
            ApprovalStatus::AutoApproved
        };
        let approved_by = (status == ApprovalStatus::AutoApproved).then_some(SYSTEM_ACTOR);

        let approval = {
            let conn = self.storage.conn()?;
            let waiting = match candidate.order_id.as_deref() {
                Some(order_id) => approvals::awaiting_for_order(&conn, order_id)?,
                None => None,
            };
            let approval = match waiting {
                Some(existing) => approvals::attach(
                    &conn,
                    existing.id,
                    tx,
                    candidate.reservation_id,
                    status,
                    candidate.confidence,
                    approved_by,
                    now_ms,
                )?,
                None => approvals::insert(
                    &conn,
                    NewApproval {
                        order_id: candidate.order_id.as_deref(),
                        reservation_id: candidate.reservation_id,
                        amount: candidate.amount,
                        transaction: Some(tx),
                        status,
                        confidence: Some(candidate.confidence),
                        approved_by,
                        bank_hint: candidate.bank_hint.as_deref(),
                    },
                    now_ms,
                )?,
            };
            approvals::link_transaction(&conn, &tx.id.to_string(), approval.id)?;
            approval
        };

        info!(
            approval_id = approval.id,
            order_id = approval.order_id.as_deref().unwrap_or("-"),
            confidence = candidate.confidence.as_str(),
            status = status.as_str(),
            "Transaction matched"
        );
        self.settle(&approval, now_ms);
        self.publish(ChannelFrame::ORDER_UPDATE, &approval);
        Ok(MatchOutcome::Matched(details(&approval)))
    }

    /// Register an order and open its awaiting-payment approval.
    pub fn register_order(
        &self,
        request: &RegisterOrderRequest,
        now_ms: i64,
    ) -> Result<Transition, ServerError> {
        if request.order_id.trim().is_empty() {
            return Err(ServerError::BadRequest("order_id is required".to_string()));
        }
        if !request.total.is_positive() {
            return Err(ServerError::BadRequest("total must be positive".to_string()));
        }
        self.order_book.register(&PendingOrder {
            order_id: request.order_id.clone(),
            total: request.total,
            bank_hint: request.bank_hint.clone(),
            created_at_ms: now_ms,
        })?;

        let transition = {
            let conn = self.storage.conn()?;
            match approvals::for_order(&conn, &request.order_id)? {
                Some(existing) => Transition {
                    approval: existing,
                    changed: false,
                },
                None => Transition {
                    approval: approvals::insert(
                        &conn,
                        NewApproval {
                            order_id: Some(&request.order_id),
                            reservation_id: None,
                            amount: request.total,
                            transaction: None,
                            status: ApprovalStatus::PendingReview,
                            confidence: None,
                            approved_by: None,
                            bank_hint: request.bank_hint.as_deref(),
                        },
                        now_ms,
                    )?,
                    changed: true,
                },
            }
        };

        if transition.changed {
            info!(order_id = %request.order_id, total = %request.total, "Order registered");
            self.publish(ChannelFrame::NEW_ORDER, &transition.approval);
        }
        Ok(transition)
    }

    pub fn approve(
        &self,
        approval_id: i64,
        request: &ApproveRequest,
        actor: &str,
    ) -> Result<Transition, ServerError> {
        let now = now_ms();
        let transition = {
            let conn = self.storage.conn()?;
            approvals::approve(&conn, approval_id, request, actor, now)?
        }
        .ok_or_else(|| ServerError::NotFound(format!("approval {} not found", approval_id)))?;

        if transition.changed {
            info!(
                approval_id,
                status = transition.approval.status.as_str(),
                "Approval approved"
            );
            self.settle(&transition.approval, now);
            self.publish(ChannelFrame::ORDER_UPDATE, &transition.approval);
        }
        Ok(transition)
    }

    pub fn reject(&self, approval_id: i64, reason: &str) -> Result<Transition, ServerError> {
        let transition = {
            let conn = self.storage.conn()?;
            approvals::reject(&conn, approval_id, reason, now_ms())?
        }
        .ok_or_else(|| ServerError::NotFound(format!("approval {} not found", approval_id)))?;

        if transition.changed {
            info!(approval_id, "Approval rejected");
            self.publish(ChannelFrame::ORDER_UPDATE, &transition.approval);
        }
        Ok(transition)
    }

    fn direct_match(&self, amount: Amount) -> Result<Option<Candidate>, ServerError> {
        let orders = self.order_book.pending_with_total(amount, Amount::TOLERANCE)?;
        let open = {
            let conn = self.storage.conn()?;
            let mut open = Vec::with_capacity(orders.len());
            for order in orders {
                if !approvals::order_claimed(&conn, &order.order_id)? {
                    open.push(order);
                }
            }
            open
        };

        let confidence = match open.len() {
            0 => return Ok(None),
            1 => Confidence::Medium,
            n => {
                warn!(%amount, candidates = n, "Several orders fit; leaving for review");
                Confidence::Ambiguous
            }
        };
        // Oldest order first; a reviewer can still reject it
        Ok(open.into_iter().next().map(|order| Candidate {
            order_id: Some(order.order_id),
            reservation_id: None,
            amount: order.total,
            bank_hint: order.bank_hint,
            confidence,
        }))
    }

    /// Completion callback for approved orders.
    fn settle(&self, approval: &ApprovalRecord, now_ms: i64) {
        if !approval.status.is_approved() {
            return;
        }
        if let Some(order_id) = approval.order_id.as_deref() {
            if let Err(e) = self.order_book.mark_paid(order_id, now_ms) {
                warn!(order_id, error = %e, "Failed to mark order paid");
            }
        }
    }

    fn publish(&self, kind: &str, approval: &ApprovalRecord) {
        match serde_json::to_value(approval) {
            // No subscribers is fine; devices pull on reconnect
            Ok(data) => {
                let _ = self.bus.send(ChannelFrame::new(kind, data));
            }
            Err(e) => warn!(error = %e, "Failed to encode realtime frame"),
        }
    }
}

fn details(approval: &ApprovalRecord) -> MatchDetails {
    MatchDetails {
        approval_id: approval.id,
        order_id: approval.order_id.clone(),
        confidence: approval.confidence.unwrap_or(Confidence::Ambiguous),
        status: approval.status,
        amount: approval.amount,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::allocator::SuffixAllocator;
    use crate::orders::SqliteOrderBook;
    use paysync_core::models::{CaptureSource, Direction};

    pub(crate) struct Fixture {
        pub storage: ServerStorage,
        pub allocator: SuffixAllocator,
        pub orders: Arc<SqliteOrderBook>,
        pub matcher: ReconciliationMatcher,
        pub bus: broadcast::Sender<ChannelFrame>,
    }

    pub(crate) fn fixture(mode: ApprovalMode) -> Fixture {
        let storage = ServerStorage::in_memory().unwrap();
        let orders = Arc::new(SqliteOrderBook::new(storage.clone()));
        let (bus, _) = broadcast::channel(64);
        let matcher = ReconciliationMatcher::new(storage.clone(), orders.clone(), mode, bus.clone());
        Fixture {
            allocator: SuffixAllocator::new(storage.clone(), 99),
            storage,
            orders,
            matcher,
            bus,
        }
    }

    fn credit(amount: &str, observed_at_ms: i64) -> Transaction {
        Transaction::new(
            "BCA",
            Direction::Credit,
            Amount::parse(amount).unwrap(),
            observed_at_ms,
            CaptureSource::Notification,
        )
    }

    fn register(f: &Fixture, order_id: &str, total: &str) -> ApprovalRecord {
        f.matcher
            .register_order(
                &RegisterOrderRequest {
                    order_id: order_id.into(),
                    total: Amount::parse(total).unwrap(),
                    bank_hint: None,
                },
                now_ms(),
            )
            .unwrap()
            .approval
    }

    #[test]
    fn reserved_amount_matches_with_high_confidence() {
        let f = fixture(ApprovalMode::Auto);
        let mut rx = f.bus.subscribe();
        let r = f
            .allocator
            .reserve(Amount::from_units(500).unwrap(), 30, Some("order-500"))
            .unwrap();
        assert_eq!(r.unique_amount, Amount::parse("500.01").unwrap());

        let outcome = f.matcher.process(&credit("500.01", 1), "dev-1").unwrap();
        let MatchOutcome::Matched(details) = outcome else {
            panic!("expected a match, got {:?}", outcome);
        };
        assert_eq!(details.confidence, Confidence::High);
        assert_eq!(details.status, ApprovalStatus::AutoApproved);
        assert_eq!(details.order_id.as_deref(), Some("order-500"));

        let conn = f.storage.conn().unwrap();
        let approval = approvals::get(&conn, details.approval_id).unwrap().unwrap();
        assert_eq!(approval.approved_by.as_deref(), Some(SYSTEM_ACTOR));
        assert_eq!(approval.reservation_id, Some(r.id));
        drop(conn);

        assert_eq!(
            f.allocator.get(r.id).unwrap().unwrap().status,
            crate::storage::models::ReservationStatus::Used
        );
        assert_eq!(rx.try_recv().unwrap().kind, ChannelFrame::ORDER_UPDATE);
    }

    #[test]
    fn unmatched_credit_creates_no_approval() {
        let f = fixture(ApprovalMode::Auto);
        let outcome = f.matcher.process(&credit("750.00", 1), "dev-1").unwrap();
        assert!(matches!(outcome, MatchOutcome::Unmatched));

        let conn = f.storage.conn().unwrap();
        assert!(approvals::list_since(&conn, 0, 100).unwrap().is_empty());
    }

    #[test]
    fn debits_are_recorded_only() {
        let f = fixture(ApprovalMode::Auto);
        register(&f, "o-1", "20.00");
        let debit = Transaction::new(
            "BCA",
            Direction::Debit,
            Amount::parse("20.00").unwrap(),
            1,
            CaptureSource::Sms,
        );

        let outcome = f.matcher.process(&debit, "dev-1").unwrap();
        assert!(matches!(outcome, MatchOutcome::Recorded));
        assert!(!f.orders.is_paid("o-1").unwrap());
    }

    #[test]
    fn order_total_match_attaches_to_waiting_approval() {
        let f = fixture(ApprovalMode::Auto);
        let waiting = register(&f, "o-1", "120.00");

        let outcome = f.matcher.process(&credit("120.00", 1), "dev-1").unwrap();
        let MatchOutcome::Matched(details) = outcome else {
            panic!("expected a match");
        };
        assert_eq!(details.approval_id, waiting.id);
        assert_eq!(details.confidence, Confidence::Medium);
        assert_eq!(details.status, ApprovalStatus::AutoApproved);
        assert!(f.orders.is_paid("o-1").unwrap());

        // The same order cannot absorb a second payment
        let again = f.matcher.process(&credit("120.00", 2), "dev-1").unwrap();
        assert!(matches!(again, MatchOutcome::Unmatched));
    }

    #[test]
    fn several_fitting_orders_go_to_review() {
        let f = fixture(ApprovalMode::Auto);
        register(&f, "o-1", "80.00");
        register(&f, "o-2", "80.01");

        let outcome = f.matcher.process(&credit("80.00", 1), "dev-1").unwrap();
        let MatchOutcome::Matched(details) = outcome else {
            panic!("expected a match");
        };
        assert_eq!(details.confidence, Confidence::Ambiguous);
        assert_eq!(details.status, ApprovalStatus::PendingReview);
        assert!(!f.orders.is_paid("o-1").unwrap());
    }

    #[test]
    fn manual_mode_leaves_matches_pending() {
        let f = fixture(ApprovalMode::Manual);
        f.allocator
            .reserve(Amount::from_units(60).unwrap(), 30, Some("o-60"))
            .unwrap();
        let outcome = f.matcher.process(&credit("60.01", 1), "dev-1").unwrap();
        let MatchOutcome::Matched(details) = outcome else {
            panic!("expected a match");
        };
        assert_eq!(details.confidence, Confidence::High);
        assert_eq!(details.status, ApprovalStatus::PendingReview);

        let conn = f.storage.conn().unwrap();
        let approval = approvals::get(&conn, details.approval_id).unwrap().unwrap();
        assert!(approval.approved_by.is_none());
        drop(conn);

        let t = f
            .matcher
            .approve(details.approval_id, &ApproveRequest::manual(), "dev-1")
            .unwrap();
        assert_eq!(t.approval.status, ApprovalStatus::ManuallyApproved);
        let t = f
            .matcher
            .approve(details.approval_id, &ApproveRequest::manual(), "dev-1")
            .unwrap();
        assert!(!t.changed);
        assert_eq!(t.approval.status, ApprovalStatus::ManuallyApproved);
    }

    #[test]
    fn resubmission_reports_the_original_match() {
        let f = fixture(ApprovalMode::Auto);
        f.allocator
            .reserve(Amount::from_units(33).unwrap(), 30, None)
            .unwrap();
        let tx = credit("33.01", 1);
        let MatchOutcome::Matched(first) = f.matcher.process(&tx, "dev-1").unwrap() else {
            panic!("expected a match");
        };
        let MatchOutcome::Matched(second) = f.matcher.process(&tx, "dev-2").unwrap() else {
            panic!("expected the recorded match");
        };
        assert_eq!(first.approval_id, second.approval_id);

        let conn = f.storage.conn().unwrap();
        assert_eq!(approvals::list_since(&conn, 0, 100).unwrap().len(), 1);
    }

    #[test]
    fn unknown_approval_is_not_found() {
        let f = fixture(ApprovalMode::Auto);
        assert!(matches!(
            f.matcher.approve(42, &ApproveRequest::manual(), "dev-1"),
            Err(ServerError::NotFound(_))
        ));
        assert!(matches!(
            f.matcher.reject(42, "no"),
            Err(ServerError::NotFound(_))
        ));
    }
}
