//! Sync engine: orchestrates the push/pull/reconcile cycle for one server.

use crate::models::{ApprovalStatus, Transaction};
use crate::orphan::OrphanStore;
use crate::protocol::{ActionResponse, ApproveRequest, NotifyResponse, MAX_SYNC_PAGE};
use crate::realtime::{ChannelEvent, EventSink};
use crate::store::LocalStore;
use crate::sync::client::ServerApi;
use crate::sync::config::SyncCursor;
use crate::sync::mirror::ApprovalMirror;
use crate::sync::queue::{ActionQueue, PendingAction, QueuedAction};
use crate::{now_ms, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on pages fetched by one pull.
const MAX_PAGES_PER_PULL: usize = 50;

/// What one full cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub push_failed: usize,
    pub pulled: usize,
    pub discarded: usize,
    pub reconciled: usize,
    pub last_synced_version: i64,
}

/// Result of a delta pull.
#[derive(Debug, Clone, Default)]
pub struct PullOutcome {
    pub merged: usize,
    pub discarded: usize,
    pub last_synced_version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// Outcome of a user approve/reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The server confirmed; the approval is now in this status.
    Applied(ApprovalStatus),
    /// The server was unreachable; the action is queued for the next cycle.
    Queued,
}

/// Orchestrates synchronization with one server.
///
/// All cycle steps take the same async lock, so push, pull and reconcile for
/// this server never interleave. Engines for different servers are
/// independent.
pub struct SyncEngine {
    api: Arc<dyn ServerApi>,
    orphans: OrphanStore,
    queue: ActionQueue,
    mirror: ApprovalMirror,
    store: LocalStore,
    page_limit: u32,
    cycle: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn ServerApi>, store: LocalStore) -> Self {
        Self {
            api,
            orphans: OrphanStore::new(store.clone()),
            queue: ActionQueue::new(store.clone()),
            mirror: ApprovalMirror::new(store.clone()),
            store,
            page_limit: MAX_SYNC_PAGE,
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit.clamp(1, MAX_SYNC_PAGE);
        self
    }

    pub fn server_id(&self) -> &str {
        self.api.server_id()
    }

    pub fn mirror(&self) -> &ApprovalMirror {
        &self.mirror
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn cursor(&self) -> Result<SyncCursor> {
        let conn = self.store.conn()?;
        SyncCursor::load(&conn, self.server_id())
    }

    /// One full cycle: flush local intent, absorb server state, then match
    /// every order still awaiting payment against orphans.
    pub async fn sync_cycle(&self) -> Result<SyncReport> {
        let _guard = self.cycle.lock().await;

        let push = self.push_queue_locked().await?;
        let pull = self.pull_delta_locked().await?;
        let reconciled = self.reconcile_orphans_locked().await?;

        let report = SyncReport {
            pushed: push.delivered,
            push_failed: push.failed,
            pulled: pull.merged,
            discarded: pull.discarded,
            reconciled,
            last_synced_version: pull.last_synced_version,
        };
        info!(server = %self.server_id(), ?report, "Sync cycle complete");
        Ok(report)
    }

    pub async fn push_queue(&self) -> Result<PushOutcome> {
        let _guard = self.cycle.lock().await;
        self.push_queue_locked().await
    }

    pub async fn pull_delta(&self) -> Result<PullOutcome> {
        let _guard = self.cycle.lock().await;
        self.pull_delta_locked().await
    }

    pub async fn reconcile_orphans(&self) -> Result<usize> {
        let _guard = self.cycle.lock().await;
        self.reconcile_orphans_locked().await
    }

    /// Pull, then reconcile against the refreshed mirror.
    pub async fn pull_and_reconcile(&self) -> Result<usize> {
        let _guard = self.cycle.lock().await;
        self.pull_delta_locked().await?;
        self.reconcile_orphans_locked().await
    }

    /// Submit an observed transaction to this server.
    pub async fn submit_transaction(&self, tx: &Transaction) -> Result<NotifyResponse> {
        self.api.submit_transaction(tx).await
    }

    /// User approval of `approval_id`.
    pub async fn approve(&self, approval_id: i64) -> Result<ActionOutcome> {
        let _guard = self.cycle.lock().await;
        self.user_action(approval_id, QueuedAction::Approve(ApproveRequest::manual()))
            .await
    }

    /// User rejection of `approval_id`.
    pub async fn reject(&self, approval_id: i64, reason: &str) -> Result<ActionOutcome> {
        let _guard = self.cycle.lock().await;
        self.user_action(
            approval_id,
            QueuedAction::Reject {
                reason: reason.to_string(),
            },
        )
        .await
    }

    async fn user_action(&self, approval_id: i64, action: QueuedAction) -> Result<ActionOutcome> {
        let server_id = self.server_id();
        match self.deliver(approval_id, &action).await {
            Ok(resp) => {
                self.queue.clear(server_id, approval_id)?;
                let status = self.adopt(approval_id, &action, &resp)?;
                info!(server = %server_id, approval_id, status = status.as_str(), "Action applied");
                Ok(ActionOutcome::Applied(status))
            }
            Err(e) if e.is_transient() => {
                warn!(server = %server_id, approval_id, error = %e, "Server unreachable, queueing action");
                self.queue.enqueue(server_id, approval_id, &action)?;
                let (status, reason) = optimistic_status(&action);
                self.mirror.set_status(server_id, approval_id, status, reason)?;
                Ok(ActionOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }

    async fn deliver(&self, approval_id: i64, action: &QueuedAction) -> Result<ActionResponse> {
        match action {
            QueuedAction::Approve(request) => self.api.approve(approval_id, request).await,
            QueuedAction::Reject { reason } => self.api.reject(approval_id, reason).await,
        }
    }

    /// Record a confirmed action locally and return the resulting status.
    fn adopt(
        &self,
        approval_id: i64,
        action: &QueuedAction,
        resp: &ActionResponse,
    ) -> Result<ApprovalStatus> {
        match &resp.approval {
            Some(record) => {
                self.mirror.upsert(self.server_id(), record)?;
                Ok(record.status)
            }
            None => {
                let (status, reason) = optimistic_status(action);
                self.mirror
                    .set_status(self.server_id(), approval_id, status, reason)?;
                Ok(status)
            }
        }
    }

    async fn push_queue_locked(&self) -> Result<PushOutcome> {
        let server_id = self.server_id();
        let actions = self.queue.pending(server_id)?;
        let mut outcome = PushOutcome {
            delivered: 0,
            failed: 0,
        };

        for PendingAction {
            approval_id,
            action,
            ..
        } in actions
        {
            match self.deliver(approval_id, &action).await {
                Ok(resp) => {
                    self.queue.clear(server_id, approval_id)?;
                    self.adopt(approval_id, &action, &resp)?;
                    if let QueuedAction::Approve(ApproveRequest {
                        orphan: Some(evidence),
                        ..
                    }) = &action
                    {
                        if !settled_by(&resp, &evidence.transaction) {
                            self.orphans.release_transaction(&evidence.transaction.id)?;
                        }
                    }
                    debug!(server = %server_id, approval_id, kind = action.kind(), "Queued action delivered");
                    outcome.delivered += 1;
                }
                Err(e) => {
                    warn!(server = %server_id, approval_id, error = %e, "Queued action failed, keeping it");
                    self.queue
                        .record_failure(server_id, approval_id, &e.to_string())?;
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn pull_delta_locked(&self) -> Result<PullOutcome> {
        let server_id = self.server_id();
        let mut cursor = self.cursor()?;
        let mut outcome = PullOutcome::default();

        for _ in 0..MAX_PAGES_PER_PULL {
            let since = cursor.last_synced_version;
            let data = self.api.pull(since, self.page_limit).await?;
            let batch_len = data.orders.len();
            let mut max_version = since;

            for record in data.orders {
                max_version = max_version.max(record.synced_version);

                // A queued local action wins until the server confirms it
                if self.queue.has_pending(server_id, record.id)? {
                    debug!(server = %server_id, approval_id = record.id, "Discarding pulled record, local action pending");
                    outcome.discarded += 1;
                    continue;
                }

                self.mirror.upsert(server_id, &record)?;
                outcome.merged += 1;
            }

            // Advance past discarded records too, so they are not re-fetched forever
            if max_version > cursor.last_synced_version {
                cursor.last_synced_version = max_version;
                let conn = self.store.conn()?;
                cursor.save(&conn)?;
            }

            if batch_len < self.page_limit as usize || max_version <= since {
                break;
            }
        }

        cursor.last_sync_at_ms = Some(now_ms());
        {
            let conn = self.store.conn()?;
            cursor.save(&conn)?;
        }

        outcome.last_synced_version = cursor.last_synced_version;
        debug!(
            server = %server_id,
            merged = outcome.merged,
            discarded = outcome.discarded,
            version = outcome.last_synced_version,
            "Pulled delta"
        );
        Ok(outcome)
    }

    /// Match mirrored orders awaiting payment against pending orphans. The
    /// mirror is the source, so orders pulled earlier and orphans stored
    /// while offline are both picked up.
    async fn reconcile_orphans_locked(&self) -> Result<usize> {
        let server_id = self.server_id();
        let mut reconciled = 0;

        for order in self.mirror.awaiting_payment(server_id)? {
            let Some(hit) = self.orphans.find_match(
                order.amount,
                order.bank_hint.as_deref(),
                Some(order.created_at_ms),
            )?
            else {
                continue;
            };

            let order_ref = order
                .order_id
                .clone()
                .unwrap_or_else(|| order.id.to_string());
            if !self.orphans.mark_matched(hit.orphan.id, &order_ref, server_id)? {
                debug!(orphan_id = hit.orphan.id, "Orphan already claimed");
                continue;
            }

            let request =
                ApproveRequest::from_orphan(hit.orphan.transaction.clone(), hit.strategy.confidence());
            let action = QueuedAction::Approve(request.clone());

            match self.api.approve(order.id, &request).await {
                Ok(resp) if !settled_by(&resp, &hit.orphan.transaction) => {
                    // The order left review elsewhere; the approve was a no-op
                    if let Some(record) = &resp.approval {
                        self.mirror.upsert(server_id, record)?;
                    }
                    self.orphans.release(hit.orphan.id)?;
                    debug!(
                        server = %server_id,
                        approval_id = order.id,
                        orphan_id = hit.orphan.id,
                        "Order no longer awaiting payment, orphan released"
                    );
                }
                Ok(resp) => {
                    self.adopt(order.id, &action, &resp)?;
                    info!(
                        server = %server_id,
                        approval_id = order.id,
                        orphan_id = hit.orphan.id,
                        strategy = ?hit.strategy,
                        "Matched orphan transaction to order"
                    );
                    reconciled += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(server = %server_id, approval_id = order.id, error = %e, "Orphan approval queued");
                    self.queue.enqueue(server_id, order.id, &action)?;
                    self.mirror
                        .set_status(server_id, order.id, ApprovalStatus::AutoApproved, None)?;
                    reconciled += 1;
                }
                Err(e) => {
                    warn!(server = %server_id, approval_id = order.id, error = %e, "Server refused orphan approval");
                    self.orphans.release(hit.orphan.id)?;
                }
            }
        }

        Ok(reconciled)
    }
}

/// Whether the server now holds `tx` as the approved payment.
fn settled_by(resp: &ActionResponse, tx: &Transaction) -> bool {
    resp.approval.as_ref().is_some_and(|approval| {
        approval.status.is_approved()
            && approval.transaction.as_ref().map(|t| t.id) == Some(tx.id)
    })
}

fn optimistic_status(action: &QueuedAction) -> (ApprovalStatus, Option<&str>) {
    match action {
        QueuedAction::Approve(request) => (request.target_status(), None),
        QueuedAction::Reject { reason } => (ApprovalStatus::Rejected, Some(reason.as_str())),
    }
}

#[async_trait]
impl EventSink for SyncEngine {
    async fn on_event(&self, event: ChannelEvent) {
        if !event.wants_pull() {
            return;
        }
        if let Err(e) = self.pull_and_reconcile().await {
            warn!(server = %self.server_id(), error = %e, "Event-driven sync failed");
        }
    }
}
