//! Transaction ingest: submit every observed payment to every server and keep
//! unmatched credits as orphans.

use crate::models::Transaction;
use crate::orphan::OrphanStore;
use crate::protocol::MatchDetails;
use crate::source::TransactionSource;
use crate::sync::SyncEngine;
use crate::Result;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    /// Servers that matched the transaction to an order.
    pub matched: Vec<(String, MatchDetails)>,
    /// Servers that could not be reached or refused the submission.
    pub failed: Vec<String>,
    /// Whether the transaction was stored as a new orphan.
    pub orphaned: bool,
}

pub struct TransactionIngestor {
    engines: Vec<Arc<SyncEngine>>,
    orphans: OrphanStore,
}

impl TransactionIngestor {
    pub fn new(engines: Vec<Arc<SyncEngine>>, orphans: OrphanStore) -> Self {
        Self { engines, orphans }
    }

    pub async fn ingest(&self, tx: &Transaction) -> Result<IngestOutcome> {
        let tx = tx.clone().normalized();
        let submissions = self.engines.iter().map(|engine| {
            let tx = &tx;
            async move { (engine.server_id().to_string(), engine.submit_transaction(tx).await) }
        });

        let mut outcome = IngestOutcome::default();
        for (server_id, result) in join_all(submissions).await {
            match result {
                Ok(resp) if resp.is_matched() => {
                    if let Some(details) = resp.match_details {
                        info!(
                            server = %server_id,
                            approval_id = details.approval_id,
                            confidence = details.confidence.as_str(),
                            "Transaction matched"
                        );
                        outcome.matched.push((server_id, details));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(server = %server_id, transaction_id = %tx.id, error = %e, "Submission failed");
                    outcome.failed.push(server_id);
                }
            }
        }

        // Debits are recorded by the servers but never wait for an order
        if outcome.matched.is_empty() && tx.is_credit() {
            outcome.orphaned = self.orphans.save_orphan(&tx)?;
        }
        Ok(outcome)
    }

    /// Ingest from `source` until it is exhausted or `cancel` fires.
    pub async fn run<S: TransactionSource>(&self, mut source: S, cancel: CancellationToken) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = source.next_transaction() => next?,
            };
            let Some(tx) = next else {
                info!("Transaction source exhausted");
                return Ok(());
            };
            if let Err(e) = self.ingest(&tx).await {
                warn!(transaction_id = %tx.id, error = %e, "Ingest failed");
            }
        }
    }
}
