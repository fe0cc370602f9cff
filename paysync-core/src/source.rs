//! Where normalized transactions come from.
//!
//! SMS and notification capture happen on the host platform; the core only
//! consumes already-parsed transactions through this interface.

use crate::models::Transaction;
use crate::{PaySyncError, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tracing::warn;

#[async_trait]
pub trait TransactionSource: Send {
    /// The next transaction, or `None` once the source is exhausted.
    async fn next_transaction(&mut self) -> Result<Option<Transaction>>;
}

/// Transactions pushed in-process by a host callback.
pub struct ChannelSource {
    rx: mpsc::Receiver<Transaction>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Transaction>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl TransactionSource for ChannelSource {
    async fn next_transaction(&mut self) -> Result<Option<Transaction>> {
        Ok(self.rx.recv().await)
    }
}

/// One JSON transaction per line. Blank lines are skipped; malformed lines
/// are logged and skipped.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> TransactionSource for JsonLinesSource<R> {
    async fn next_transaction(&mut self) -> Result<Option<Transaction>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Transaction>(line) {
                Ok(tx) => {
                    let tx = tx.normalized();
                    match tx.validate() {
                        Ok(()) => return Ok(Some(tx)),
                        Err(reason) => warn!(%reason, "Skipping invalid transaction"),
                    }
                }
                Err(e) => warn!(error = %e, "Skipping malformed transaction line"),
            }
        }
        Ok(None)
    }
}

/// Read one transaction from a JSON string.
pub fn parse_transaction(json: &str) -> Result<Transaction> {
    let tx: Transaction = serde_json::from_str(json)
        .map_err(|e| PaySyncError::InvalidInput(format!("malformed transaction: {}", e)))?;
    let tx = tx.normalized();
    tx.validate().map_err(PaySyncError::InvalidInput)?;
    Ok(tx)
}
