//! Payment reconciliation core library
//!
//! Shared by the device agent and the server:
//! - fixed-point money and the shared data model
//! - the secure envelope that authenticates device → server notifications
//! - device-local storage, orphan transactions and the offline action queue
//! - the version-delta sync engine and the realtime push channel
//! - the transaction ingest pipeline

pub mod envelope;
pub mod ingest;
pub mod models;
pub mod money;
pub mod orphan;
pub mod protocol;
pub mod realtime;
pub mod source;
pub mod store;
pub mod sync;

pub use envelope::{EnvelopeError, MemoryNonceLedger, NonceLedger, SealedEnvelope, SecureEnvelope};
pub use ingest::{IngestOutcome, TransactionIngestor};
pub use models::{
    ApprovalMode, ApprovalRecord, ApprovalStatus, CaptureSource, Confidence, Direction,
    Transaction,
};
pub use money::{Amount, AmountError};
pub use orphan::{MatchStrategy, OrphanMatch, OrphanRetention, OrphanStatus, OrphanStore};
pub use realtime::{ConnectionState, DeviceConnection, RealtimeSupervisor, ServerRegistry};
pub use store::LocalStore;
pub use sync::{ServerApi, ServerEndpoint, SyncEngine};

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, PaySyncError>;

/// Storage-layer failures.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// General error type for core operations
#[derive(Error, Debug)]
pub enum PaySyncError {
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PaySyncError {
    /// Whether retrying the same call later can succeed.
    ///
    /// Transport failures, timeouts, throttling and server-side faults are
    /// transient; a 4xx rejection of the request itself is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Server { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for PaySyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(PaySyncError::Network("connection refused".into()).is_transient());
        assert!(PaySyncError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(PaySyncError::Server {
            status: 429,
            message: "slow down".into()
        }
        .is_transient());
        assert!(!PaySyncError::Server {
            status: 404,
            message: "no such approval".into()
        }
        .is_transient());
        assert!(!PaySyncError::Envelope(EnvelopeError::InvalidSignature).is_transient());
    }
}
