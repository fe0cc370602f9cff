//! Replay protection: the ledger of `(device, nonce)` pairs already accepted.

use super::EnvelopeError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Store of previously seen nonces.
///
/// `record` is the atomic check-and-insert: it returns `Ok(true)` when the
/// nonce was new for this device and is now recorded, `Ok(false)` when it was
/// already present. Two concurrent calls with the same pair must never both
/// return `true`.
pub trait NonceLedger: Send + Sync {
    fn record(&self, device_id: &str, nonce: &str, seen_at_ms: i64) -> Result<bool, EnvelopeError>;
}

/// In-process ledger, for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryNonceLedger {
    seen: Mutex<HashMap<(String, String), i64>>,
}

impl MemoryNonceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries seen before `cutoff_ms`. Returns how many were removed.
    pub fn prune(&self, cutoff_ms: i64) -> usize {
        let Ok(mut seen) = self.seen.lock() else {
            return 0;
        };
        let before = seen.len();
        seen.retain(|_, seen_at| *seen_at >= cutoff_ms);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NonceLedger for MemoryNonceLedger {
    fn record(&self, device_id: &str, nonce: &str, seen_at_ms: i64) -> Result<bool, EnvelopeError> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|e| EnvelopeError::LedgerUnavailable(e.to_string()))?;
        let key = (device_id.to_string(), nonce.to_string());
        if seen.contains_key(&key) {
            return Ok(false);
        }
        seen.insert(key, seen_at_ms);
        Ok(true)
    }
}
