//! Secure message envelope for device → server notifications.
//!
//! Outbound, a payload is encrypted with AES-256-GCM under a key derived from
//! the shared secret, then signed with HMAC-SHA256 over
//! `ciphertext_b64 || nonce || timestamp_ms`.
//!
//! Inbound verification runs in a fixed order and fails closed at the first
//! failure:
//! 1. timestamp freshness
//! 2. signature (constant-time)
//! 3. replay check against the nonce ledger (atomic check-and-insert)
//! 4. decryption
//!
//! Nothing is written to the nonce ledger and no decryption is attempted for a
//! request whose signature has not been verified.

pub mod cipher;
pub mod ledger;
pub mod signature;

pub use ledger::{MemoryNonceLedger, NonceLedger};

use crate::models::Transaction;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Default accepted clock skew between device and server.
pub const DEFAULT_TOLERANCE_MS: i64 = 300_000;

/// Random bytes in a request nonce.
pub const NONCE_LEN: usize = 16;

const MAX_NONCE_CHARS: usize = 128;

/// Envelope verification failures. All of these are client-input errors and
/// are never retried by the server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Request timestamp outside the accepted window")]
    TimestampExpired,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Nonce has already been used")]
    NonceReplayed,

    #[error("Payload decryption failed")]
    DecryptionFailed,

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Nonce ledger unavailable: {0}")]
    LedgerUnavailable(String),
}

/// The authenticated fields that travel with a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// `base64(iv || ciphertext || tag)`
    pub data: String,
    /// Hex-encoded random nonce.
    pub nonce: String,
    pub timestamp_ms: i64,
    /// Hex-encoded HMAC-SHA256.
    pub signature: String,
}

/// Seals and opens envelopes under one shared secret.
pub struct SecureEnvelope {
    secret: Zeroizing<Vec<u8>>,
    key: Zeroizing<[u8; cipher::KEY_LEN]>,
    tolerance_ms: i64,
}

impl std::fmt::Debug for SecureEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureEnvelope")
            .field("tolerance_ms", &self.tolerance_ms)
            .finish_non_exhaustive()
    }
}

impl SecureEnvelope {
    pub fn new(shared_secret: &str) -> Self {
        Self {
            secret: Zeroizing::new(shared_secret.as_bytes().to_vec()),
            key: cipher::derive_key(shared_secret.as_bytes()),
            tolerance_ms: DEFAULT_TOLERANCE_MS,
        }
    }

    pub fn with_tolerance_ms(mut self, tolerance_ms: i64) -> Self {
        self.tolerance_ms = tolerance_ms;
        self
    }

    pub fn tolerance_ms(&self) -> i64 {
        self.tolerance_ms
    }

    /// Encrypt and sign `payload`, stamped with the current time.
    pub fn seal(&self, payload: &[u8]) -> Result<SealedEnvelope, EnvelopeError> {
        self.seal_at(payload, chrono::Utc::now().timestamp_millis())
    }

    pub fn seal_at(&self, payload: &[u8], timestamp_ms: i64) -> Result<SealedEnvelope, EnvelopeError> {
        let blob = cipher::encrypt(&self.key, payload)?;
        let data = STANDARD.encode(blob);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);

        let signature = signature::sign(&self.secret, &data, &nonce, timestamp_ms)?;

        Ok(SealedEnvelope {
            data,
            nonce,
            timestamp_ms,
            signature,
        })
    }

    /// Seal the canonical JSON form of a transaction.
    pub fn seal_transaction(&self, tx: &Transaction) -> Result<SealedEnvelope, EnvelopeError> {
        let json = serde_json::to_vec(tx)
            .map_err(|e| EnvelopeError::ValidationFailed(format!("serialize: {}", e)))?;
        self.seal(&json)
    }

    /// Verify and decrypt an inbound envelope.
    pub fn open(
        &self,
        envelope: &SealedEnvelope,
        device_id: &str,
        ledger: &dyn NonceLedger,
    ) -> Result<Vec<u8>, EnvelopeError> {
        self.open_at(envelope, device_id, ledger, chrono::Utc::now().timestamp_millis())
    }

    pub fn open_at(
        &self,
        envelope: &SealedEnvelope,
        device_id: &str,
        ledger: &dyn NonceLedger,
        now_ms: i64,
    ) -> Result<Vec<u8>, EnvelopeError> {
        if envelope.nonce.is_empty() || envelope.nonce.len() > MAX_NONCE_CHARS {
            return Err(EnvelopeError::ValidationFailed(
                "nonce must be 1-128 characters".to_string(),
            ));
        }
        if device_id.is_empty() {
            return Err(EnvelopeError::ValidationFailed(
                "device id is required".to_string(),
            ));
        }

        // 1. freshness
        if now_ms.abs_diff(envelope.timestamp_ms) > self.tolerance_ms.max(0) as u64 {
            return Err(EnvelopeError::TimestampExpired);
        }

        // 2. signature over the exact received bytes
        if !signature::verify(
            &self.secret,
            &envelope.data,
            &envelope.nonce,
            envelope.timestamp_ms,
            &envelope.signature,
        ) {
            return Err(EnvelopeError::InvalidSignature);
        }

        // 3. replay
        if !ledger.record(device_id, &envelope.nonce, now_ms)? {
            return Err(EnvelopeError::NonceReplayed);
        }

        // 4. decrypt
        let blob = STANDARD
            .decode(envelope.data.as_bytes())
            .map_err(|_| EnvelopeError::DecryptionFailed)?;
        cipher::decrypt(&self.key, &blob)
    }

    /// Verify, decrypt and parse a transaction envelope.
    pub fn open_transaction(
        &self,
        envelope: &SealedEnvelope,
        device_id: &str,
        ledger: &dyn NonceLedger,
    ) -> Result<Transaction, EnvelopeError> {
        let plaintext = self.open(envelope, device_id, ledger)?;
        let tx: Transaction = serde_json::from_slice(&plaintext)
            .map_err(|e| EnvelopeError::ValidationFailed(format!("malformed transaction: {}", e)))?;
        let tx = tx.normalized();
        tx.validate().map_err(EnvelopeError::ValidationFailed)?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CaptureSource, Direction};
    use crate::money::Amount;

    const NOW: i64 = 1_700_000_000_000;

    fn envelope() -> SecureEnvelope {
        SecureEnvelope::new("merchant-shared-secret")
    }

    #[test]
    fn seal_open_roundtrip() {
        let env = envelope();
        let ledger = MemoryNonceLedger::new();
        let sealed = env.seal_at("Transfer 銀行 ✓".as_bytes(), NOW).unwrap();
        let opened = env.open_at(&sealed, "dev-1", &ledger, NOW + 1_000).unwrap();
        assert_eq!(opened, "Transfer 銀行 ✓".as_bytes());
        assert_eq!(sealed.nonce.len(), NONCE_LEN * 2);
    }

    #[test]
    fn identical_submission_is_replayed_once() {
        let env = envelope();
        let ledger = MemoryNonceLedger::new();
        let sealed = env.seal_at(b"payload", NOW).unwrap();
        assert!(env.open_at(&sealed, "dev-1", &ledger, NOW).is_ok());
        assert_eq!(
            env.open_at(&sealed, "dev-1", &ledger, NOW),
            Err(EnvelopeError::NonceReplayed)
        );
    }

    #[test]
    fn stale_timestamp_rejected_even_with_valid_signature() {
        let env = envelope();
        let ledger = MemoryNonceLedger::new();
        let sealed = env.seal_at(b"payload", NOW - DEFAULT_TOLERANCE_MS - 1).unwrap();
        assert_eq!(
            env.open_at(&sealed, "dev-1", &ledger, NOW),
            Err(EnvelopeError::TimestampExpired)
        );
        // Rejected before the ledger was touched
        assert!(ledger.is_empty());
    }

    #[test]
    fn future_timestamp_outside_window_rejected() {
        let env = envelope();
        let ledger = MemoryNonceLedger::new();
        let sealed = env.seal_at(b"payload", NOW + DEFAULT_TOLERANCE_MS + 1).unwrap();
        assert_eq!(
            env.open_at(&sealed, "dev-1", &ledger, NOW),
            Err(EnvelopeError::TimestampExpired)
        );
    }

    #[test]
    fn extreme_timestamps_are_expired() {
        let env = envelope();
        let ledger = MemoryNonceLedger::new();
        for timestamp_ms in [i64::MIN, i64::MAX] {
            let sealed = env.seal_at(b"payload", timestamp_ms).unwrap();
            assert_eq!(
                env.open_at(&sealed, "dev-1", &ledger, NOW),
                Err(EnvelopeError::TimestampExpired)
            );
        }
        let sealed = env.seal_at(b"payload", 0).unwrap();
        assert_eq!(
            env.open_at(&sealed, "dev-1", &ledger, i64::MIN),
            Err(EnvelopeError::TimestampExpired)
        );
        assert!(ledger.is_empty());
    }

    #[test]
    fn bad_signature_never_reaches_ledger() {
        let env = envelope();
        let ledger = MemoryNonceLedger::new();
        let mut sealed = env.seal_at(b"payload", NOW).unwrap();
        sealed.signature = "00".repeat(32);
        assert_eq!(
            env.open_at(&sealed, "dev-1", &ledger, NOW),
            Err(EnvelopeError::InvalidSignature)
        );
        assert!(ledger.is_empty());
    }

    #[test]
    fn tampered_timestamp_breaks_signature() {
        let env = envelope();
        let ledger = MemoryNonceLedger::new();
        let mut sealed = env.seal_at(b"payload", NOW).unwrap();
        sealed.timestamp_ms += 1;
        assert_eq!(
            env.open_at(&sealed, "dev-1", &ledger, NOW),
            Err(EnvelopeError::InvalidSignature)
        );
    }

    #[test]
    fn wrong_secret_fails_signature() {
        let sealed = envelope().seal_at(b"payload", NOW).unwrap();
        let other = SecureEnvelope::new("some-other-secret");
        let ledger = MemoryNonceLedger::new();
        assert_eq!(
            other.open_at(&sealed, "dev-1", &ledger, NOW),
            Err(EnvelopeError::InvalidSignature)
        );
    }

    #[test]
    fn signed_garbage_fails_decryption() {
        // Correctly signed but not a valid ciphertext under the derived key
        let env = envelope();
        let ledger = MemoryNonceLedger::new();
        let data = STANDARD.encode([1u8; 40]);
        let nonce = "ab".repeat(NONCE_LEN);
        let sealed = SealedEnvelope {
            signature: signature::sign(b"merchant-shared-secret", &data, &nonce, NOW).unwrap(),
            data,
            nonce,
            timestamp_ms: NOW,
        };
        assert_eq!(
            env.open_at(&sealed, "dev-1", &ledger, NOW),
            Err(EnvelopeError::DecryptionFailed)
        );
    }

    #[test]
    fn empty_nonce_is_validation_failure() {
        let env = envelope();
        let ledger = MemoryNonceLedger::new();
        let mut sealed = env.seal_at(b"payload", NOW).unwrap();
        sealed.nonce.clear();
        assert!(matches!(
            env.open_at(&sealed, "dev-1", &ledger, NOW),
            Err(EnvelopeError::ValidationFailed(_))
        ));
    }

    #[test]
    fn transaction_roundtrip() {
        let env = envelope();
        let ledger = MemoryNonceLedger::new();
        let tx = Transaction::new(
            "BCA",
            Direction::Credit,
            Amount::parse("500.01").unwrap(),
            NOW,
            CaptureSource::Notification,
        )
        .with_counterparty("Budi Santoso");
        let sealed = env.seal_transaction(&tx).unwrap();
        let opened = env.open_transaction(&sealed, "dev-1", &ledger).unwrap();
        assert_eq!(opened, tx);
    }
}
