//! HMAC-SHA256 request signatures.

use super::EnvelopeError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Canonical string-to-sign: `{ciphertext_b64}{nonce}{timestamp_ms}`.
pub fn canonical_string(ciphertext_b64: &str, nonce: &str, timestamp_ms: i64) -> String {
    format!("{}{}{}", ciphertext_b64, nonce, timestamp_ms)
}

fn mac(secret: &[u8], message: &[u8]) -> Result<HmacSha256, EnvelopeError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| EnvelopeError::ValidationFailed(format!("invalid HMAC key: {}", e)))?;
    mac.update(message);
    Ok(mac)
}

/// Sign the canonical string, returning a lowercase hex signature.
pub fn sign(
    secret: &[u8],
    ciphertext_b64: &str,
    nonce: &str,
    timestamp_ms: i64,
) -> Result<String, EnvelopeError> {
    let message = canonical_string(ciphertext_b64, nonce, timestamp_ms);
    Ok(hex::encode(mac(secret, message.as_bytes())?.finalize().into_bytes()))
}

/// Verify a hex signature in constant time.
pub fn verify(
    secret: &[u8],
    ciphertext_b64: &str,
    nonce: &str,
    timestamp_ms: i64,
    signature_hex: &str,
) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let message = canonical_string(ciphertext_b64, nonce, timestamp_ms);
    mac(secret, message.as_bytes()).is_ok_and(|m| m.verify_slice(&expected).is_ok())
}
