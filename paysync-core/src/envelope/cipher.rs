//! AES-256-GCM payload encryption for the notification envelope.
//!
//! Wire format: `iv(12) || ciphertext || auth_tag(16)`.

use super::EnvelopeError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Derive the AES key from the configured shared secret.
///
/// Secrets shorter than 32 bytes are left-padded with zero bytes; longer
/// secrets are truncated to their first 32 bytes.
pub fn derive_key(secret: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    if secret.len() >= KEY_LEN {
        key.copy_from_slice(&secret[..KEY_LEN]);
    } else {
        key[KEY_LEN - secret.len()..].copy_from_slice(secret);
    }
    key
}

/// Encrypt `plaintext`, returning `iv || ciphertext || tag`.
pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = Aes256Gcm::new(key.into());
    let iv = Aes256Gcm::generate_nonce(&mut OsRng);

    // aes-gcm appends the tag to the ciphertext
    let ciphertext_with_tag = cipher
        .encrypt(&iv, plaintext)
        .map_err(|e| EnvelopeError::ValidationFailed(format!("encryption failed: {}", e)))?;

    let mut blob = Vec::with_capacity(IV_LEN + ciphertext_with_tag.len());
    blob.extend_from_slice(iv.as_slice());
    blob.extend_from_slice(&ciphertext_with_tag);
    Ok(blob)
}

/// Decrypt an `iv || ciphertext || tag` blob.
pub fn decrypt(key: &[u8; KEY_LEN], blob: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if blob.len() < IV_LEN + TAG_LEN {
        return Err(EnvelopeError::DecryptionFailed);
    }

    let (iv, ciphertext_with_tag) = blob.split_at(IV_LEN);
    let cipher = Aes256Gcm::new(key.into());

    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext_with_tag)
        .map_err(|_| EnvelopeError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Zeroizing<[u8; KEY_LEN]> {
        derive_key(b"merchant-shared-secret")
    }

    #[test]
    fn short_secret_is_left_padded() {
        let key = derive_key(b"abc");
        assert_eq!(&key[..29], &[0u8; 29]);
        assert_eq!(&key[29..], b"abc");
    }

    #[test]
    fn long_secret_is_truncated() {
        let secret = [7u8; 40];
        assert_eq!(*derive_key(&secret), [7u8; 32]);
    }

    #[test]
    fn roundtrip_multibyte_text() {
        let key = key();
        for text in ["", "plain ascii", "Transfer Rp 500.000,01 ✓", "تحويل مصرفي", "銀行振込 🏦"] {
            let blob = encrypt(&key, text.as_bytes()).unwrap();
            assert_eq!(blob.len(), IV_LEN + text.len() + TAG_LEN);
            assert_eq!(decrypt(&key, &blob).unwrap(), text.as_bytes());
        }
    }

    #[test]
    fn every_single_bit_flip_is_detected() {
        let key = key();
        let blob = encrypt(&key, b"{\"amount\":500.01}").unwrap();
        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered[byte] ^= 1 << bit;
                assert!(matches!(
                    decrypt(&key, &tampered),
                    Err(EnvelopeError::DecryptionFailed)
                ));
            }
        }
    }

    #[test]
    fn wrong_key_fails() {
        let blob = encrypt(&key(), b"secret").unwrap();
        let other = derive_key(b"another-secret");
        assert!(decrypt(&other, &blob).is_err());
    }

    #[test]
    fn truncated_blob_fails() {
        assert!(decrypt(&key(), &[0u8; IV_LEN + TAG_LEN - 1]).is_err());
    }

    #[test]
    fn ivs_are_unique() {
        let key = key();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(&a[..IV_LEN], &b[..IV_LEN]);
    }
}
