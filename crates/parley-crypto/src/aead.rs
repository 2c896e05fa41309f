//! AES-256-GCM authenticated encryption.
//!
//! Every sealed payload uses a fresh 96-bit random nonce and a 128-bit tag.
//! Random nonces are safe within the collision bounds of the 2^96 nonce
//! space; no counter-based fallback is used.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::key::SessionKey;
use crate::{CryptoError, Result};

/// Nonce size for AES-256-GCM (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// Generate a fresh random nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt with AES-256-GCM.
///
/// # Arguments
///
/// * `key` - 32-byte session key
/// * `nonce` - 12-byte nonce (must never be reused with the same key)
/// * `plaintext` - data to encrypt
/// * `aad` - additional authenticated data (authenticated, not encrypted)
///
/// # Returns
///
/// Ciphertext with the 16-byte authentication tag appended.
pub fn encrypt(
    key: &SessionKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: 32,
            actual: key.as_bytes().len(),
        }
    })?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Authentication)
}

/// Decrypt with AES-256-GCM.
///
/// # Errors
///
/// Returns [`CryptoError::Authentication`] if the tag does not verify —
/// wrong key, tampered ciphertext, tampered nonce, or mismatched AAD.
pub fn decrypt(
    key: &SessionKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: 32,
            actual: key.as_bytes().len(),
        }
    })?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_bytes([0x42u8; 32])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let nonce = generate_nonce();
        let ciphertext = encrypt(&key(), &nonce, b"hello", b"seq:0").expect("encrypt");
        let plaintext = decrypt(&key(), &nonce, &ciphertext, b"seq:0").expect("decrypt");
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_ciphertext_has_tag() {
        let nonce = generate_nonce();
        let ciphertext = encrypt(&key(), &nonce, b"hi", &[]).expect("encrypt");
        assert_eq!(ciphertext.len(), 2 + TAG_SIZE);
    }

    #[test]
    fn test_wrong_key_fails() {
        let nonce = generate_nonce();
        let ciphertext = encrypt(&key(), &nonce, b"hello", &[]).expect("encrypt");
        let other = SessionKey::from_bytes([0x43u8; 32]);
        assert!(decrypt(&other, &nonce, &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let nonce = generate_nonce();
        let ciphertext = encrypt(&key(), &nonce, b"hello", b"seq:1").expect("encrypt");
        assert!(decrypt(&key(), &nonce, &ciphertext, b"seq:2").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let nonce = generate_nonce();
        let mut ciphertext = encrypt(&key(), &nonce, b"hello", &[]).expect("encrypt");
        ciphertext[0] ^= 0x01;
        assert!(decrypt(&key(), &nonce, &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let mut nonce = generate_nonce();
        let ciphertext = encrypt(&key(), &nonce, b"hello", &[]).expect("encrypt");
        nonce[0] ^= 0x01;
        assert!(decrypt(&key(), &nonce, &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_nonces_are_random() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
