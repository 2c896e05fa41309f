//! # parley-crypto
//!
//! Cryptographic primitives for the Parley protocol. The suite is fixed —
//! no algorithm negotiation is permitted:
//!
//! - [`x25519`] — X25519 key agreement (RFC 7748) with X.509 SPKI key encoding
//! - [`kdf`] — HKDF-SHA256 session-key derivation (RFC 5869)
//! - [`aead`] — AES-256-GCM authenticated encryption
//! - [`key`] — 256-bit symmetric session keys

pub mod aead;
pub mod kdf;
pub mod key;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD authentication failed")]
    Authentication,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// A public key was not in the expected X.509 SPKI encoding.
    #[error("unsupported key format: {0}")]
    UnsupportedKeyFormat(String),

    /// A public key failed validation.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
