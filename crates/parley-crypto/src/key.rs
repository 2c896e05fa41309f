//! 256-bit symmetric session keys.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// Size of a session key in bytes (AES-256).
pub const SESSION_KEY_SIZE: usize = 32;

/// A symmetric session key. Zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct SessionKey {
    bytes: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    /// Generate a fresh random key.
    pub fn random() -> Self {
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Create from a byte slice, validating the length.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; SESSION_KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SESSION_KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self { bytes })
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.bytes
    }
}

// Key material never appears in logs.
impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_keys_differ() {
        assert_ne!(
            SessionKey::random().as_bytes(),
            SessionKey::random().as_bytes()
        );
    }

    #[test]
    fn test_from_slice_validates_length() {
        assert!(SessionKey::from_slice(&[0u8; 32]).is_ok());
        assert!(SessionKey::from_slice(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_debug_does_not_leak() {
        let key = SessionKey::random();
        assert_eq!(format!("{key:?}"), "SessionKey(..)");
    }
}
