//! HKDF-SHA256 session-key derivation (RFC 5869).
//!
//! Both parties of an exchange derive the session key from the X25519 shared
//! secret with the canonical conversation id as the `info` input, so the key
//! comes out identical regardless of who initiated. The salt is a fixed
//! all-zero block; the input keying material is already high-entropy.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::key::{SessionKey, SESSION_KEY_SIZE};
use crate::x25519::SharedSecret;
use crate::{CryptoError, Result};

/// Fixed HKDF salt.
const ZERO_SALT: [u8; 32] = [0u8; 32];

/// Derive a 32-byte session key from an X25519 shared secret.
///
/// The `conversation_id` binds the key to its scope: two conversations
/// deriving from the same shared secret still end up with distinct keys.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_session_key(shared: &SharedSecret, conversation_id: &str) -> Result<SessionKey> {
    let hk = Hkdf::<Sha256>::new(Some(&ZERO_SALT), shared.as_bytes());
    let mut okm = [0u8; SESSION_KEY_SIZE];
    hk.expand(conversation_id.as_bytes(), &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(SessionKey::from_bytes(okm))
}
