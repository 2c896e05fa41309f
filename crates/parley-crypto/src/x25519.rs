//! X25519 key agreement (RFC 7748).
//!
//! Used for peer-to-peer session negotiation and for the client-to-relay
//! link. Public keys travel on the wire in X.509 SubjectPublicKeyInfo
//! encoding — base64 text in the peer exchange kinds, raw bytes in the
//! server exchange kinds.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// DER prefix of a SubjectPublicKeyInfo wrapping an X25519 public key
/// (SEQUENCE, AlgorithmIdentifier id-X25519, BIT STRING header).
const SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

/// Total length of an X25519 SPKI encoding.
pub const SPKI_LEN: usize = SPKI_PREFIX.len() + 32;

/// An X25519 secret key held for the duration of one exchange. Zeroed on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct ExchangeSecret {
    inner: StaticSecret,
}

/// An X25519 public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangePublicKey {
    bytes: [u8; 32],
}

/// An X25519 shared secret. Zeroed on drop.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

/// An ephemeral keypair tracked by a pending key exchange.
#[derive(Clone)]
pub struct ExchangeKeypair {
    secret: ExchangeSecret,
    public: ExchangePublicKey,
}

impl ExchangeSecret {
    /// Generate a new random secret.
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Compute the corresponding public key.
    pub fn public_key(&self) -> ExchangePublicKey {
        let pk = PublicKey::from(&self.inner);
        ExchangePublicKey {
            bytes: pk.to_bytes(),
        }
    }

    /// Perform Diffie-Hellman key agreement.
    pub fn diffie_hellman(&self, their_public: &ExchangePublicKey) -> SharedSecret {
        let pk = PublicKey::from(their_public.bytes);
        let shared = self.inner.diffie_hellman(&pk);
        SharedSecret {
            bytes: *shared.as_bytes(),
        }
    }
}

impl ExchangePublicKey {
    /// Create from raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Encode as X.509 SubjectPublicKeyInfo.
    pub fn to_spki(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SPKI_LEN);
        out.extend_from_slice(&SPKI_PREFIX);
        out.extend_from_slice(&self.bytes);
        out
    }

    /// Decode from X.509 SubjectPublicKeyInfo.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedKeyFormat`] if the bytes are not an
    /// X25519 SPKI structure, and [`CryptoError::InvalidPublicKey`] if the
    /// embedded key is the all-zero point.
    pub fn from_spki(spki: &[u8]) -> Result<Self> {
        if spki.len() != SPKI_LEN {
            return Err(CryptoError::UnsupportedKeyFormat(format!(
                "expected {SPKI_LEN}-byte X25519 SPKI, got {} bytes",
                spki.len()
            )));
        }
        if spki[..SPKI_PREFIX.len()] != SPKI_PREFIX {
            return Err(CryptoError::UnsupportedKeyFormat(
                "not an X25519 SubjectPublicKeyInfo".to_string(),
            ));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&spki[SPKI_PREFIX.len()..]);
        if bytes == [0u8; 32] {
            return Err(CryptoError::InvalidPublicKey(
                "all-zero public key".to_string(),
            ));
        }
        Ok(Self { bytes })
    }
}

impl ExchangeKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let secret = ExchangeSecret::random();
        let public = secret.public_key();
        Self { secret, public }
    }

    /// The public half.
    pub fn public_key(&self) -> &ExchangePublicKey {
        &self.public
    }

    /// Perform Diffie-Hellman with the peer's public key.
    pub fn diffie_hellman(&self, their_public: &ExchangePublicKey) -> SharedSecret {
        self.secret.diffie_hellman(their_public)
    }
}

impl SharedSecret {
    /// Raw shared-secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diffie_hellman_agreement() {
        let alice = ExchangeKeypair::generate();
        let bob = ExchangeKeypair::generate();

        let alice_shared = alice.diffie_hellman(bob.public_key());
        let bob_shared = bob.diffie_hellman(alice.public_key());

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_spki_roundtrip() {
        let keypair = ExchangeKeypair::generate();
        let spki = keypair.public_key().to_spki();
        assert_eq!(spki.len(), SPKI_LEN);

        let restored = ExchangePublicKey::from_spki(&spki).expect("decode SPKI");
        assert_eq!(&restored, keypair.public_key());
    }

    #[test]
    fn test_spki_rejects_wrong_prefix() {
        let keypair = ExchangeKeypair::generate();
        let mut spki = keypair.public_key().to_spki();
        spki[3] ^= 0xFF;
        assert!(ExchangePublicKey::from_spki(&spki).is_err());
    }

    #[test]
    fn test_spki_rejects_wrong_length() {
        assert!(ExchangePublicKey::from_spki(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_spki_rejects_zero_key() {
        let mut spki = Vec::new();
        spki.extend_from_slice(&super::SPKI_PREFIX);
        spki.extend_from_slice(&[0u8; 32]);
        assert!(ExchangePublicKey::from_spki(&spki).is_err());
    }

    #[test]
    fn test_rfc7748_section6_1() {
        // RFC 7748 Section 6.1 test vector
        let alice_private =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .expect("valid hex");
        let alice_public =
            hex::decode("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
                .expect("valid hex");

        let mut secret_bytes = [0u8; 32];
        secret_bytes.copy_from_slice(&alice_private);
        let secret = ExchangeSecret {
            inner: StaticSecret::from(secret_bytes),
        };
        assert_eq!(
            secret.public_key().as_bytes().as_slice(),
            alice_public.as_slice()
        );
    }
}
