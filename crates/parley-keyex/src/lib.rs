//! # parley-keyex
//!
//! The key-exchange engines:
//!
//! - [`private`] — one-round-trip ephemeral X25519 ECDH between peers, with
//!   deterministic resolution of simultaneous initiations
//! - [`group`] — admin-generated group keys distributed pairwise under the
//!   private session keys, rotated on every membership change
//! - [`composite`] — dispatches by target kind and inbound payload form
//! - [`server`] — the client-to-relay link exchange, both roles
//! - [`pending`] — the shared pending-exchange state machine and sweeper
//!
//! Engines have synchronous public methods guarded by interior locks;
//! outbound messages leave through a non-blocking queue and callers await
//! completion through one-shot channels completed by the engines.

pub mod composite;
pub mod group;
pub mod pending;
pub mod private;
pub mod server;

use parley_types::UserId;

/// Error types for key-exchange operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum KeyExchangeError {
    /// The peer id is the local id, the relay, or otherwise not a valid target.
    #[error("invalid peer id: {0}")]
    InvalidPeerId(UserId),

    /// The peer's public key failed validation.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The peer's key was not in the expected X.509 SPKI encoding.
    #[error("unsupported key format: {0}")]
    UnsupportedKeyFormat(String),

    /// A non-terminal exchange with this target already exists.
    #[error("exchange already in progress with {0}")]
    ExchangeAlreadyInProgress(UserId),

    /// A response arrived with no matching initiated exchange.
    #[error("no pending exchange with {0}")]
    NoPendingExchange(UserId),

    /// The exchange TTL elapsed with no response.
    #[error("key exchange timed out: {0}")]
    Timeout(String),

    /// A cryptographic operation failed.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// The session store or outbound queue was unavailable.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// A session already exists for this target.
    #[error("session already exists for {0}")]
    SessionAlreadyExists(String),

    /// No session exists where one is required.
    #[error("no session for {0}")]
    NoSession(String),

    /// The peer violated the exchange protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The engine is shutting down; outstanding waits are abandoned.
    #[error("service shutting down")]
    ServiceShutdown,

    /// Invariant breakage that should not occur in normal operation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl KeyExchangeError {
    /// Whether the caller may retry the operation. Timeouts, storage
    /// failures, and transient crypto failures are retryable; protocol and
    /// validation failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            KeyExchangeError::Timeout(_)
                | KeyExchangeError::CryptoFailure(_)
                | KeyExchangeError::StorageFailure(_)
        )
    }
}

impl From<parley_crypto::CryptoError> for KeyExchangeError {
    fn from(err: parley_crypto::CryptoError) -> Self {
        match err {
            parley_crypto::CryptoError::UnsupportedKeyFormat(msg) => {
                KeyExchangeError::UnsupportedKeyFormat(msg)
            }
            parley_crypto::CryptoError::InvalidPublicKey(msg) => {
                KeyExchangeError::InvalidPublicKey(msg)
            }
            other => KeyExchangeError::CryptoFailure(other.to_string()),
        }
    }
}

impl From<parley_session::SessionError> for KeyExchangeError {
    fn from(err: parley_session::SessionError) -> Self {
        match err {
            parley_session::SessionError::NoSession(conv) => KeyExchangeError::NoSession(conv),
            parley_session::SessionError::Storage(msg) => KeyExchangeError::StorageFailure(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, KeyExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability_flags() {
        assert!(KeyExchangeError::Timeout("x".into()).is_recoverable());
        assert!(KeyExchangeError::CryptoFailure("x".into()).is_recoverable());
        assert!(KeyExchangeError::StorageFailure("x".into()).is_recoverable());

        assert!(!KeyExchangeError::InvalidPeerId(1).is_recoverable());
        assert!(!KeyExchangeError::ProtocolViolation("x".into()).is_recoverable());
        assert!(!KeyExchangeError::ServiceShutdown.is_recoverable());
    }
}
