//! # parley-envelope
//!
//! The symmetric envelope: AES-256-GCM sealing of typed messages into
//! `ENCRYPTED` wrappers with sequence-bound associated data, the matching
//! unseal path with replay rejection, and the sequence-less server envelope
//! for the client-to-relay link.

pub mod seal;

pub use seal::{Envelope, ENCRYPTABLE_KINDS, SERVER_ENCRYPTABLE_KINDS};

use parley_wire::tag::MessageTag;

/// Error types for envelope operations.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// No session key is stored for the conversation.
    #[error("no session for conversation {0}")]
    NoSession(String),

    /// The AEAD tag did not verify: tampered ciphertext, nonce, sequence,
    /// or a stale key.
    #[error("authentication failed for conversation {0}")]
    Authentication(String),

    /// The inbound sequence was not strictly greater than the last accepted
    /// one. The message is dropped silently.
    #[error("replayed sequence {sequence} on conversation {conversation_id}")]
    Replay {
        conversation_id: String,
        sequence: u64,
    },

    /// The message kind is never sealed.
    #[error("message kind {0:?} is not encryptable")]
    NotEncryptable(MessageTag),

    /// The wrapper or inner payload failed to encode or decode.
    #[error(transparent)]
    Wire(#[from] parley_wire::WireError),

    /// Session store failure.
    #[error(transparent)]
    Session(#[from] parley_session::SessionError),
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;
