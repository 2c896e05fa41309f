//! # parley-session
//!
//! The session key store: single authority for active session keys and
//! per-conversation sequence counters, plus the canonical conversation-id
//! scheme that names a key's scope.

pub mod conversation;
pub mod store;

pub use conversation::{group_conversation, private_conversation, server_conversation};
pub use store::{SessionKeyStore, SessionStats};

/// Error types for session store operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session is stored for the conversation.
    #[error("no session for conversation {0}")]
    NoSession(String),

    /// The store's lock was poisoned by a panicking thread.
    #[error("session store unavailable: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
