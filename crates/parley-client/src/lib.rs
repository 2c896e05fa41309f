//! # parley-client
//!
//! The chat client: connects to the relay, runs the reader/writer tasks,
//! wires the key-exchange engines to the router and event bus, and exposes
//! the messaging API (`send_text`, `initiate_secure_conversation`, group
//! management, contact requests).

pub mod client;
pub mod config;
pub mod handlers;

pub use client::Client;
pub use config::ClientConfig;

/// Client error types.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] parley_wire::WireError),

    #[error(transparent)]
    Envelope(#[from] parley_envelope::EnvelopeError),

    #[error(transparent)]
    KeyExchange(#[from] parley_keyex::KeyExchangeError),

    #[error(transparent)]
    Session(#[from] parley_session::SessionError),

    #[error(transparent)]
    KeyStore(#[from] parley_keystore::KeyStoreError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
