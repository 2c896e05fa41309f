//! # parley-server
//!
//! The relay: accepts client connections, runs the server-link key
//! exchange per connection, registers accounts, forwards client-to-client
//! packets without inspecting sealed payloads, fans out group membership
//! changes, and reports validation failures through server-generated
//! acknowledgments.
//!
//! The relay never holds end-to-end keys; `ENCRYPTED` payloads pass through
//! it as opaque bytes.

pub mod config;
pub mod context;
pub mod relay;

pub use config::ServerConfig;
pub use context::{ConnectionRegistry, Outbound, ServerContext};
pub use relay::RelayServer;

/// Relay error types.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] parley_wire::WireError),

    #[error(transparent)]
    Envelope(#[from] parley_envelope::EnvelopeError),

    #[error(transparent)]
    KeyExchange(#[from] parley_keyex::KeyExchangeError),

    #[error("repository failure: {0}")]
    Repository(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<parley_types::repository::RepositoryError> for ServerError {
    fn from(err: parley_types::repository::RepositoryError) -> Self {
        ServerError::Repository(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
