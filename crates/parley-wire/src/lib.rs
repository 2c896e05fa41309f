//! # parley-wire
//!
//! Wire codec for the Parley relay protocol:
//!
//! - **Packet framing** via [`packet`] — `[tag:1][from:4 BE][to:4 BE][len:4 BE][payload]`
//! - **Typed messages** via [`message`] — one sum type, one match in the decoder,
//!   kind-specific payload codecs on the variants
//! - **Tag registry** via [`tag`]
//!
//! Control messages use ASCII pipe-delimited text payloads for ease of
//! debugging; encrypted wrappers and server key exchange use binary payloads
//! where base64 bloat would hurt.

pub mod message;
pub mod packet;
pub mod tag;

/// Error types for wire encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The frame ended before the 13-byte packet header was complete.
    #[error("truncated packet header")]
    TruncatedHeader,

    /// The tag byte does not correspond to a registered message kind.
    #[error("unknown message tag: {0:#04x}")]
    UnknownTag(u8),

    /// The declared payload size does not match the frame.
    #[error("payload size mismatch: declared {declared}, actual {actual}")]
    PayloadSizeMismatch { declared: usize, actual: usize },

    /// The payload bytes do not decode as the tagged kind.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A required field was unset at encode time.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// I/O error on the framed stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
