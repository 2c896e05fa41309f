//! # parley-router
//!
//! Message routing and the surrounding plumbing:
//!
//! - [`router`] — a static table from message tag to handler, built at
//!   startup from handler declarations
//! - [`bus`] — the in-process event bus with synchronous and queued
//!   delivery modes
//! - [`commands`] — the pending-command table completing acknowledgment
//!   futures, with TTL expiry

pub mod bus;
pub mod commands;
pub mod router;

pub use bus::{DeliveryMode, EventBus};
pub use commands::{AckOutcome, PendingCommandTable};
pub use router::{HandlerContext, MessageHandler, Router, RouterBuilder};

use parley_wire::tag::MessageTag;

/// Error types for routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// No registered handler accepts this kind.
    #[error("no handler for message kind {0:?}")]
    NoHandler(MessageTag),

    /// A handler failed while processing a message.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The outbound queue is closed; the connection is gone.
    #[error("outbound queue closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, RouterError>;
