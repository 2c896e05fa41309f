//! # parley-types
//!
//! Shared domain types used across the Parley workspace: user, contact and
//! group records, repository traits, event types, and the message-id
//! generator injected into the codec and controllers at startup.

pub mod contact;
pub mod events;
pub mod group;
pub mod message_id;
pub mod repository;
pub mod user;

use serde::{Deserialize, Serialize};

/// A user account identifier. Ids greater than zero are user accounts.
pub type UserId = i32;

/// A group identifier.
pub type GroupId = i32;

/// The reserved id of the relay server.
pub const SERVER_ID: UserId = 0;

/// Default TCP port the relay listens on.
pub const DEFAULT_PORT: u16 = 1666;

/// Either sequence counter reaching this value triggers a rekey recommendation.
pub const REKEY_THRESHOLD: u64 = 1 << 30;

/// TTL for an in-flight key exchange, in seconds.
pub const KEY_EXCHANGE_TIMEOUT_SECS: u32 = 30;

/// How long the group engine waits for wrapped-key acknowledgments, in seconds.
pub const GROUP_ACK_TIMEOUT_SECS: u32 = 15;

/// Interval of the pending-state sweeper, in seconds.
pub const CLEANUP_INTERVAL_SECS: u32 = 5;

/// Default lifetime of a contact request (7 days), in seconds.
pub const CONTACT_REQUEST_TTL_SECS: u64 = 7 * 24 * 3600;

/// Maximum retries for recoverable key-exchange failures.
pub const MAX_RETRY_ATTEMPTS: u8 = 3;

/// Current time as epoch milliseconds UTC.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Delivery status carried by `MESSAGE_ACK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// The server processed the message.
    Sent,
    /// The peer received the message.
    Delivered,
    /// The peer user viewed the message.
    Read,
    /// Processing failed; the ack carries a reason.
    Failed,
    /// Unrecoverable failure; the connection is closed.
    Critical,
}

impl MessageStatus {
    /// Wire byte for this status.
    pub fn as_byte(self) -> u8 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
            MessageStatus::Failed => 3,
            MessageStatus::Critical => 4,
        }
    }

    /// Parse a wire byte into a status. Returns `None` for unknown bytes.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageStatus::Sent),
            1 => Some(MessageStatus::Delivered),
            2 => Some(MessageStatus::Read),
            3 => Some(MessageStatus::Failed),
            4 => Some(MessageStatus::Critical),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_byte_roundtrip() {
        for status in [
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
            MessageStatus::Critical,
        ] {
            assert_eq!(MessageStatus::from_byte(status.as_byte()), Some(status));
        }
    }

    #[test]
    fn test_unknown_status_byte() {
        assert_eq!(MessageStatus::from_byte(99), None);
    }
}
