//! Event types published by message handlers to the in-process event bus.
//!
//! Handlers publish immutable event snapshots; subscribers receive them via
//! the bus in `parley-router`. The application front-end surfaces
//! [`Event::Error`] verbatim.

use serde::{Deserialize, Serialize};

use crate::contact::ContactRequest;
use crate::{GroupId, MessageStatus, UserId};

/// Severity attached to error events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// Discriminant of [`Event`], used as the subscription key on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionEstablished,
    TextReceived,
    MediaReceived,
    ContactRequestReceived,
    ContactRequestResponded,
    SecureSessionReady,
    SessionInvalidated,
    GroupKeyRotated,
    MemberAdded,
    MemberRemoved,
    AckReceived,
    Error,
}

/// An event published by a handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// The relay acknowledged the connection and assigned an account id.
    ConnectionEstablished { user_id: UserId },
    /// A text message was decrypted and delivered.
    TextReceived {
        from: UserId,
        to: UserId,
        message_id: String,
        timestamp_ms: u64,
        content: String,
    },
    /// A media message was decrypted and delivered.
    MediaReceived {
        from: UserId,
        to: UserId,
        message_id: String,
        filename: String,
        mime_type: String,
        bytes: Vec<u8>,
    },
    /// Another user asked to be a contact.
    ContactRequestReceived { request: ContactRequest },
    /// A previously sent contact request was answered.
    ContactRequestResponded {
        request_id: String,
        from: UserId,
        accepted: bool,
    },
    /// A session key was stored for a conversation.
    SecureSessionReady { conversation_id: String },
    /// A session was removed.
    SessionInvalidated {
        conversation_id: String,
        reason: String,
    },
    /// The admin rotated a group key.
    GroupKeyRotated { group_id: GroupId },
    /// The relay added a member to a group.
    MemberAdded { group_id: GroupId, member_id: UserId },
    /// The relay removed a member from a group.
    MemberRemoved { group_id: GroupId, member_id: UserId },
    /// An acknowledgment arrived for a message we sent.
    AckReceived {
        message_id: String,
        status: MessageStatus,
        reason: Option<String>,
    },
    /// An error surfaced to the application.
    Error {
        level: ErrorLevel,
        kind: String,
        message: String,
    },
}

impl Event {
    /// The discriminant used for bus subscription.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            Event::TextReceived { .. } => EventKind::TextReceived,
            Event::MediaReceived { .. } => EventKind::MediaReceived,
            Event::ContactRequestReceived { .. } => EventKind::ContactRequestReceived,
            Event::ContactRequestResponded { .. } => EventKind::ContactRequestResponded,
            Event::SecureSessionReady { .. } => EventKind::SecureSessionReady,
            Event::SessionInvalidated { .. } => EventKind::SessionInvalidated,
            Event::GroupKeyRotated { .. } => EventKind::GroupKeyRotated,
            Event::MemberAdded { .. } => EventKind::MemberAdded,
            Event::MemberRemoved { .. } => EventKind::MemberRemoved,
            Event::AckReceived { .. } => EventKind::AckReceived,
            Event::Error { .. } => EventKind::Error,
        }
    }

    /// Convenience constructor for decryption-failure warnings.
    pub fn decryption_error(message: impl Into<String>) -> Self {
        Event::Error {
            level: ErrorLevel::Warning,
            kind: "DECRYPTION_ERROR".to_string(),
            message: message.into(),
        }
    }
}

/// Capability to publish events.
///
/// Handlers and engines receive an `EventSink` at construction; event
/// publication is only reachable through it. The bus in `parley-router`
/// implements this trait.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// An [`EventSink`] that discards everything.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: Event) {}
}

/// An [`EventSink`] that buffers events in memory, for tests.
#[derive(Default)]
pub struct BufferedEventSink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl BufferedEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of buffered events of the given kind.
    pub fn count_of(&self, kind: EventKind) -> usize {
        self.snapshot().iter().filter(|e| e.kind() == kind).count()
    }
}

impl EventSink for BufferedEventSink {
    fn publish(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_sink_collects() {
        let sink = BufferedEventSink::new();
        sink.publish(Event::ConnectionEstablished { user_id: 1 });
        sink.publish(Event::decryption_error("x"));
        assert_eq!(sink.snapshot().len(), 2);
        assert_eq!(sink.count_of(EventKind::Error), 1);
    }

    #[test]
    fn test_kind_matches_variant() {
        let event = Event::ConnectionEstablished { user_id: 1 };
        assert_eq!(event.kind(), EventKind::ConnectionEstablished);

        let event = Event::decryption_error("replayed sequence");
        assert_eq!(event.kind(), EventKind::Error);
    }

    #[test]
    fn test_decryption_error_is_warning() {
        if let Event::Error { level, kind, .. } = Event::decryption_error("x") {
            assert_eq!(level, ErrorLevel::Warning);
            assert_eq!(kind, "DECRYPTION_ERROR");
        } else {
            unreachable!("constructor produced a non-error event");
        }
    }
}
