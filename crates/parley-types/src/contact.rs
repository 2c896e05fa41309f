//! Contact requests exchanged between users.

use serde::{Deserialize, Serialize};

use crate::{UserId, CONTACT_REQUEST_TTL_SECS};

/// Lifecycle state of a contact request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactRequestStatus {
    /// Awaiting a response from the receiver.
    Pending,
    /// The receiver accepted.
    Accepted,
    /// The receiver rejected.
    Rejected,
    /// The TTL elapsed with no response.
    Expired,
}

/// A contact request from one user to another.
///
/// Requests expire after a fixed TTL (7 days by default); the relay rejects
/// responses to expired requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRequest {
    /// Unique request identifier.
    pub request_id: String,
    /// The requesting user.
    pub sender_id: UserId,
    /// The user being asked.
    pub receiver_id: UserId,
    /// Creation time, epoch milliseconds UTC.
    pub timestamp_ms: u64,
    /// Expiry time, epoch milliseconds UTC.
    pub expires_at_ms: u64,
    /// Current lifecycle state.
    pub status: ContactRequestStatus,
}

impl ContactRequest {
    /// Create a pending request with the default TTL.
    pub fn new(
        request_id: impl Into<String>,
        sender_id: UserId,
        receiver_id: UserId,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            sender_id,
            receiver_id,
            timestamp_ms,
            expires_at_ms: timestamp_ms + CONTACT_REQUEST_TTL_SECS * 1000,
            status: ContactRequestStatus::Pending,
        }
    }

    /// Whether the request has passed its expiry time.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_is_pending() {
        let req = ContactRequest::new("req-1", 1, 2, 1_000);
        assert_eq!(req.status, ContactRequestStatus::Pending);
        assert_eq!(req.expires_at_ms, 1_000 + CONTACT_REQUEST_TTL_SECS * 1000);
    }

    #[test]
    fn test_expiry() {
        let req = ContactRequest::new("req-1", 1, 2, 1_000);
        assert!(!req.is_expired(1_001));
        assert!(req.is_expired(req.expires_at_ms));
    }
}
