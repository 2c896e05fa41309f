//! Message-id generation.
//!
//! Ids are opaque strings derived by hashing the sender id and timestamp.
//! A process-local counter is folded into the hash so that two messages
//! produced by the same user within the same millisecond still get distinct
//! ids. Uniqueness is required; cryptographic strength is not.
//!
//! The generator is an explicit dependency handed to the codec and the
//! controllers at startup; there is no process-wide instance.

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::UserId;

/// Generates globally unique, opaque message ids.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    counter: AtomicU64,
}

impl MessageIdGenerator {
    /// Create a generator with its counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate an id for a message sent by `user_id` at `timestamp_ms`.
    pub fn generate(&self, user_id: UserId, timestamp_ms: u64) -> String {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);

        let mut hasher = Sha256::new();
        hasher.update(user_id.to_be_bytes());
        hasher.update(timestamp_ms.to_be_bytes());
        hasher.update(count.to_be_bytes());
        let digest = hasher.finalize();

        hex::encode(&digest[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct_within_same_millisecond() {
        let generator = MessageIdGenerator::new();
        let a = generator.generate(1, 1_000);
        let b = generator.generate(1, 1_000);
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_shape() {
        let generator = MessageIdGenerator::new();
        let id = generator.generate(42, 1_700_000_000_000);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_senders_differ() {
        let generator = MessageIdGenerator::new();
        let a = generator.generate(1, 1_000);
        let b = generator.generate(2, 1_000);
        assert_ne!(a, b);
    }
}
