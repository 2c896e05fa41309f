//! The session key store.
//!
//! One interior lock guards the whole table, which makes every operation —
//! in particular a key replacement and its counter reset — atomic with
//! respect to concurrent `next_send_seq` calls. Critical sections are a few
//! loads and stores; contention is negligible next to socket I/O.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use parley_crypto::key::SessionKey;
use parley_types::REKEY_THRESHOLD;

use crate::{Result, SessionError};

/// One active session.
struct SessionEntry {
    key: SessionKey,
    /// Next outbound sequence number to hand out.
    send_seq: u64,
    /// Last accepted inbound sequence number. `None` until the first accept.
    recv_seq: Option<u64>,
    created_at: Instant,
    sent: u64,
    received: u64,
}

impl SessionEntry {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            send_seq: 0,
            recv_seq: None,
            created_at: Instant::now(),
            sent: 0,
            received: 0,
        }
    }
}

/// Counters and age for one session, as returned by [`SessionKeyStore::stats`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStats {
    /// Messages sealed under this key.
    pub sent: u64,
    /// Messages accepted under this key.
    pub received: u64,
    /// Next outbound sequence number.
    pub send_seq: u64,
    /// Last accepted inbound sequence number.
    pub recv_seq: Option<u64>,
    /// Time since the key was stored.
    pub age: Duration,
}

/// Single authority for session keys and sequence counters.
///
/// All methods are safe for concurrent callers.
pub struct SessionKeyStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    rekey_threshold: u64,
}

impl Default for SessionKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionKeyStore {
    /// Create a store with the standard rekey threshold (2^30).
    pub fn new() -> Self {
        Self::with_rekey_threshold(REKEY_THRESHOLD)
    }

    /// Create a store with a custom rekey threshold (used by tests).
    pub fn with_rekey_threshold(rekey_threshold: u64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            rekey_threshold,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, SessionEntry>>> {
        self.sessions
            .lock()
            .map_err(|e| SessionError::Storage(e.to_string()))
    }

    /// Insert or replace the key for a conversation, resetting both sequence
    /// counters to zero. The replacement is atomic with respect to any
    /// concurrent [`next_send_seq`](Self::next_send_seq).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] only if the store lock is poisoned.
    pub fn store(&self, conversation_id: &str, key: SessionKey) -> Result<()> {
        let mut sessions = self.lock()?;
        let replaced = sessions
            .insert(conversation_id.to_string(), SessionEntry::new(key))
            .is_some();
        tracing::debug!(conversation_id, replaced, "session key stored");
        Ok(())
    }

    /// Fetch the key for a conversation.
    pub fn get_key(&self, conversation_id: &str) -> Option<SessionKey> {
        self.lock()
            .ok()
            .and_then(|sessions| sessions.get(conversation_id).map(|e| e.key.clone()))
    }

    /// Whether a session exists for the conversation.
    pub fn has_session(&self, conversation_id: &str) -> bool {
        self.lock()
            .map(|sessions| sessions.contains_key(conversation_id))
            .unwrap_or(false)
    }

    /// Hand out the next outbound sequence number (fetch-and-add from 0).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoSession`] if no key is stored.
    pub fn next_send_seq(&self, conversation_id: &str) -> Result<u64> {
        let mut sessions = self.lock()?;
        let entry = sessions
            .get_mut(conversation_id)
            .ok_or_else(|| SessionError::NoSession(conversation_id.to_string()))?;
        let seq = entry.send_seq;
        entry.send_seq += 1;
        entry.sent += 1;
        Ok(seq)
    }

    /// Accept `incoming_seq` iff it is strictly greater than the last
    /// accepted inbound sequence, updating the watermark on acceptance.
    ///
    /// Returns `false` for replays, out-of-order deliveries, and unknown
    /// conversations. The window is strict `>`; an in-order transport is
    /// assumed underneath.
    pub fn validate_recv_seq(&self, conversation_id: &str, incoming_seq: u64) -> bool {
        let Ok(mut sessions) = self.lock() else {
            return false;
        };
        let Some(entry) = sessions.get_mut(conversation_id) else {
            return false;
        };
        match entry.recv_seq {
            Some(last) if incoming_seq <= last => false,
            _ => {
                entry.recv_seq = Some(incoming_seq);
                entry.received += 1;
                true
            }
        }
    }

    /// Remove a session. Returns whether one was present.
    pub fn remove(&self, conversation_id: &str) -> bool {
        let removed = self
            .lock()
            .map(|mut sessions| sessions.remove(conversation_id).is_some())
            .unwrap_or(false);
        if removed {
            tracing::debug!(conversation_id, "session key removed");
        }
        removed
    }

    /// Counters and age for a conversation.
    pub fn stats(&self, conversation_id: &str) -> Option<SessionStats> {
        self.lock().ok().and_then(|sessions| {
            sessions.get(conversation_id).map(|e| SessionStats {
                sent: e.sent,
                received: e.received,
                send_seq: e.send_seq,
                recv_seq: e.recv_seq,
                age: e.created_at.elapsed(),
            })
        })
    }

    /// Whether either sequence counter has reached the rekey threshold.
    pub fn should_rotate(&self, conversation_id: &str) -> bool {
        self.lock()
            .ok()
            .and_then(|sessions| {
                sessions.get(conversation_id).map(|e| {
                    e.send_seq >= self.rekey_threshold
                        || e.recv_seq.is_some_and(|r| r >= self.rekey_threshold)
                })
            })
            .unwrap_or(false)
    }

    /// Snapshot of all conversation ids with stored keys.
    pub fn conversation_ids(&self) -> Vec<String> {
        self.lock()
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(byte: u8) -> SessionKey {
        SessionKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_send_sequences_are_contiguous_from_zero() {
        let store = SessionKeyStore::new();
        store.store("private_1_2", key(1)).expect("store");

        for expected in 0..5u64 {
            assert_eq!(store.next_send_seq("private_1_2").expect("seq"), expected);
        }
    }

    #[test]
    fn test_next_send_seq_requires_session() {
        let store = SessionKeyStore::new();
        assert!(matches!(
            store.next_send_seq("private_1_2"),
            Err(SessionError::NoSession(_))
        ));
    }

    #[test]
    fn test_replay_rejected_after_accept() {
        let store = SessionKeyStore::new();
        store.store("private_1_2", key(1)).expect("store");

        assert!(store.validate_recv_seq("private_1_2", 0));
        assert!(!store.validate_recv_seq("private_1_2", 0));
        assert!(store.validate_recv_seq("private_1_2", 3));
        assert!(!store.validate_recv_seq("private_1_2", 2));
        assert!(!store.validate_recv_seq("private_1_2", 3));
        assert!(store.validate_recv_seq("private_1_2", 4));
    }

    #[test]
    fn test_store_resets_counters() {
        let store = SessionKeyStore::new();
        store.store("private_1_2", key(1)).expect("store");
        store.next_send_seq("private_1_2").expect("seq");
        store.next_send_seq("private_1_2").expect("seq");
        assert!(store.validate_recv_seq("private_1_2", 9));

        store.store("private_1_2", key(2)).expect("replace");
        assert_eq!(store.next_send_seq("private_1_2").expect("seq"), 0);
        assert!(store.validate_recv_seq("private_1_2", 0));
    }

    #[test]
    fn test_should_rotate_at_threshold() {
        let store = SessionKeyStore::with_rekey_threshold(3);
        store.store("c", key(1)).expect("store");
        assert!(!store.should_rotate("c"));

        for _ in 0..3 {
            store.next_send_seq("c").expect("seq");
        }
        assert!(store.should_rotate("c"));
    }

    #[test]
    fn test_should_rotate_on_recv_watermark() {
        let store = SessionKeyStore::with_rekey_threshold(100);
        store.store("c", key(1)).expect("store");
        assert!(store.validate_recv_seq("c", 100));
        assert!(store.should_rotate("c"));
    }

    #[test]
    fn test_stats_counters() {
        let store = SessionKeyStore::new();
        store.store("c", key(1)).expect("store");
        store.next_send_seq("c").expect("seq");
        store.next_send_seq("c").expect("seq");
        assert!(store.validate_recv_seq("c", 0));

        let stats = store.stats("c").expect("stats");
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.received, 1);
        assert_eq!(stats.send_seq, 2);
        assert_eq!(stats.recv_seq, Some(0));
    }

    #[test]
    fn test_remove() {
        let store = SessionKeyStore::new();
        store.store("c", key(1)).expect("store");
        assert!(store.remove("c"));
        assert!(!store.remove("c"));
        assert!(!store.has_session("c"));
    }

    #[test]
    fn test_concurrent_send_seq_unique_and_gap_free() {
        let store = Arc::new(SessionKeyStore::new());
        store.store("c", key(1)).expect("store");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..100 {
                    seen.push(store.next_send_seq("c").expect("seq"));
                }
                seen
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread"))
            .collect();
        all.sort_unstable();
        let expected: Vec<u64> = (0..800).collect();
        assert_eq!(all, expected);
    }
}
