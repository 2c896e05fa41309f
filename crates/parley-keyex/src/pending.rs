//! Pending-exchange records and their lifecycle.
//!
//! Each engine owns a table of in-flight exchanges keyed by target id. All
//! state transitions for one target happen under the table lock, so each
//! entry has a single writer at a time. A periodic sweeper expires stale
//! `Initiated` entries and prunes terminal ones.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parley_crypto::x25519::ExchangeKeypair;
use parley_types::UserId;

/// State of an in-flight exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    /// We sent the request and are waiting for the response.
    Initiated,
    /// A request arrived and is being processed.
    Received,
    /// The session key was stored.
    Completed,
    /// The exchange failed.
    Failed,
    /// The TTL elapsed with no response.
    Expired,
}

impl ExchangeState {
    /// Terminal states are garbage-collected; non-terminal ones block a new
    /// initiation for the same target.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeState::Completed | ExchangeState::Failed | ExchangeState::Expired
        )
    }
}

/// One in-flight ECDH exchange.
pub struct PendingKeyExchange {
    /// The exchange target.
    pub peer_id: UserId,
    /// Our ephemeral keypair for this round.
    pub keypair: ExchangeKeypair,
    /// Whether we initiated.
    pub is_initiator: bool,
    /// Current state.
    pub state: ExchangeState,
    /// When the exchange was created.
    pub started_at: Instant,
    /// When the state last changed, for terminal-state pruning.
    pub state_changed_at: Instant,
}

impl PendingKeyExchange {
    /// Create a fresh record in the given state.
    pub fn new(peer_id: UserId, keypair: ExchangeKeypair, is_initiator: bool, state: ExchangeState) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            keypair,
            is_initiator,
            state,
            started_at: now,
            state_changed_at: now,
        }
    }

    /// Transition to a new state.
    pub fn transition(&mut self, state: ExchangeState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }
}

/// Result of one sweep pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Targets whose `Initiated` exchange just expired.
    pub expired: Vec<UserId>,
    /// Number of terminal entries pruned.
    pub pruned: usize,
}

/// Expire stale non-terminal entries and prune old terminal ones.
///
/// `ttl` bounds how long an `Initiated`/`Received` exchange may wait for
/// progress; terminal entries are removed once older than `gc_after`.
pub fn sweep(
    table: &mut HashMap<UserId, PendingKeyExchange>,
    ttl: Duration,
    gc_after: Duration,
) -> SweepOutcome {
    let now = Instant::now();
    let mut outcome = SweepOutcome::default();

    for entry in table.values_mut() {
        if !entry.state.is_terminal() && now.duration_since(entry.started_at) >= ttl {
            entry.transition(ExchangeState::Expired);
            outcome.expired.push(entry.peer_id);
        }
    }

    let before = table.len();
    table.retain(|_, entry| {
        !(entry.state.is_terminal() && now.duration_since(entry.state_changed_at) >= gc_after)
    });
    outcome.pruned = before - table.len();

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(peer: UserId, state: ExchangeState) -> PendingKeyExchange {
        PendingKeyExchange::new(peer, ExchangeKeypair::generate(), true, state)
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ExchangeState::Initiated.is_terminal());
        assert!(!ExchangeState::Received.is_terminal());
        assert!(ExchangeState::Completed.is_terminal());
        assert!(ExchangeState::Failed.is_terminal());
        assert!(ExchangeState::Expired.is_terminal());
    }

    #[test]
    fn test_sweep_expires_stale_initiated() {
        let mut table = HashMap::new();
        table.insert(9, entry(9, ExchangeState::Initiated));

        let outcome = sweep(&mut table, Duration::ZERO, Duration::from_secs(10));
        assert_eq!(outcome.expired, vec![9]);
        assert_eq!(table.get(&9).map(|e| e.state), Some(ExchangeState::Expired));
    }

    #[test]
    fn test_sweep_prunes_old_terminal() {
        let mut table = HashMap::new();
        table.insert(3, entry(3, ExchangeState::Completed));

        let outcome = sweep(&mut table, Duration::from_secs(30), Duration::ZERO);
        assert!(outcome.expired.is_empty());
        assert_eq!(outcome.pruned, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_sweep_keeps_fresh_entries() {
        let mut table = HashMap::new();
        table.insert(1, entry(1, ExchangeState::Initiated));
        table.insert(2, entry(2, ExchangeState::Completed));

        let outcome = sweep(
            &mut table,
            Duration::from_secs(30),
            Duration::from_secs(10),
        );
        assert!(outcome.expired.is_empty());
        assert_eq!(outcome.pruned, 0);
        assert_eq!(table.len(), 2);
    }
}
