//! The pending-command table.
//!
//! Every outbound message that expects an acknowledgment registers here
//! keyed by `message_id`. The matching `MESSAGE_ACK` completes the entry's
//! one-shot future; a periodic sweep expires entries whose TTL elapsed,
//! completing them as failed with a timeout reason.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parley_types::MessageStatus;
use tokio::sync::oneshot;

/// Terminal outcome of a tracked command.
#[derive(Clone, Debug, PartialEq)]
pub struct AckOutcome {
    /// Status reported by the acknowledgment (or synthesized on expiry).
    pub status: MessageStatus,
    /// Failure reason, when `status` is `Failed` or `Critical`.
    pub reason: Option<String>,
    /// Extra acknowledgment data (e.g. the assigned group id).
    pub extras: serde_json::Value,
}

struct PendingCommand {
    sent_at: Instant,
    completion: oneshot::Sender<AckOutcome>,
}

/// Commands awaiting acknowledgment, keyed by message id.
pub struct PendingCommandTable {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingCommand>>,
}

impl PendingCommandTable {
    /// Create a table with the given command TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Track a command. The returned future resolves with the ack outcome
    /// or a synthesized timeout failure.
    pub fn register(&self, message_id: &str) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                message_id.to_string(),
                PendingCommand {
                    sent_at: Instant::now(),
                    completion: tx,
                },
            );
        }
        rx
    }

    /// Complete a command from an acknowledgment. Returns whether a pending
    /// entry existed.
    pub fn complete(
        &self,
        message_id: &str,
        status: MessageStatus,
        reason: Option<String>,
        extras: serde_json::Value,
    ) -> bool {
        let entry = match self.entries.lock() {
            Ok(mut entries) => entries.remove(message_id),
            Err(_) => None,
        };
        match entry {
            Some(command) => {
                let _ = command.completion.send(AckOutcome {
                    status,
                    reason,
                    extras,
                });
                true
            }
            None => false,
        }
    }

    /// Expire entries older than the TTL, completing them as failed.
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<PendingCommand> = match self.entries.lock() {
            Ok(mut entries) => {
                let ids: Vec<String> = entries
                    .iter()
                    .filter(|(_, c)| now.duration_since(c.sent_at) >= self.ttl)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| entries.remove(&id))
                    .collect()
            }
            Err(_) => return,
        };

        for command in expired {
            let _ = command.completion.send(AckOutcome {
                status: MessageStatus::Failed,
                reason: Some("ack timeout".to_string()),
                extras: serde_json::Value::Null,
            });
        }
    }

    /// Complete everything as failed, for shutdown.
    pub fn drain(&self, reason: &str) {
        let drained: Vec<PendingCommand> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().map(|(_, c)| c).collect(),
            Err(_) => return,
        };
        for command in drained {
            let _ = command.completion.send(AckOutcome {
                status: MessageStatus::Failed,
                reason: Some(reason.to_string()),
                extras: serde_json::Value::Null,
            });
        }
    }

    /// Number of commands awaiting acknowledgment.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether no commands are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic expiry sweeper.
    pub fn spawn_sweeper(
        table: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                table.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_completes_command() {
        let table = PendingCommandTable::new(Duration::from_secs(15));
        let waiter = table.register("m1");

        assert!(table.complete("m1", MessageStatus::Delivered, None, serde_json::json!({})));
        let outcome = waiter.await.expect("completed");
        assert_eq!(outcome.status, MessageStatus::Delivered);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ack_ignored() {
        let table = PendingCommandTable::new(Duration::from_secs(15));
        assert!(!table.complete("missing", MessageStatus::Sent, None, serde_json::json!({})));
    }

    #[tokio::test]
    async fn test_expired_command_fails_with_timeout() {
        let table = PendingCommandTable::new(Duration::ZERO);
        let waiter = table.register("m1");

        table.sweep();

        let outcome = waiter.await.expect("completed");
        assert_eq!(outcome.status, MessageStatus::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("ack timeout"));
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_commands() {
        let table = PendingCommandTable::new(Duration::from_secs(15));
        let _waiter = table.register("m1");

        table.sweep();
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_fails_everything() {
        let table = PendingCommandTable::new(Duration::from_secs(15));
        let w1 = table.register("m1");
        let w2 = table.register("m2");

        table.drain("shutting down");

        for waiter in [w1, w2] {
            let outcome = waiter.await.expect("completed");
            assert_eq!(outcome.status, MessageStatus::Failed);
            assert_eq!(outcome.reason.as_deref(), Some("shutting down"));
        }
    }
}
