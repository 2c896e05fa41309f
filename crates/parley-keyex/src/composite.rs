//! Composite dispatcher over the private and group engines.
//!
//! Routing rules:
//!
//! - `initiate` / `has_session` / `invalidate`: a group-repository lookup
//!   decides which engine owns the target id.
//! - Inbound key-exchange payloads route on their form: the group markers
//!   (`0xFF`/`0xFE`, already decoded into their payload variants) go to the
//!   group engine, public keys to the private engine.

use std::sync::Arc;
use std::time::Duration;

use parley_session::{group_conversation, private_conversation};
use parley_types::repository::GroupRepository;
use parley_types::UserId;
use parley_wire::message::{KeyExchangePayload, Message, MessageBody};

use crate::group::GroupKeyExchange;
use crate::private::PrivateKeyExchange;
use crate::{KeyExchangeError, Result};

/// Dispatches key-exchange traffic by target kind.
pub struct CompositeKeyExchange {
    private: Arc<PrivateKeyExchange>,
    group: Arc<GroupKeyExchange>,
    groups: Arc<dyn GroupRepository>,
}

impl CompositeKeyExchange {
    /// Create a dispatcher over the two engines.
    pub fn new(
        private: Arc<PrivateKeyExchange>,
        group: Arc<GroupKeyExchange>,
        groups: Arc<dyn GroupRepository>,
    ) -> Self {
        Self {
            private,
            group,
            groups,
        }
    }

    /// The private engine.
    pub fn private(&self) -> &Arc<PrivateKeyExchange> {
        &self.private
    }

    /// The group engine.
    pub fn group(&self) -> &Arc<GroupKeyExchange> {
        &self.group
    }

    /// Canonical conversation id for a target: group id if the repository
    /// knows it, private pair otherwise.
    pub fn conversation_for(&self, target: UserId) -> String {
        if self.groups.find_by_id(target).is_some() {
            group_conversation(target)
        } else {
            private_conversation(self.private.local_id(), target)
        }
    }

    /// Whether a session exists for the target.
    pub fn has_session(&self, target: UserId) -> bool {
        if self.groups.find_by_id(target).is_some() {
            self.group.has_session(target)
        } else {
            self.private.has_session(target)
        }
    }

    /// Establish a session with the target and wait for completion.
    ///
    /// For a group target the admin generates and distributes the key; for
    /// a peer the private protocol runs and this call resolves when the
    /// session is stored.
    ///
    /// # Errors
    ///
    /// Propagates engine errors; see [`PrivateKeyExchange::initiate`] and
    /// [`GroupKeyExchange::establish`].
    pub async fn initiate(&self, target: UserId) -> Result<()> {
        if let Some(group) = self.groups.find_by_id(target) {
            return self.group.establish(&group).await;
        }
        let waiter = self.private.initiate(target)?;
        waiter
            .await
            .map_err(|_| KeyExchangeError::Internal("exchange waiter dropped".to_string()))?
    }

    /// Invalidate the session for the target.
    pub fn invalidate(&self, target: UserId, reason: &str) {
        if self.groups.find_by_id(target).is_some() {
            self.group.invalidate(target, reason);
        } else {
            self.private.invalidate(target, reason);
        }
    }

    /// Route an inbound `KEY_EXCHANGE` / `KEY_EXCHANGE_RESPONSE` message.
    ///
    /// # Errors
    ///
    /// Returns [`KeyExchangeError::ProtocolViolation`] for non-key-exchange
    /// messages; engine errors otherwise.
    pub fn handle_message(&self, message: &Message) -> Result<()> {
        let from = message.meta.from;
        match &message.body {
            MessageBody::KeyExchange(KeyExchangePayload::PublicKey { spki }) => {
                self.private.handle_request(from, spki)
            }
            MessageBody::KeyExchange(KeyExchangePayload::GroupKey {
                group_id,
                encrypted_key,
            }) => self.group.handle_distribution(from, *group_id, encrypted_key),
            MessageBody::KeyExchange(KeyExchangePayload::GroupAck { group_id }) => {
                self.group.handle_ack(from, *group_id);
                Ok(())
            }
            MessageBody::KeyExchangeResponse { spki } => self.private.handle_response(from, spki),
            other => Err(KeyExchangeError::ProtocolViolation(format!(
                "not a key exchange message: {:?}",
                std::mem::discriminant(other)
            ))),
        }
    }

    /// One sweeper pass over both engines.
    pub fn sweep(&self) {
        self.private.sweep();
        self.group.sweep();
    }

    /// Complete outstanding waits with shutdown errors.
    pub fn shutdown(&self) {
        self.private.shutdown();
    }

    /// Spawn the periodic lifecycle sweeper.
    pub fn spawn_sweeper(this: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_crypto::key::SessionKey;
    use parley_session::SessionKeyStore;
    use parley_types::events::{EventSink, NullEventSink};
    use parley_types::group::Group;
    use parley_types::message_id::MessageIdGenerator;
    use parley_types::repository::InMemoryGroupRepository;
    use parley_wire::message::MessageMeta;
    use tokio::sync::mpsc;

    fn composite(
        local_id: UserId,
        groups: Arc<InMemoryGroupRepository>,
    ) -> (
        CompositeKeyExchange,
        Arc<SessionKeyStore>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let store = Arc::new(SessionKeyStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let ids = Arc::new(MessageIdGenerator::new());
        let events = Arc::new(NullEventSink) as Arc<dyn EventSink>;
        let private = Arc::new(PrivateKeyExchange::new(
            local_id,
            Arc::clone(&store),
            tx.clone(),
            Arc::clone(&ids),
            Arc::clone(&events),
        ));
        let group = Arc::new(GroupKeyExchange::new(
            local_id,
            Arc::clone(&store),
            Arc::clone(&private),
            tx,
            ids,
            events,
        ));
        (
            CompositeKeyExchange::new(private, group, groups),
            store,
            rx,
        )
    }

    #[tokio::test]
    async fn test_routing_by_group_repository() {
        let groups = Arc::new(InMemoryGroupRepository::new());
        groups.add(Group::new(10, "team", 1)).expect("add group");
        let (composite, store, _rx) = composite(1, groups);

        assert_eq!(composite.conversation_for(10), "group_10");
        assert_eq!(composite.conversation_for(2), "private_1_2");

        store
            .store("group_10", SessionKey::random())
            .expect("store");
        assert!(composite.has_session(10));
        assert!(!composite.has_session(2));
    }

    #[tokio::test]
    async fn test_group_initiate_routes_to_group_engine() {
        let groups = Arc::new(InMemoryGroupRepository::new());
        // Admin-less from our perspective: local user 2 is not the admin.
        groups.add(Group::new(10, "team", 1)).expect("add group");
        let (composite, _store, _rx) = composite(2, groups);

        assert!(matches!(
            composite.initiate(10).await,
            Err(KeyExchangeError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_message_routes_by_payload_form() {
        let groups = Arc::new(InMemoryGroupRepository::new());
        let (composite, _store, _rx) = composite(1, groups);

        // A group ack routes to the group engine and is absorbed.
        let ack = Message::new(
            MessageMeta {
                from: 2,
                to: 1,
                ..Default::default()
            },
            MessageBody::KeyExchange(KeyExchangePayload::GroupAck { group_id: 10 }),
        );
        composite.handle_message(&ack).expect("ack routed");

        // A non-key-exchange message is a protocol violation.
        let text = Message::new(
            MessageMeta {
                message_id: "x".to_string(),
                timestamp_ms: 1,
                from: 2,
                to: 1,
            },
            MessageBody::Text {
                content: "hi".to_string(),
            },
        );
        assert!(matches!(
            composite.handle_message(&text),
            Err(KeyExchangeError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_invalidate_routes_to_private_engine() {
        let groups = Arc::new(InMemoryGroupRepository::new());
        let (composite, store, _rx) = composite(1, groups);
        store
            .store("private_1_2", SessionKey::random())
            .expect("store");

        composite.invalidate(2, "contact removed");
        assert!(!composite.has_session(2));
    }
}
