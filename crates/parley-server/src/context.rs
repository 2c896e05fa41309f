//! Shared relay state: repositories, the connection registry, and id
//! allocation.
//!
//! Handlers receive the context explicitly; there is no process-global
//! state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use parley_types::message_id::MessageIdGenerator;
use parley_types::repository::{
    ContactRepository, GroupRepository, InMemoryContactRepository, InMemoryGroupRepository,
    InMemoryUserRepository, UserRepository,
};
use parley_types::{GroupId, UserId};
use parley_wire::message::Message;
use parley_wire::packet::Packet;
use tokio::sync::mpsc;

/// One item queued to a connection's writer.
#[derive(Debug)]
pub enum Outbound {
    /// A client packet forwarded verbatim; the relay does not inspect or
    /// re-wrap it.
    Forward(Packet),
    /// A relay-originated message; the connection writer applies the
    /// server envelope where the kind calls for it.
    Notify(Message),
}

/// Live connections, keyed by authenticated user id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<UserId, mpsc::UnboundedSender<Outbound>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection. Returns `false` if the user is already online.
    pub fn register(&self, user_id: UserId, sender: mpsc::UnboundedSender<Outbound>) -> bool {
        let Ok(mut connections) = self.connections.lock() else {
            return false;
        };
        if connections.contains_key(&user_id) {
            return false;
        }
        connections.insert(user_id, sender);
        true
    }

    /// Detach a connection.
    pub fn unregister(&self, user_id: UserId) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.remove(&user_id);
        }
    }

    /// Whether the user has a live connection.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections
            .lock()
            .map(|connections| connections.contains_key(&user_id))
            .unwrap_or(false)
    }

    /// Queue an item to a user's connection. Returns `false` if offline.
    pub fn send_to(&self, user_id: UserId, outbound: Outbound) -> bool {
        let sender = self
            .connections
            .lock()
            .ok()
            .and_then(|connections| connections.get(&user_id).cloned());
        match sender {
            Some(sender) => sender.send(outbound).is_ok(),
            None => false,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether no connections exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything connection handlers need, passed explicitly.
pub struct ServerContext {
    pub users: Arc<dyn UserRepository>,
    pub groups: Arc<dyn GroupRepository>,
    pub contacts: Arc<dyn ContactRepository>,
    pub registry: Arc<ConnectionRegistry>,
    pub ids: Arc<MessageIdGenerator>,
    next_user_id: AtomicI32,
    next_group_id: AtomicI32,
}

impl ServerContext {
    /// Create a context over in-memory repositories.
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(InMemoryUserRepository::new()),
            groups: Arc::new(InMemoryGroupRepository::new()),
            contacts: Arc::new(InMemoryContactRepository::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            ids: Arc::new(MessageIdGenerator::new()),
            next_user_id: AtomicI32::new(1),
            next_group_id: AtomicI32::new(1),
        }
    }

    /// Allocate the next account id.
    pub fn allocate_user_id(&self) -> UserId {
        self.next_user_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate the next group id.
    pub fn allocate_group_id(&self) -> GroupId {
        self.next_group_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_send() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(registry.register(1, tx.clone()));
        assert!(!registry.register(1, tx));
        assert!(registry.is_online(1));

        let packet = Packet::new(parley_wire::tag::MessageTag::Text, 2, 1, vec![]);
        assert!(registry.send_to(1, Outbound::Forward(packet)));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Forward(_))));

        registry.unregister(1);
        assert!(!registry.is_online(1));
        assert!(!registry.send_to(
            1,
            Outbound::Forward(Packet::new(parley_wire::tag::MessageTag::Text, 2, 1, vec![]))
        ));
    }

    #[test]
    fn test_id_allocation_is_monotonic() {
        let ctx = ServerContext::in_memory();
        assert_eq!(ctx.allocate_user_id(), 1);
        assert_eq!(ctx.allocate_user_id(), 2);
        assert_eq!(ctx.allocate_group_id(), 1);
        assert_eq!(ctx.allocate_group_id(), 2);
    }
}
