//! The client's built-in message handlers.
//!
//! Each handler declares the kinds it accepts; the router table is built
//! from these declarations at startup. Handlers publish events through the
//! context capability and answer with acknowledgments where the protocol
//! expects them.

use std::sync::Arc;

use parley_keyex::composite::CompositeKeyExchange;
use parley_keyex::group::GroupKeyExchange;
use parley_keyex::server::ServerLink;
use parley_router::{AckOutcome, HandlerContext, MessageHandler, PendingCommandTable};
use parley_router::{Result, RouterError};
use parley_types::contact::ContactRequest;
use parley_types::events::{ErrorLevel, Event};
use parley_types::group::Group;
use parley_types::message_id::MessageIdGenerator;
use parley_types::repository::{GroupRepository, InMemoryGroupRepository};
use parley_types::{now_ms, MessageStatus, UserId};
use parley_wire::message::{Message, MessageBody, MessageMeta};
use parley_wire::tag::MessageTag;

/// Build a delivery acknowledgment for a received message.
fn make_ack(
    ids: &MessageIdGenerator,
    local_id: UserId,
    original: &Message,
    status: MessageStatus,
) -> Message {
    let timestamp_ms = now_ms();
    Message::new(
        MessageMeta {
            message_id: ids.generate(local_id, timestamp_ms),
            timestamp_ms,
            from: local_id,
            to: original.meta.from,
        },
        MessageBody::Ack {
            acknowledged_id: original.meta.message_id.clone(),
            status,
            reason: None,
            extras: serde_json::json!({}),
        },
    )
}

/// Text and media delivery: publish the event, acknowledge to the sender.
pub struct ChatHandler {
    ids: Arc<MessageIdGenerator>,
    local_id: UserId,
}

impl ChatHandler {
    pub fn new(ids: Arc<MessageIdGenerator>, local_id: UserId) -> Self {
        Self { ids, local_id }
    }
}

impl MessageHandler for ChatHandler {
    fn accepts(&self) -> &[MessageTag] {
        &[MessageTag::Text, MessageTag::Media]
    }

    fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        match &message.body {
            MessageBody::Text { content } => {
                ctx.publish(Event::TextReceived {
                    from: message.meta.from,
                    to: message.meta.to,
                    message_id: message.meta.message_id.clone(),
                    timestamp_ms: message.meta.timestamp_ms,
                    content: content.clone(),
                });
            }
            MessageBody::Media {
                filename,
                mime_type,
                bytes,
            } => {
                ctx.publish(Event::MediaReceived {
                    from: message.meta.from,
                    to: message.meta.to,
                    message_id: message.meta.message_id.clone(),
                    filename: filename.clone(),
                    mime_type: mime_type.clone(),
                    bytes: bytes.clone(),
                });
            }
            _ => return Err(RouterError::Handler("unexpected body".to_string())),
        }
        ctx.send(make_ack(
            &self.ids,
            self.local_id,
            &message,
            MessageStatus::Delivered,
        ))
    }
}

/// Acknowledgments: complete the pending command and publish.
pub struct AckHandler {
    commands: Arc<PendingCommandTable>,
}

impl AckHandler {
    pub fn new(commands: Arc<PendingCommandTable>) -> Self {
        Self { commands }
    }
}

impl MessageHandler for AckHandler {
    fn accepts(&self) -> &[MessageTag] {
        &[MessageTag::MessageAck]
    }

    fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        let MessageBody::Ack {
            acknowledged_id,
            status,
            reason,
            extras,
        } = &message.body
        else {
            return Err(RouterError::Handler("unexpected body".to_string()));
        };

        self.commands
            .complete(acknowledged_id, *status, reason.clone(), extras.clone());
        ctx.publish(Event::AckReceived {
            message_id: acknowledged_id.clone(),
            status: *status,
            reason: reason.clone(),
        });
        Ok(())
    }
}

/// Key-exchange traffic: route into the composite dispatcher.
pub struct KeyExchangeHandler {
    keyex: Arc<CompositeKeyExchange>,
}

impl KeyExchangeHandler {
    pub fn new(keyex: Arc<CompositeKeyExchange>) -> Self {
        Self { keyex }
    }
}

impl MessageHandler for KeyExchangeHandler {
    fn accepts(&self) -> &[MessageTag] {
        &[MessageTag::KeyExchange, MessageTag::KeyExchangeResponse]
    }

    fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        if let Err(err) = self.keyex.handle_message(&message) {
            tracing::warn!(from = message.meta.from, error = %err, "key exchange failed");
            ctx.publish(Event::Error {
                level: ErrorLevel::Error,
                kind: "KEY_EXCHANGE_FAILED".to_string(),
                message: err.to_string(),
            });
        }
        Ok(())
    }
}

/// Mid-session relay rekey: answer a fresh `SERVER_KEY_EXCHANGE` offer.
pub struct ServerLinkHandler {
    link: Arc<ServerLink>,
}

impl ServerLinkHandler {
    pub fn new(link: Arc<ServerLink>) -> Self {
        Self { link }
    }
}

impl MessageHandler for ServerLinkHandler {
    fn accepts(&self) -> &[MessageTag] {
        &[MessageTag::ServerKeyExchange]
    }

    fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        let MessageBody::ServerKeyExchange { spki } = &message.body else {
            return Err(RouterError::Handler("unexpected body".to_string()));
        };
        match self.link.establish(spki) {
            Ok(response) => ctx.send(response),
            Err(err) => {
                ctx.publish(Event::Error {
                    level: ErrorLevel::Error,
                    kind: "SERVER_KEY_EXCHANGE_FAILED".to_string(),
                    message: err.to_string(),
                });
                Ok(())
            }
        }
    }
}

/// Contact requests and responses.
pub struct ContactHandler {
    ids: Arc<MessageIdGenerator>,
    local_id: UserId,
}

impl ContactHandler {
    pub fn new(ids: Arc<MessageIdGenerator>, local_id: UserId) -> Self {
        Self { ids, local_id }
    }
}

impl MessageHandler for ContactHandler {
    fn accepts(&self) -> &[MessageTag] {
        &[MessageTag::ContactRequest, MessageTag::ContactRequestResponse]
    }

    fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        match &message.body {
            MessageBody::ContactRequest {
                request_id,
                expires_at_ms,
            } => {
                let mut request = ContactRequest::new(
                    request_id.clone(),
                    message.meta.from,
                    message.meta.to,
                    message.meta.timestamp_ms,
                );
                request.expires_at_ms = *expires_at_ms;
                ctx.publish(Event::ContactRequestReceived { request });
                ctx.send(make_ack(
                    &self.ids,
                    self.local_id,
                    &message,
                    MessageStatus::Delivered,
                ))
            }
            MessageBody::ContactRequestResponse {
                request_id,
                accepted,
            } => {
                ctx.publish(Event::ContactRequestResponded {
                    request_id: request_id.clone(),
                    from: message.meta.from,
                    accepted: *accepted,
                });
                Ok(())
            }
            _ => Err(RouterError::Handler("unexpected body".to_string())),
        }
    }
}

/// Group membership fan-outs from the relay.
///
/// The relay is the only mutator of membership; these notifications update
/// the local group cache and, on the admin, trigger key distribution or
/// rotation in a background task.
pub struct GroupHandler {
    local_id: UserId,
    groups: Arc<InMemoryGroupRepository>,
    engine: Arc<GroupKeyExchange>,
}

impl GroupHandler {
    pub fn new(
        local_id: UserId,
        groups: Arc<InMemoryGroupRepository>,
        engine: Arc<GroupKeyExchange>,
    ) -> Self {
        Self {
            local_id,
            groups,
            engine,
        }
    }

    /// Rotate (or first-distribute) the group key on the admin, off the
    /// reader task.
    fn spawn_distribution(&self, group: Group, initial: bool) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let result = if initial {
                engine.establish(&group).await
            } else {
                engine.rotate(&group).await
            };
            if let Err(err) = result {
                tracing::warn!(
                    group_id = group.group_id,
                    error = %err,
                    "group key distribution failed"
                );
            }
        });
    }
}

impl MessageHandler for GroupHandler {
    fn accepts(&self) -> &[MessageTag] {
        &[
            MessageTag::CreateGroup,
            MessageTag::AddGroupMember,
            MessageTag::RemoveGroupMember,
            MessageTag::LeaveGroup,
        ]
    }

    fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        match &message.body {
            MessageBody::CreateGroup(params) => {
                let mut group = Group::new(params.group_id, params.name.clone(), params.admin_id);
                for &member in &params.members {
                    group.add_member(member);
                }
                let _ = self.groups.delete(group.group_id);
                self.groups
                    .add(group.clone())
                    .map_err(|e| RouterError::Handler(e.to_string()))?;

                ctx.publish(Event::MemberAdded {
                    group_id: group.group_id,
                    member_id: self.local_id,
                });
                if group.admin_id == self.local_id {
                    self.spawn_distribution(group, true);
                }
                Ok(())
            }
            MessageBody::AddGroupMember(change) => {
                let Some(mut group) = self.groups.find_by_id(change.group_id) else {
                    return Err(RouterError::Handler(format!(
                        "unknown group {}",
                        change.group_id
                    )));
                };
                group.add_member(change.member_id);
                self.groups
                    .update(group.clone())
                    .map_err(|e| RouterError::Handler(e.to_string()))?;

                ctx.publish(Event::MemberAdded {
                    group_id: change.group_id,
                    member_id: change.member_id,
                });
                if group.admin_id == self.local_id {
                    self.spawn_distribution(group, false);
                }
                Ok(())
            }
            MessageBody::RemoveGroupMember(change) => {
                if change.member_id == self.local_id {
                    let _ = self.groups.delete(change.group_id);
                    self.engine.invalidate(change.group_id, "removed from group");
                    ctx.publish(Event::MemberRemoved {
                        group_id: change.group_id,
                        member_id: change.member_id,
                    });
                    return Ok(());
                }

                let Some(mut group) = self.groups.find_by_id(change.group_id) else {
                    return Err(RouterError::Handler(format!(
                        "unknown group {}",
                        change.group_id
                    )));
                };
                group.remove_member(change.member_id);
                self.groups
                    .update(group.clone())
                    .map_err(|e| RouterError::Handler(e.to_string()))?;

                ctx.publish(Event::MemberRemoved {
                    group_id: change.group_id,
                    member_id: change.member_id,
                });
                if group.admin_id == self.local_id {
                    self.spawn_distribution(group, false);
                }
                Ok(())
            }
            MessageBody::LeaveGroup(params) => {
                // Dissolution fan-out: the admin left.
                let _ = self.groups.delete(params.group_id);
                self.engine.invalidate(params.group_id, "group dissolved");
                Ok(())
            }
            _ => Err(RouterError::Handler("unexpected body".to_string())),
        }
    }
}

/// Connection acknowledgment outside the handshake (reconnects).
pub struct ConnectionAckHandler;

impl MessageHandler for ConnectionAckHandler {
    fn accepts(&self) -> &[MessageTag] {
        &[MessageTag::AckConnection]
    }

    fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        if let MessageBody::AckConnection(params) = &message.body {
            ctx.publish(Event::ConnectionEstablished {
                user_id: params.user_id,
            });
        }
        Ok(())
    }
}

/// Relay-originated error reports, surfaced verbatim.
pub struct ErrorHandler;

impl MessageHandler for ErrorHandler {
    fn accepts(&self) -> &[MessageTag] {
        &[MessageTag::Error]
    }

    fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        if let MessageBody::Error {
            level,
            kind,
            description,
        } = &message.body
        {
            ctx.publish(Event::Error {
                level: *level,
                kind: kind.clone(),
                message: description.clone(),
            });
        }
        Ok(())
    }
}

/// The completion future type returned by tracked sends.
pub type AckWaiter = tokio::sync::oneshot::Receiver<AckOutcome>;

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::events::{BufferedEventSink, EventKind, EventSink};
    use tokio::sync::mpsc;

    fn context() -> (
        HandlerContext,
        mpsc::UnboundedReceiver<Message>,
        Arc<BufferedEventSink>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Arc::new(BufferedEventSink::new());
        (
            HandlerContext::new(tx, events.clone() as Arc<dyn EventSink>),
            rx,
            events,
        )
    }

    fn text_from(from: UserId, to: UserId, content: &str) -> Message {
        Message::new(
            MessageMeta {
                message_id: "m1".to_string(),
                timestamp_ms: 1,
                from,
                to,
            },
            MessageBody::Text {
                content: content.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_chat_handler_publishes_and_acks() {
        let (ctx, mut rx, events) = context();
        let handler = ChatHandler::new(Arc::new(MessageIdGenerator::new()), 2);

        handler.handle(&ctx, text_from(1, 2, "hello")).expect("handle");

        assert_eq!(events.count_of(EventKind::TextReceived), 1);
        let ack = rx.recv().await.expect("ack queued");
        assert_eq!(ack.meta.to, 1);
        match ack.body {
            MessageBody::Ack {
                acknowledged_id,
                status,
                ..
            } => {
                assert_eq!(acknowledged_id, "m1");
                assert_eq!(status, MessageStatus::Delivered);
            }
            other => unreachable!("unexpected ack body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ack_handler_completes_command() {
        let (ctx, _rx, events) = context();
        let commands = Arc::new(PendingCommandTable::new(std::time::Duration::from_secs(15)));
        let waiter = commands.register("orig1");
        let handler = AckHandler::new(Arc::clone(&commands));

        let ack = Message::new(
            MessageMeta {
                message_id: "a1".to_string(),
                timestamp_ms: 2,
                from: 2,
                to: 1,
            },
            MessageBody::Ack {
                acknowledged_id: "orig1".to_string(),
                status: MessageStatus::Delivered,
                reason: None,
                extras: serde_json::json!({}),
            },
        );
        handler.handle(&ctx, ack).expect("handle");

        let outcome = waiter.await.expect("completed");
        assert_eq!(outcome.status, MessageStatus::Delivered);
        assert_eq!(events.count_of(EventKind::AckReceived), 1);
    }

    #[tokio::test]
    async fn test_contact_request_publishes_and_acks() {
        let (ctx, mut rx, events) = context();
        let handler = ContactHandler::new(Arc::new(MessageIdGenerator::new()), 2);

        let request = Message::new(
            MessageMeta {
                message_id: "c1".to_string(),
                timestamp_ms: 10,
                from: 1,
                to: 2,
            },
            MessageBody::ContactRequest {
                request_id: "req-1".to_string(),
                expires_at_ms: 99_999,
            },
        );
        handler.handle(&ctx, request).expect("handle");

        assert_eq!(events.count_of(EventKind::ContactRequestReceived), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_group_create_fanout_updates_cache() {
        let (ctx, _rx, events) = context();
        let groups = Arc::new(InMemoryGroupRepository::new());

        // Minimal engine wiring; the non-admin path never touches it.
        let store = Arc::new(parley_session::SessionKeyStore::new());
        let (tx, _engine_rx) = mpsc::unbounded_channel();
        let ids = Arc::new(MessageIdGenerator::new());
        let sink = Arc::new(BufferedEventSink::new()) as Arc<dyn EventSink>;
        let private = Arc::new(parley_keyex::private::PrivateKeyExchange::new(
            3,
            Arc::clone(&store),
            tx.clone(),
            Arc::clone(&ids),
            Arc::clone(&sink),
        ));
        let engine = Arc::new(GroupKeyExchange::new(3, store, private, tx, ids, sink));

        let handler = GroupHandler::new(3, Arc::clone(&groups), engine);
        let fanout = Message::new(
            MessageMeta {
                message_id: "g1".to_string(),
                timestamp_ms: 1,
                from: 0,
                to: 3,
            },
            MessageBody::CreateGroup(parley_wire::message::CreateGroup {
                group_id: 10,
                name: "team".to_string(),
                admin_id: 1,
                members: vec![1, 2, 3],
            }),
        );
        handler.handle(&ctx, fanout).expect("handle");

        let group = groups.find_by_id(10).expect("cached");
        assert_eq!(group.admin_id, 1);
        assert!(group.has_member(3));
        assert_eq!(events.count_of(EventKind::MemberAdded), 1);
    }

    #[tokio::test]
    async fn test_remove_self_invalidates_group() {
        let (ctx, _rx, events) = context();
        let groups = Arc::new(InMemoryGroupRepository::new());
        groups.add(Group::new(10, "team", 1)).expect("seed");

        let store = Arc::new(parley_session::SessionKeyStore::new());
        store
            .store("group_10", parley_crypto::key::SessionKey::random())
            .expect("store");
        let (tx, _engine_rx) = mpsc::unbounded_channel();
        let ids = Arc::new(MessageIdGenerator::new());
        let sink = Arc::new(BufferedEventSink::new()) as Arc<dyn EventSink>;
        let private = Arc::new(parley_keyex::private::PrivateKeyExchange::new(
            3,
            Arc::clone(&store),
            tx.clone(),
            Arc::clone(&ids),
            Arc::clone(&sink),
        ));
        let engine = Arc::new(GroupKeyExchange::new(
            3,
            Arc::clone(&store),
            private,
            tx,
            ids,
            sink,
        ));
        let handler = GroupHandler::new(3, Arc::clone(&groups), engine);

        let fanout = Message::new(
            MessageMeta {
                message_id: "g2".to_string(),
                timestamp_ms: 1,
                from: 0,
                to: 3,
            },
            MessageBody::RemoveGroupMember(parley_wire::message::GroupMemberChange {
                group_id: 10,
                member_id: 3,
            }),
        );
        handler.handle(&ctx, fanout).expect("handle");

        assert!(groups.find_by_id(10).is_none());
        assert!(!store.has_session("group_10"));
        assert_eq!(events.count_of(EventKind::MemberRemoved), 1);
    }
}
