//! The client session.
//!
//! ## Connection lifecycle
//!
//! 1. TCP connect; the relay immediately offers `SERVER_KEY_EXCHANGE`.
//! 2. The client derives the link key and answers; from here management
//!    traffic rides the server envelope.
//! 3. `CREATE_USER` (or `CONNECT_USER` on reattach) is sent; the relay
//!    assigns the account id and echoes it in `ACK_CONNECTION`.
//! 4. The engines, router, and background tasks are wired up around the
//!    assigned id: a writer task drains the outbound queue applying the
//!    sealing policy, a reader task runs the inbound pipeline, and the
//!    sweepers tick every cleanup interval.
//!
//! ## Inbound pipeline
//!
//! `read frame → decode → server-unseal → parse → envelope-unseal →
//! dispatch`. Replayed or tampered wrappers are dropped with a warning
//! event; packet-layer decode failures close the connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_envelope::{Envelope, EnvelopeError};
use parley_keyex::composite::CompositeKeyExchange;
use parley_keyex::group::GroupKeyExchange;
use parley_keyex::private::PrivateKeyExchange;
use parley_keyex::server::ServerLink;
use parley_keyex::KeyExchangeError;
use parley_router::{
    EventBus, HandlerContext, PendingCommandTable, Router, RouterBuilder, RouterError,
};
use parley_session::{group_conversation, private_conversation, SessionKeyStore};
use parley_types::events::{ErrorLevel, Event, EventSink};
use parley_types::message_id::MessageIdGenerator;
use parley_types::repository::{GroupRepository, InMemoryGroupRepository};
use parley_types::{now_ms, GroupId, UserId, SERVER_ID};
use parley_wire::message::{
    AckConnection, ConnectUser, CreateGroup, CreateUser, GroupMemberChange, LeaveGroup, Message,
    MessageBody, MessageMeta, RemoveContact, UpdatePseudo,
};
use parley_wire::packet::{read_packet, write_packet};
use parley_wire::WireError;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::handlers::{
    AckHandler, AckWaiter, ChatHandler, ConnectionAckHandler, ContactHandler, ErrorHandler,
    GroupHandler, KeyExchangeHandler, ServerLinkHandler,
};
use crate::{ClientConfig, ClientError, Result};

/// How long the handshake may take before the connect attempt fails.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

enum Handshake {
    Create { pseudo: String },
    Reattach { user_id: UserId },
}

/// A connected chat client.
pub struct Client {
    user_id: UserId,
    config: ClientConfig,
    store: Arc<SessionKeyStore>,
    keyex: Arc<CompositeKeyExchange>,
    bus: EventBus,
    commands: Arc<PendingCommandTable>,
    outbound: mpsc::UnboundedSender<Message>,
    ids: Arc<MessageIdGenerator>,
    groups: Arc<InMemoryGroupRepository>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Connect and register a new account under `pseudo`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handshake`] if the relay does not complete
    /// the link exchange and account registration.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        pseudo: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        Self::connect_inner(
            addr,
            Handshake::Create {
                pseudo: pseudo.to_string(),
            },
            config,
        )
        .await
    }

    /// Connect and reattach to an existing account.
    pub async fn reconnect(
        addr: impl ToSocketAddrs,
        user_id: UserId,
        config: ClientConfig,
    ) -> Result<Self> {
        Self::connect_inner(addr, Handshake::Reattach { user_id }, config).await
    }

    async fn connect_inner(
        addr: impl ToSocketAddrs,
        handshake: Handshake,
        config: ClientConfig,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let store = Arc::new(SessionKeyStore::with_rekey_threshold(config.rekey_threshold));
        let envelope = Arc::new(Envelope::with_enabled(
            Arc::clone(&store),
            config.encryption_enabled,
        ));
        let server_link = Arc::new(ServerLink::new(Arc::clone(&store)));
        let ids = Arc::new(MessageIdGenerator::new());

        // 1. The relay offers its link key first.
        let offer = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut reader))
            .await
            .map_err(|_| ClientError::Handshake("no server key exchange offer".to_string()))??;
        let MessageBody::ServerKeyExchange { spki } = &offer.body else {
            return Err(ClientError::Handshake(format!(
                "expected server key exchange, got {:?}",
                offer.tag()
            )));
        };
        let response = server_link.establish(spki)?;
        write_packet(&mut writer, &response.to_packet()?).await?;
        let link_conv = server_link
            .conversation_id()
            .ok_or_else(|| ClientError::Handshake("link not established".to_string()))?;

        // 2. Register or reattach, under the server envelope.
        let timestamp_ms = now_ms();
        let hello_body = match &handshake {
            Handshake::Create { pseudo } => MessageBody::CreateUser(CreateUser {
                pseudo: pseudo.clone(),
            }),
            Handshake::Reattach { user_id } => MessageBody::ConnectUser(ConnectUser {
                user_id: *user_id,
            }),
        };
        let hello = Message::new(
            MessageMeta {
                message_id: ids.generate(0, timestamp_ms),
                timestamp_ms,
                from: 0,
                to: SERVER_ID,
            },
            hello_body,
        );
        let sealed = envelope.server_seal(&hello, &link_conv)?;
        write_packet(&mut writer, &sealed.to_packet()?).await?;

        // 3. Await the connection ack with the assigned id.
        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut reader))
            .await
            .map_err(|_| ClientError::Handshake("no connection ack".to_string()))??;
        let reply = match reply.body {
            MessageBody::ServerEncrypted { .. } => envelope.server_unseal(&reply, &link_conv)?,
            _ => reply,
        };
        let user_id = match &reply.body {
            MessageBody::AckConnection(AckConnection { user_id }) => *user_id,
            MessageBody::Ack { status, reason, .. } => {
                return Err(ClientError::Handshake(format!(
                    "relay rejected connection ({status:?}): {}",
                    reason.as_deref().unwrap_or("no reason")
                )))
            }
            other => {
                return Err(ClientError::Handshake(format!(
                    "unexpected handshake reply: {other:?}"
                )))
            }
        };

        tracing::info!(user_id, "connected to relay");

        // 4. Wire engines, router, and tasks around the assigned id.
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let bus = EventBus::new();
        let events: Arc<dyn EventSink> = Arc::new(bus.clone());
        let cleanup = Duration::from_secs(config.cleanup_interval_secs as u64);

        let private = Arc::new(PrivateKeyExchange::with_timing(
            user_id,
            Arc::clone(&store),
            outbound.clone(),
            Arc::clone(&ids),
            Arc::clone(&events),
            Duration::from_secs(config.key_exchange_timeout_secs as u64),
            2 * cleanup,
        ));
        let group = Arc::new(GroupKeyExchange::with_timeouts(
            user_id,
            Arc::clone(&store),
            Arc::clone(&private),
            outbound.clone(),
            Arc::clone(&ids),
            Arc::clone(&events),
            Duration::from_secs(config.group_ack_timeout_secs as u64),
            Duration::from_secs(config.key_exchange_timeout_secs as u64),
        ));
        let groups = Arc::new(InMemoryGroupRepository::new());
        let keyex = Arc::new(CompositeKeyExchange::new(
            Arc::clone(&private),
            Arc::clone(&group),
            Arc::clone(&groups) as Arc<dyn GroupRepository>,
        ));
        let commands = Arc::new(PendingCommandTable::new(Duration::from_secs(
            config.ack_timeout_secs as u64,
        )));

        let ctx = HandlerContext::new(outbound.clone(), Arc::clone(&events));
        let router = RouterBuilder::new()
            .register(Arc::new(ChatHandler::new(Arc::clone(&ids), user_id)))
            .register(Arc::new(AckHandler::new(Arc::clone(&commands))))
            .register(Arc::new(KeyExchangeHandler::new(Arc::clone(&keyex))))
            .register(Arc::new(ServerLinkHandler::new(Arc::clone(&server_link))))
            .register(Arc::new(ContactHandler::new(Arc::clone(&ids), user_id)))
            .register(Arc::new(GroupHandler::new(
                user_id,
                Arc::clone(&groups),
                Arc::clone(&group),
            )))
            .register(Arc::new(ConnectionAckHandler))
            .register(Arc::new(ErrorHandler))
            .build(ctx);

        let writer_task = tokio::spawn(writer_loop(
            outbound_rx,
            writer,
            Arc::clone(&envelope),
            Arc::clone(&keyex),
            Arc::clone(&server_link),
        ));
        let reader_task = tokio::spawn(reader_loop(
            reader,
            router,
            Arc::clone(&envelope),
            Arc::clone(&server_link),
            user_id,
            bus.clone(),
        ));
        let keyex_sweeper = CompositeKeyExchange::spawn_sweeper(Arc::clone(&keyex), cleanup);
        let command_sweeper =
            PendingCommandTable::spawn_sweeper(Arc::clone(&commands), cleanup);

        bus.publish(Event::ConnectionEstablished { user_id });

        Ok(Self {
            user_id,
            config,
            store,
            keyex,
            bus,
            commands,
            outbound,
            ids,
            groups,
            tasks: Mutex::new(vec![
                writer_task,
                reader_task,
                keyex_sweeper,
                command_sweeper,
            ]),
        })
    }

    /// The relay-assigned account id.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The event bus; subscribe for application notifications.
    pub fn events(&self) -> EventBus {
        self.bus.clone()
    }

    /// The session key store (exposed for persistence and inspection).
    pub fn session_store(&self) -> Arc<SessionKeyStore> {
        Arc::clone(&self.store)
    }

    /// The local group cache.
    pub fn groups(&self) -> Arc<InMemoryGroupRepository> {
        Arc::clone(&self.groups)
    }

    /// Establish an end-to-end session with `peer`, waiting for completion.
    ///
    /// Recoverable failures (timeout, transient crypto or storage errors)
    /// are retried up to the configured attempt budget; validation and
    /// protocol failures are surfaced immediately.
    ///
    /// # Errors
    ///
    /// Returns the final [`ClientError::KeyExchange`] after exhausting
    /// retries.
    pub async fn initiate_secure_conversation(&self, peer: UserId) -> Result<()> {
        let ttl = Duration::from_secs(self.config.key_exchange_timeout_secs as u64);
        let grace = Duration::from_secs(2 * self.config.cleanup_interval_secs as u64);
        let max_attempts = self.config.max_retry_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.keyex.private().ensure_session(peer) {
                Ok(None) => return Ok(()),
                Ok(Some(waiter)) => match tokio::time::timeout(ttl + grace, waiter).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(KeyExchangeError::ServiceShutdown),
                    Err(_) => Err(KeyExchangeError::Timeout(format!(
                        "exchange with {peer} did not resolve"
                    ))),
                },
                Err(err) => Err(err),
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(err) if err.is_recoverable() && attempt < max_attempts => {
                    tracing::warn!(peer, attempt, error = %err, "retrying key exchange");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Send a text message. Returns the acknowledgment future.
    ///
    /// When encryption is enabled and no session exists yet, the secure
    /// conversation is established first.
    pub async fn send_text(&self, to: UserId, content: &str) -> Result<AckWaiter> {
        self.ensure_sealable(to).await?;
        let message = self.message(
            to,
            MessageBody::Text {
                content: content.to_string(),
            },
        );
        self.track_and_send(message)
    }

    /// Send a media message. Returns the acknowledgment future.
    pub async fn send_media(
        &self,
        to: UserId,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<AckWaiter> {
        self.ensure_sealable(to).await?;
        let message = self.message(
            to,
            MessageBody::Media {
                filename: filename.to_string(),
                mime_type: mime_type.to_string(),
                bytes,
            },
        );
        self.track_and_send(message)
    }

    /// Send a contact request. Returns the request id and the
    /// acknowledgment future.
    pub fn send_contact_request(&self, to: UserId) -> Result<(String, AckWaiter)> {
        let timestamp_ms = now_ms();
        let request_id = self.ids.generate(self.user_id, timestamp_ms);
        let message = self.message(
            to,
            MessageBody::ContactRequest {
                request_id: request_id.clone(),
                expires_at_ms: timestamp_ms + self.config.contact_request_ttl_secs * 1000,
            },
        );
        let waiter = self.track_and_send(message)?;
        Ok((request_id, waiter))
    }

    /// Answer a contact request.
    pub fn respond_contact_request(
        &self,
        to: UserId,
        request_id: &str,
        accepted: bool,
    ) -> Result<()> {
        let message = self.message(
            to,
            MessageBody::ContactRequestResponse {
                request_id: request_id.to_string(),
                accepted,
            },
        );
        self.send(message)
    }

    /// Change the account's display name.
    pub fn update_pseudo(&self, pseudo: &str) -> Result<AckWaiter> {
        let message = self.message(
            SERVER_ID,
            MessageBody::UpdatePseudo(UpdatePseudo {
                pseudo: pseudo.to_string(),
            }),
        );
        self.track_and_send(message)
    }

    /// Remove a contact; the private session is invalidated locally.
    pub fn remove_contact(&self, contact_id: UserId) -> Result<AckWaiter> {
        self.keyex.invalidate(contact_id, "contact removed");
        let message = self.message(
            SERVER_ID,
            MessageBody::RemoveContact(RemoveContact { contact_id }),
        );
        self.track_and_send(message)
    }

    /// Ask the relay to create a group. The assigned group id arrives in
    /// the acknowledgment extras (`group_id`) and in the fan-out.
    pub fn create_group(&self, name: &str, members: &[UserId]) -> Result<AckWaiter> {
        let message = self.message(
            SERVER_ID,
            MessageBody::CreateGroup(CreateGroup {
                group_id: 0,
                name: name.to_string(),
                admin_id: 0,
                members: members.to_vec(),
            }),
        );
        self.track_and_send(message)
    }

    /// Leave a group.
    pub fn leave_group(&self, group_id: GroupId) -> Result<AckWaiter> {
        let message = self.message(SERVER_ID, MessageBody::LeaveGroup(LeaveGroup { group_id }));
        self.track_and_send(message)
    }

    /// Add a member to a group (admin only; the relay validates).
    pub fn add_group_member(&self, group_id: GroupId, member_id: UserId) -> Result<AckWaiter> {
        let message = self.message(
            SERVER_ID,
            MessageBody::AddGroupMember(GroupMemberChange {
                group_id,
                member_id,
            }),
        );
        self.track_and_send(message)
    }

    /// Remove a member from a group (admin only; the relay validates).
    pub fn remove_group_member(&self, group_id: GroupId, member_id: UserId) -> Result<AckWaiter> {
        let message = self.message(
            SERVER_ID,
            MessageBody::RemoveGroupMember(GroupMemberChange {
                group_id,
                member_id,
            }),
        );
        self.track_and_send(message)
    }

    /// Persist every end-to-end session key to an at-rest store.
    ///
    /// Link keys (`server_session_…`) are per-connection and skipped.
    /// Returns the number of keys written.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::KeyStore`] if a write fails.
    pub fn persist_sessions(&self, keystore: &parley_keystore::KeyStore) -> Result<usize> {
        let mut saved = 0;
        for conversation_id in self.store.conversation_ids() {
            if conversation_id.starts_with("server_session_") {
                continue;
            }
            if let Some(key) = self.store.get_key(&conversation_id) {
                keystore.save_session_key(&conversation_id, &key)?;
                saved += 1;
            }
        }
        Ok(saved)
    }

    /// Load persisted session keys into the live store.
    ///
    /// Loading resets the sequence counters for each restored conversation;
    /// peers holding the same key are expected to do the same on restart.
    /// Returns the number of keys restored.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::KeyStore`] if the store cannot be read.
    pub fn restore_sessions(&self, keystore: &parley_keystore::KeyStore) -> Result<usize> {
        let mut restored = 0;
        for (conversation_id, key) in keystore.load_all()? {
            self.store.store(&conversation_id, key)?;
            restored += 1;
        }
        Ok(restored)
    }

    /// Tear the client down: abort the tasks, fail outstanding commands and
    /// exchange waits.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.commands.drain("client shutdown");
        self.keyex.shutdown();
        tracing::info!(user_id = self.user_id, "client shut down");
    }

    /// Make sure a sealed send to `to` can succeed, establishing the
    /// private session when needed. Group sessions are only distributed by
    /// the admin; a missing group key is an error here.
    async fn ensure_sealable(&self, to: UserId) -> Result<()> {
        if !self.config.encryption_enabled || to == SERVER_ID {
            return Ok(());
        }
        if self.groups.find_by_id(to).is_some() {
            if !self.keyex.has_session(to) {
                return Err(ClientError::KeyExchange(KeyExchangeError::NoSession(
                    group_conversation(to),
                )));
            }
            return Ok(());
        }
        self.initiate_secure_conversation(to).await
    }

    fn message(&self, to: UserId, body: MessageBody) -> Message {
        let timestamp_ms = now_ms();
        Message::new(
            MessageMeta {
                message_id: self.ids.generate(self.user_id, timestamp_ms),
                timestamp_ms,
                from: self.user_id,
                to,
            },
            body,
        )
    }

    fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| ClientError::NotConnected)
    }

    fn track_and_send(&self, message: Message) -> Result<AckWaiter> {
        let waiter = self.commands.register(&message.meta.message_id);
        self.send(message)?;
        Ok(waiter)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Read one packet and parse it into a message.
async fn read_message(reader: &mut OwnedReadHalf) -> Result<Message> {
    let packet = read_packet(reader).await?;
    Ok(Message::from_packet(&packet)?)
}

/// Writer task: drain the outbound queue, applying the sealing policy.
async fn writer_loop(
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut writer: OwnedWriteHalf,
    envelope: Arc<Envelope>,
    keyex: Arc<CompositeKeyExchange>,
    server_link: Arc<ServerLink>,
) {
    while let Some(message) = outbound.recv().await {
        let packet = match prepare_outbound(&message, &envelope, &keyex, &server_link) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(tag = ?message.tag(), error = %err, "dropping unsendable message");
                continue;
            }
        };
        if let Err(err) = write_packet(&mut writer, &packet).await {
            tracing::info!(error = %err, "connection writer stopped");
            break;
        }
    }
}

/// Apply the sealing policy to one outbound message.
fn prepare_outbound(
    message: &Message,
    envelope: &Envelope,
    keyex: &CompositeKeyExchange,
    server_link: &ServerLink,
) -> Result<parley_wire::packet::Packet> {
    let tag = message.tag();

    if Envelope::is_encryptable(tag) {
        let conversation_id = keyex.conversation_for(message.meta.to);
        if envelope.should_encrypt(message, &conversation_id) {
            return Ok(envelope.seal(message, &conversation_id)?.to_packet()?);
        }
    }

    if message.meta.to == SERVER_ID && Envelope::is_server_encryptable(tag) {
        if let Some(conversation_id) = server_link.conversation_id() {
            return Ok(envelope
                .server_seal(message, &conversation_id)?
                .to_packet()?);
        }
    }

    Ok(message.to_packet()?)
}

/// Reader task: run the inbound pipeline until the connection closes.
async fn reader_loop(
    mut reader: OwnedReadHalf,
    router: Router,
    envelope: Arc<Envelope>,
    server_link: Arc<ServerLink>,
    user_id: UserId,
    bus: EventBus,
) {
    loop {
        let packet = match read_packet(&mut reader).await {
            Ok(packet) => packet,
            Err(WireError::Io(err)) => {
                tracing::info!(error = %err, "connection closed");
                bus.publish(Event::Error {
                    level: ErrorLevel::Info,
                    kind: "DISCONNECTED".to_string(),
                    message: "connection to relay closed".to_string(),
                });
                break;
            }
            Err(err) => {
                // Framing is unrecoverable; drop the connection.
                tracing::error!(error = %err, "packet decode failed");
                bus.publish(Event::Error {
                    level: ErrorLevel::Critical,
                    kind: "DECODE_ERROR".to_string(),
                    message: err.to_string(),
                });
                break;
            }
        };

        let message = match Message::from_packet(&packet) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(tag = ?packet.tag, error = %err, "message decode failed");
                bus.publish(Event::Error {
                    level: ErrorLevel::Critical,
                    kind: "DECODE_ERROR".to_string(),
                    message: err.to_string(),
                });
                break;
            }
        };

        // Unwrap the server envelope.
        let message = if matches!(message.body, MessageBody::ServerEncrypted { .. }) {
            let Some(conversation_id) = server_link.conversation_id() else {
                bus.publish(Event::decryption_error("server envelope before link"));
                continue;
            };
            match envelope.server_unseal(&message, &conversation_id) {
                Ok(inner) => inner,
                Err(err) => {
                    tracing::warn!(error = %err, "server unseal failed");
                    bus.publish(Event::decryption_error(err.to_string()));
                    continue;
                }
            }
        } else {
            message
        };

        // Unwrap the end-to-end envelope.
        let message = if matches!(message.body, MessageBody::Encrypted { .. }) {
            let conversation_id = if message.meta.to == user_id {
                private_conversation(message.meta.from, user_id)
            } else {
                group_conversation(message.meta.to)
            };
            match envelope.unseal(&message, &conversation_id) {
                Ok(inner) => inner,
                Err(EnvelopeError::Replay {
                    conversation_id,
                    sequence,
                }) => {
                    tracing::warn!(%conversation_id, sequence, "replayed message dropped");
                    bus.publish(Event::decryption_error(format!(
                        "replayed sequence {sequence} on {conversation_id}"
                    )));
                    continue;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "unseal failed");
                    bus.publish(Event::decryption_error(err.to_string()));
                    continue;
                }
            }
        } else {
            message
        };

        match router.dispatch(message) {
            Ok(()) => {}
            Err(RouterError::NoHandler(_)) => {
                // Already surfaced as an error event by the router.
            }
            Err(err) => {
                tracing::warn!(error = %err, "handler failed");
                bus.publish(Event::Error {
                    level: ErrorLevel::Error,
                    kind: "HANDLER_FAILED".to_string(),
                    message: err.to_string(),
                });
            }
        }
    }
}
