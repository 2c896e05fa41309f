//! The relay server: accept loop and per-connection handling.
//!
//! Each connection runs a reader task (this module) and a writer task
//! draining an outbound queue. The reader performs the server-link key
//! exchange, authenticates the account, and then routes packets:
//!
//! - management kinds addressed to the relay are validated and answered
//!   with server-generated acknowledgments;
//! - client-to-client packets are forwarded verbatim — the relay never
//!   opens end-to-end sealed payloads;
//! - group membership changes mutate the repository here and are fanned
//!   out to all members.

use std::sync::Arc;

use parley_envelope::Envelope;
use parley_keyex::server::ServerLinkAcceptor;
use parley_session::SessionKeyStore;
use parley_types::contact::{ContactRequest, ContactRequestStatus};
use parley_types::group::Group;
use parley_types::user::User;
use parley_types::{now_ms, MessageStatus, UserId, SERVER_ID};
use parley_wire::message::{
    AckConnection, CreateGroup, GroupMemberChange, LeaveGroup, Message, MessageBody, MessageMeta,
};
use parley_wire::packet::{read_packet, write_packet, Packet};
use parley_wire::tag::MessageTag;
use parley_wire::WireError;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::context::{Outbound, ServerContext};
use crate::{Result, ServerConfig};

/// The relay server.
pub struct RelayServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    store: Arc<SessionKeyStore>,
    envelope: Arc<Envelope>,
}

impl RelayServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ServerError::Io`] if the address cannot be bound.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let store = Arc::new(SessionKeyStore::new());
        let envelope = Arc::new(Envelope::new(Arc::clone(&store)));
        tracing::info!(addr = %listener.local_addr()?, "relay listening");
        Ok(Self {
            listener,
            ctx: Arc::new(ServerContext::in_memory()),
            store,
            envelope,
        })
    }

    /// The bound address (useful with an ephemeral port).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The shared relay state.
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// The relay's session store. It only ever holds per-connection link
    /// keys — end-to-end session keys never appear here.
    pub fn session_store(&self) -> Arc<SessionKeyStore> {
        Arc::clone(&self.store)
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::debug!(%peer, "connection accepted");
            let ctx = Arc::clone(&self.ctx);
            let store = Arc::clone(&self.store);
            let envelope = Arc::clone(&self.envelope);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, ctx, store, envelope).await {
                    tracing::debug!(%peer, error = %err, "connection ended");
                }
            });
        }
    }
}

/// One accepted connection, reader side.
struct Connection {
    ctx: Arc<ServerContext>,
    envelope: Arc<Envelope>,
    acceptor: Arc<ServerLinkAcceptor>,
    out: mpsc::UnboundedSender<Outbound>,
    user_id: Option<UserId>,
}

async fn handle_connection(
    stream: TcpStream,
    ctx: Arc<ServerContext>,
    store: Arc<SessionKeyStore>,
    envelope: Arc<Envelope>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();

    let acceptor = Arc::new(ServerLinkAcceptor::new(Arc::clone(&store)));
    let (out, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(connection_writer(
        out_rx,
        writer,
        Arc::clone(&envelope),
        Arc::clone(&acceptor),
    ));

    let mut connection = Connection {
        ctx,
        envelope,
        acceptor,
        out,
        user_id: None,
    };

    // Offer the link key before anything else.
    let _ = connection
        .out
        .send(Outbound::Notify(connection.acceptor.offer()));

    let result = connection.read_loop(reader).await;

    // Tear down: detach the account and forget the link key.
    if let Some(user_id) = connection.user_id {
        connection.ctx.registry.unregister(user_id);
        tracing::info!(user_id, "client disconnected");
    }
    if let Some(conversation_id) = connection.acceptor.conversation_id() {
        store.remove(&conversation_id);
    }
    writer_task.abort();
    result
}

/// Writer task: serialize queued items, applying the server envelope to
/// relay-originated management messages.
async fn connection_writer(
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    mut writer: OwnedWriteHalf,
    envelope: Arc<Envelope>,
    acceptor: Arc<ServerLinkAcceptor>,
) {
    while let Some(outbound) = out_rx.recv().await {
        let packet = match outbound {
            Outbound::Forward(packet) => packet,
            Outbound::Notify(message) => {
                match prepare_notify(&message, &envelope, &acceptor) {
                    Ok(packet) => packet,
                    Err(err) => {
                        tracing::warn!(tag = ?message.tag(), error = %err, "dropping notify");
                        continue;
                    }
                }
            }
        };
        if write_packet(&mut writer, &packet).await.is_err() {
            break;
        }
    }
}

fn prepare_notify(
    message: &Message,
    envelope: &Envelope,
    acceptor: &ServerLinkAcceptor,
) -> Result<Packet> {
    if Envelope::is_server_encryptable(message.tag()) {
        if let Some(conversation_id) = acceptor.conversation_id() {
            return Ok(envelope
                .server_seal(message, &conversation_id)?
                .to_packet()?);
        }
    }
    Ok(message.to_packet()?)
}

impl Connection {
    async fn read_loop(&mut self, mut reader: OwnedReadHalf) -> Result<()> {
        loop {
            let packet = match read_packet(&mut reader).await {
                Ok(packet) => packet,
                Err(WireError::Io(_)) => return Ok(()),
                Err(err) => {
                    // Framing is unrecoverable.
                    tracing::error!(error = %err, "packet decode failed");
                    self.ack("", MessageStatus::Critical, Some(err.to_string()));
                    return Err(err.into());
                }
            };

            let message = match Message::from_packet(&packet) {
                Ok(message) => message,
                Err(err) => {
                    tracing::error!(tag = ?packet.tag, error = %err, "message decode failed");
                    self.ack("", MessageStatus::Critical, Some(err.to_string()));
                    return Err(err.into());
                }
            };

            let message = match &message.body {
                MessageBody::ServerEncrypted { .. } => {
                    let Some(conversation_id) = self.acceptor.conversation_id() else {
                        tracing::warn!("server envelope before link exchange");
                        continue;
                    };
                    match self.envelope.server_unseal(&message, &conversation_id) {
                        Ok(inner) => inner,
                        Err(err) => {
                            tracing::warn!(error = %err, "server unseal failed");
                            continue;
                        }
                    }
                }
                _ => message,
            };

            if !self.handle(&packet, message) {
                return Ok(());
            }
        }
    }

    /// Process one message. Returns `false` to close the connection.
    fn handle(&mut self, packet: &Packet, message: Message) -> bool {
        match &message.body {
            MessageBody::ServerKeyExchangeResponse { spki } => {
                if let Err(err) = self.acceptor.handle_response(spki) {
                    tracing::warn!(error = %err, "link exchange failed");
                    return false;
                }
                true
            }
            MessageBody::CreateUser(params) => self.create_user(&message, &params.pseudo),
            MessageBody::ConnectUser(params) => self.connect_user(&message, params.user_id),
            _ => {
                // Everything else requires an authenticated account.
                let Some(user_id) = self.user_id else {
                    self.ack(
                        &message.meta.message_id,
                        MessageStatus::Critical,
                        Some("not connected".to_string()),
                    );
                    return false;
                };

                if message.meta.to == SERVER_ID {
                    self.handle_management(user_id, &message)
                } else {
                    self.forward(user_id, packet, &message)
                }
            }
        }
    }

    fn create_user(&mut self, message: &Message, pseudo: &str) -> bool {
        let user_id = self.ctx.allocate_user_id();
        if let Err(err) = self.ctx.users.add(User::new(user_id, pseudo, now_ms())) {
            self.ack(
                &message.meta.message_id,
                MessageStatus::Critical,
                Some(err.to_string()),
            );
            return false;
        }
        if !self.ctx.registry.register(user_id, self.out.clone()) {
            self.ack(
                &message.meta.message_id,
                MessageStatus::Critical,
                Some("registration failed".to_string()),
            );
            return false;
        }
        self.user_id = Some(user_id);
        tracing::info!(user_id, pseudo, "user created");

        self.notify_self(MessageBody::AckConnection(AckConnection { user_id }));
        true
    }

    fn connect_user(&mut self, message: &Message, user_id: UserId) -> bool {
        if self.ctx.users.find_by_id(user_id).is_none() {
            self.ack(
                &message.meta.message_id,
                MessageStatus::Critical,
                Some(format!("unknown user {user_id}")),
            );
            return false;
        }
        if !self.ctx.registry.register(user_id, self.out.clone()) {
            self.ack(
                &message.meta.message_id,
                MessageStatus::Critical,
                Some(format!("user {user_id} already connected")),
            );
            return false;
        }
        self.user_id = Some(user_id);
        tracing::info!(user_id, "user reconnected");

        self.notify_self(MessageBody::AckConnection(AckConnection { user_id }));
        true
    }

    /// Management kinds addressed to the relay.
    fn handle_management(&mut self, user_id: UserId, message: &Message) -> bool {
        let message_id = message.meta.message_id.clone();
        match &message.body {
            MessageBody::UpdatePseudo(params) => {
                match self.ctx.users.find_by_id(user_id) {
                    Some(mut user) => {
                        user.pseudo = params.pseudo.clone();
                        match self.ctx.users.update(user) {
                            Ok(()) => self.ack(&message_id, MessageStatus::Sent, None),
                            Err(err) => self.ack(
                                &message_id,
                                MessageStatus::Failed,
                                Some(err.to_string()),
                            ),
                        }
                    }
                    None => self.ack(
                        &message_id,
                        MessageStatus::Failed,
                        Some("unknown user".to_string()),
                    ),
                }
                true
            }
            MessageBody::RemoveContact(_) => {
                // Contact lists live on the clients; the relay only confirms.
                self.ack(&message_id, MessageStatus::Sent, None);
                true
            }
            MessageBody::CreateGroup(params) => self.create_group(user_id, &message_id, params),
            MessageBody::AddGroupMember(change) => {
                self.change_membership(user_id, &message_id, change, true)
            }
            MessageBody::RemoveGroupMember(change) => {
                self.change_membership(user_id, &message_id, change, false)
            }
            MessageBody::LeaveGroup(params) => self.leave_group(user_id, &message_id, params),
            _ => {
                self.ack(
                    &message_id,
                    MessageStatus::Failed,
                    Some("unsupported management kind".to_string()),
                );
                true
            }
        }
    }

    fn create_group(&mut self, admin_id: UserId, message_id: &str, params: &CreateGroup) -> bool {
        let group_id = self.ctx.allocate_group_id();
        let mut group = Group::new(group_id, params.name.clone(), admin_id);
        for &member in &params.members {
            if member == admin_id {
                continue;
            }
            if self.ctx.users.find_by_id(member).is_none() {
                tracing::warn!(group_id, member, "skipping unknown group member");
                continue;
            }
            group.add_member(member);
        }

        if let Err(err) = self.ctx.groups.add(group.clone()) {
            self.ack(message_id, MessageStatus::Failed, Some(err.to_string()));
            return true;
        }
        tracing::info!(group_id, admin_id, members = group.members.len(), "group created");

        self.ack_with_extras(
            message_id,
            MessageStatus::Sent,
            None,
            serde_json::json!({ "group_id": group_id }),
        );
        let body = MessageBody::CreateGroup(CreateGroup {
            group_id,
            name: group.name.clone(),
            admin_id,
            members: group.members.clone(),
        });
        for &member in &group.members {
            self.notify_user(member, body.clone());
        }
        true
    }

    fn change_membership(
        &mut self,
        sender: UserId,
        message_id: &str,
        change: &GroupMemberChange,
        adding: bool,
    ) -> bool {
        let Some(mut group) = self.ctx.groups.find_by_id(change.group_id) else {
            self.ack(
                message_id,
                MessageStatus::Failed,
                Some(format!("unknown group {}", change.group_id)),
            );
            return true;
        };
        if group.admin_id != sender {
            self.ack(
                message_id,
                MessageStatus::Failed,
                Some("only the admin may change membership".to_string()),
            );
            return true;
        }

        if adding {
            if self.ctx.users.find_by_id(change.member_id).is_none() {
                self.ack(
                    message_id,
                    MessageStatus::Failed,
                    Some(format!("unknown user {}", change.member_id)),
                );
                return true;
            }
            if group.has_member(change.member_id) {
                self.ack(
                    message_id,
                    MessageStatus::Failed,
                    Some("already a member".to_string()),
                );
                return true;
            }
            // Existing members learn of the addition; the newcomer gets the
            // full group picture.
            let existing = group.members.clone();
            group.add_member(change.member_id);
            if let Err(err) = self.ctx.groups.update(group.clone()) {
                self.ack(message_id, MessageStatus::Failed, Some(err.to_string()));
                return true;
            }
            tracing::info!(group_id = group.group_id, member = change.member_id, "member added");

            self.ack(message_id, MessageStatus::Sent, None);
            let body = MessageBody::AddGroupMember(change.clone());
            for &member in &existing {
                self.notify_user(member, body.clone());
            }
            self.notify_user(
                change.member_id,
                MessageBody::CreateGroup(CreateGroup {
                    group_id: group.group_id,
                    name: group.name.clone(),
                    admin_id: group.admin_id,
                    members: group.members.clone(),
                }),
            );
        } else {
            if change.member_id == group.admin_id {
                self.ack(
                    message_id,
                    MessageStatus::Failed,
                    Some("the admin cannot be removed".to_string()),
                );
                return true;
            }
            let recipients = group.members.clone();
            if !group.remove_member(change.member_id) {
                self.ack(
                    message_id,
                    MessageStatus::Failed,
                    Some("not a member".to_string()),
                );
                return true;
            }
            if let Err(err) = self.ctx.groups.update(group.clone()) {
                self.ack(message_id, MessageStatus::Failed, Some(err.to_string()));
                return true;
            }
            tracing::info!(group_id = group.group_id, member = change.member_id, "member removed");

            self.ack(message_id, MessageStatus::Sent, None);
            let body = MessageBody::RemoveGroupMember(change.clone());
            for &member in &recipients {
                self.notify_user(member, body.clone());
            }
        }
        true
    }

    fn leave_group(&mut self, sender: UserId, message_id: &str, params: &LeaveGroup) -> bool {
        let Some(mut group) = self.ctx.groups.find_by_id(params.group_id) else {
            self.ack(
                message_id,
                MessageStatus::Failed,
                Some(format!("unknown group {}", params.group_id)),
            );
            return true;
        };
        if !group.has_member(sender) {
            self.ack(
                message_id,
                MessageStatus::Failed,
                Some("not a member".to_string()),
            );
            return true;
        }

        if sender == group.admin_id {
            // The admin leaving dissolves the group.
            let members = group.members.clone();
            if let Err(err) = self.ctx.groups.delete(group.group_id) {
                self.ack(message_id, MessageStatus::Failed, Some(err.to_string()));
                return true;
            }
            tracing::info!(group_id = group.group_id, "group dissolved");

            self.ack(message_id, MessageStatus::Sent, None);
            for &member in members.iter().filter(|&&m| m != sender) {
                self.notify_user(
                    member,
                    MessageBody::LeaveGroup(LeaveGroup {
                        group_id: params.group_id,
                    }),
                );
            }
            return true;
        }

        let recipients = group.members.clone();
        group.remove_member(sender);
        if let Err(err) = self.ctx.groups.update(group.clone()) {
            self.ack(message_id, MessageStatus::Failed, Some(err.to_string()));
            return true;
        }
        tracing::info!(group_id = group.group_id, member = sender, "member left");

        self.ack(message_id, MessageStatus::Sent, None);
        let body = MessageBody::RemoveGroupMember(GroupMemberChange {
            group_id: params.group_id,
            member_id: sender,
        });
        for &member in &recipients {
            self.notify_user(member, body.clone());
        }
        true
    }

    /// Forward a client-to-client packet verbatim.
    fn forward(&mut self, sender: UserId, packet: &Packet, message: &Message) -> bool {
        if packet.from != sender {
            self.ack(
                &message.meta.message_id,
                MessageStatus::Critical,
                Some("sender id mismatch".to_string()),
            );
            return false;
        }

        // Contact-request kinds get relay-side validation before forwarding.
        match &message.body {
            MessageBody::ContactRequest {
                request_id,
                expires_at_ms,
            } => {
                if !self.validate_contact_request(message, request_id, *expires_at_ms) {
                    return true;
                }
            }
            MessageBody::ContactRequestResponse {
                request_id,
                accepted,
            } => {
                if !self.validate_contact_response(message, request_id, *accepted) {
                    return true;
                }
            }
            _ => {}
        }

        let target = message.meta.to;
        if let Some(group) = self.ctx.groups.find_by_id(target) {
            if !group.has_member(sender) {
                self.ack(
                    &message.meta.message_id,
                    MessageStatus::Failed,
                    Some("not a group member".to_string()),
                );
                return true;
            }
            for &member in group.members.iter().filter(|&&m| m != sender) {
                if !self
                    .ctx
                    .registry
                    .send_to(member, Outbound::Forward(packet.clone()))
                {
                    tracing::debug!(member, "group member offline, skipping");
                }
            }
            self.server_ack(message);
            return true;
        }

        if self
            .ctx
            .registry
            .send_to(target, Outbound::Forward(packet.clone()))
        {
            self.server_ack(message);
        } else {
            self.ack(
                &message.meta.message_id,
                MessageStatus::Failed,
                Some(format!("recipient {target} offline")),
            );
        }
        true
    }

    fn validate_contact_request(
        &self,
        message: &Message,
        request_id: &str,
        expires_at_ms: u64,
    ) -> bool {
        if self.ctx.users.find_by_id(message.meta.to).is_none() {
            self.ack(
                &message.meta.message_id,
                MessageStatus::Failed,
                Some(format!("no such contact {}", message.meta.to)),
            );
            return false;
        }
        let mut request = ContactRequest::new(
            request_id,
            message.meta.from,
            message.meta.to,
            message.meta.timestamp_ms,
        );
        request.expires_at_ms = expires_at_ms;
        let _ = self.ctx.contacts.delete(request_id);
        if let Err(err) = self.ctx.contacts.add(request) {
            tracing::warn!(request_id, error = %err, "contact request not tracked");
        }
        true
    }

    fn validate_contact_response(&self, message: &Message, request_id: &str, accepted: bool) -> bool {
        let Some(mut request) = self.ctx.contacts.find_by_id(request_id) else {
            self.ack(
                &message.meta.message_id,
                MessageStatus::Failed,
                Some("unknown contact request".to_string()),
            );
            return false;
        };
        if request.is_expired(now_ms()) {
            request.status = ContactRequestStatus::Expired;
            let _ = self.ctx.contacts.update(request);
            self.ack(
                &message.meta.message_id,
                MessageStatus::Failed,
                Some("contact request expired".to_string()),
            );
            return false;
        }
        request.status = if accepted {
            ContactRequestStatus::Accepted
        } else {
            ContactRequestStatus::Rejected
        };
        let _ = self.ctx.contacts.update(request);
        true
    }

    /// `SENT` acknowledgment for a successfully forwarded message.
    fn server_ack(&self, message: &Message) {
        let wants_ack = matches!(
            message.tag(),
            MessageTag::Text
                | MessageTag::Media
                | MessageTag::Encrypted
                | MessageTag::ContactRequest
                | MessageTag::ContactRequestResponse
        );
        if wants_ack && !message.meta.message_id.is_empty() {
            self.ack(&message.meta.message_id, MessageStatus::Sent, None);
        }
    }

    fn ack(&self, acknowledged_id: &str, status: MessageStatus, reason: Option<String>) {
        self.ack_with_extras(acknowledged_id, status, reason, serde_json::json!({}));
    }

    fn ack_with_extras(
        &self,
        acknowledged_id: &str,
        status: MessageStatus,
        reason: Option<String>,
        extras: serde_json::Value,
    ) {
        let timestamp_ms = now_ms();
        let message = Message::new(
            MessageMeta {
                message_id: self.ctx.ids.generate(SERVER_ID, timestamp_ms),
                timestamp_ms,
                from: SERVER_ID,
                to: self.user_id.unwrap_or(0),
            },
            MessageBody::Ack {
                acknowledged_id: acknowledged_id.to_string(),
                status,
                reason,
                extras,
            },
        );
        let _ = self.out.send(Outbound::Notify(message));
    }

    /// Queue a relay-originated message to this connection.
    fn notify_self(&self, body: MessageBody) {
        let to = self.user_id.unwrap_or(0);
        let _ = self.out.send(Outbound::Notify(self.relay_message(to, body)));
    }

    /// Queue a relay-originated message to any connected user.
    fn notify_user(&self, to: UserId, body: MessageBody) {
        let message = self.relay_message(to, body);
        if Some(to) == self.user_id {
            let _ = self.out.send(Outbound::Notify(message));
        } else if !self.ctx.registry.send_to(to, Outbound::Notify(message)) {
            tracing::debug!(to, "notification dropped, user offline");
        }
    }

    fn relay_message(&self, to: UserId, body: MessageBody) -> Message {
        let timestamp_ms = now_ms();
        Message::new(
            MessageMeta {
                message_id: self.ctx.ids.generate(SERVER_ID, timestamp_ms),
                timestamp_ms,
                from: SERVER_ID,
                to,
            },
            body,
        )
    }
}
