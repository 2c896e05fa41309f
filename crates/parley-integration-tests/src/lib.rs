//! Shared fixtures for the Parley integration tests.
//!
//! The end-to-end scenarios live in `tests/`; this library provides the
//! pieces they share:
//!
//! - [`start_relay`] — a relay on an ephemeral loopback port
//! - [`TestPeer`] — a hand-rolled protocol peer speaking the wire format
//!   directly, used to capture, replay, and tamper with packets in ways the
//!   real client never would
//! - [`wait_until`] — bounded polling for cross-task assertions

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parley_crypto::kdf::derive_session_key;
use parley_crypto::x25519::{ExchangeKeypair, ExchangePublicKey};
use parley_envelope::Envelope;
use parley_keyex::server::ServerLink;
use parley_server::{RelayServer, ServerConfig, ServerContext};
use parley_session::{private_conversation, SessionKeyStore};
use parley_types::message_id::MessageIdGenerator;
use parley_types::{now_ms, UserId, SERVER_ID};
use parley_wire::message::{
    AckConnection, CreateUser, KeyExchangePayload, Message, MessageBody, MessageMeta,
};
use parley_wire::packet::{read_packet, write_packet, Packet};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A running relay for one test.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub context: Arc<ServerContext>,
    pub link_store: Arc<SessionKeyStore>,
}

/// Start a relay on an ephemeral loopback port.
pub async fn start_relay() -> TestRelay {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    };
    let server = RelayServer::bind(&config).await.expect("bind relay");
    let addr = server.local_addr().expect("local addr");
    let context = server.context();
    let link_store = server.session_store();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    TestRelay {
        addr,
        context,
        link_store,
    }
}

/// Subscribe synchronously to one event kind, buffering everything seen.
pub fn collect_events(
    bus: &parley_router::EventBus,
    kind: parley_types::events::EventKind,
) -> Arc<std::sync::Mutex<Vec<parley_types::events::Event>>> {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(kind, parley_router::DeliveryMode::Sync, move |event| {
        if let Ok(mut seen) = sink.lock() {
            seen.push(event.clone());
        }
    });
    seen
}

/// Number of buffered events in a [`collect_events`] buffer.
pub fn event_count(buffer: &Arc<std::sync::Mutex<Vec<parley_types::events::Event>>>) -> usize {
    buffer.lock().map(|b| b.len()).unwrap_or(0)
}

/// Poll `predicate` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A minimal protocol peer that speaks the wire format by hand.
///
/// Unlike the real client it exposes raw packet I/O, which lets tests
/// capture an `ENCRYPTED` frame and deliver it twice, or flip ciphertext
/// bits before sending.
pub struct TestPeer {
    pub user_id: UserId,
    pub store: Arc<SessionKeyStore>,
    pub envelope: Envelope,
    pub link_conv: String,
    pub ids: MessageIdGenerator,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl TestPeer {
    /// Connect, complete the link exchange, and register an account.
    pub async fn connect(addr: SocketAddr, pseudo: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        stream.set_nodelay(true).expect("nodelay");
        let (mut reader, mut writer) = stream.into_split();

        let store = Arc::new(SessionKeyStore::new());
        let envelope = Envelope::new(Arc::clone(&store));
        let link = ServerLink::new(Arc::clone(&store));
        let ids = MessageIdGenerator::new();

        // Link exchange.
        let offer = read_packet(&mut reader).await.expect("offer");
        let offer = Message::from_packet(&offer).expect("parse offer");
        let MessageBody::ServerKeyExchange { spki } = &offer.body else {
            unreachable!("relay speaks server key exchange first");
        };
        let response = link.establish(spki).expect("establish link");
        write_packet(&mut writer, &response.to_packet().expect("encode"))
            .await
            .expect("send response");
        let link_conv = link.conversation_id().expect("link conversation");

        // Register.
        let timestamp_ms = now_ms();
        let hello = Message::new(
            MessageMeta {
                message_id: ids.generate(0, timestamp_ms),
                timestamp_ms,
                from: 0,
                to: SERVER_ID,
            },
            MessageBody::CreateUser(CreateUser {
                pseudo: pseudo.to_string(),
            }),
        );
        let sealed = envelope.server_seal(&hello, &link_conv).expect("seal hello");
        write_packet(&mut writer, &sealed.to_packet().expect("encode"))
            .await
            .expect("send hello");

        let reply = read_packet(&mut reader).await.expect("ack");
        let reply = Message::from_packet(&reply).expect("parse ack");
        let reply = match reply.body {
            MessageBody::ServerEncrypted { .. } => envelope
                .server_unseal(&reply, &link_conv)
                .expect("unseal ack"),
            _ => reply,
        };
        let MessageBody::AckConnection(AckConnection { user_id }) = reply.body else {
            unreachable!("relay acknowledges the connection");
        };

        Self {
            user_id,
            store,
            envelope,
            link_conv,
            ids,
            reader,
            writer,
        }
    }

    /// Send a raw packet, exactly as given.
    pub async fn send_packet(&mut self, packet: &Packet) {
        write_packet(&mut self.writer, packet).await.expect("send");
    }

    /// Encode and send a message without any sealing.
    pub async fn send_plain(&mut self, message: &Message) {
        let packet = message.to_packet().expect("encode");
        self.send_packet(&packet).await;
    }

    /// Receive the next message, unwrapping the server envelope.
    pub async fn recv(&mut self) -> Message {
        let packet = read_packet(&mut self.reader).await.expect("read");
        let message = Message::from_packet(&packet).expect("parse");
        match message.body {
            MessageBody::ServerEncrypted { .. } => self
                .envelope
                .server_unseal(&message, &self.link_conv)
                .expect("server unseal"),
            _ => message,
        }
    }

    /// Receive the next non-acknowledgment message.
    pub async fn recv_skipping_acks(&mut self) -> Message {
        loop {
            let message = self.recv().await;
            if !matches!(message.body, MessageBody::Ack { .. }) {
                return message;
            }
        }
    }

    /// Run the initiator side of the private exchange with `peer` by hand
    /// and store the derived session key.
    pub async fn establish_private_session(&mut self, peer: UserId) {
        let keypair = ExchangeKeypair::generate();
        let timestamp_ms = now_ms();
        let request = Message::new(
            MessageMeta {
                message_id: self.ids.generate(self.user_id, timestamp_ms),
                timestamp_ms,
                from: self.user_id,
                to: peer,
            },
            MessageBody::KeyExchange(KeyExchangePayload::PublicKey {
                spki: keypair.public_key().to_spki(),
            }),
        );
        self.send_plain(&request).await;

        let response = loop {
            let message = self.recv_skipping_acks().await;
            if let MessageBody::KeyExchangeResponse { spki } = &message.body {
                break spki.clone();
            }
        };
        let their_public = ExchangePublicKey::from_spki(&response).expect("peer key");

        let conversation_id = private_conversation(self.user_id, peer);
        let key = derive_session_key(&keypair.diffie_hellman(&their_public), &conversation_id)
            .expect("derive");
        self.store.store(&conversation_id, key).expect("store");
    }

    /// Seal a text message end-to-end and return the ready-to-send packet.
    pub fn seal_text(&self, to: UserId, content: &str) -> Packet {
        let timestamp_ms = now_ms();
        let message = Message::new(
            MessageMeta {
                message_id: self.ids.generate(self.user_id, timestamp_ms),
                timestamp_ms,
                from: self.user_id,
                to,
            },
            MessageBody::Text {
                content: content.to_string(),
            },
        );
        let conversation_id = private_conversation(self.user_id, to);
        self.envelope
            .seal(&message, &conversation_id)
            .expect("seal")
            .to_packet()
            .expect("encode")
    }
}
