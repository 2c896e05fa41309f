//! The client-to-relay link exchange.
//!
//! On connect the relay offers `SERVER_KEY_EXCHANGE` with its ephemeral
//! public key. The client derives the link key under the conversation id
//! `server_session_<hex(sha256(server_spki ‖ client_spki)[..8])>` and
//! answers `SERVER_KEY_EXCHANGE_RESPONSE`. Designated management kinds then
//! ride inside `SERVER_ENCRYPTED` wrappers; key-exchange kinds and wrappers
//! themselves are never re-wrapped.

use std::sync::{Arc, Mutex};

use parley_crypto::kdf::derive_session_key;
use parley_crypto::x25519::{ExchangeKeypair, ExchangePublicKey};
use parley_session::{server_conversation, SessionKeyStore};
use parley_types::SERVER_ID;
use parley_wire::message::{Message, MessageBody, MessageMeta};

use crate::{KeyExchangeError, Result};

/// Client half of the relay link exchange.
pub struct ServerLink {
    store: Arc<SessionKeyStore>,
    conversation_id: Mutex<Option<String>>,
}

impl ServerLink {
    /// Create an unestablished link.
    pub fn new(store: Arc<SessionKeyStore>) -> Self {
        Self {
            store,
            conversation_id: Mutex::new(None),
        }
    }

    /// Handle the relay's `SERVER_KEY_EXCHANGE` offer: derive and store the
    /// link key, and produce the response message to send back.
    ///
    /// # Errors
    ///
    /// - [`KeyExchangeError::UnsupportedKeyFormat`] /
    ///   [`KeyExchangeError::InvalidPublicKey`] for a malformed server key
    /// - [`KeyExchangeError::CryptoFailure`] if derivation fails
    pub fn establish(&self, server_spki: &[u8]) -> Result<Message> {
        let server_public = ExchangePublicKey::from_spki(server_spki)?;

        let keypair = ExchangeKeypair::generate();
        let client_spki = keypair.public_key().to_spki();
        let conversation_id = server_conversation(server_spki, &client_spki);

        let shared = keypair.diffie_hellman(&server_public);
        let key = derive_session_key(&shared, &conversation_id)?;
        self.store.store(&conversation_id, key)?;

        if let Ok(mut conv) = self.conversation_id.lock() {
            *conv = Some(conversation_id.clone());
        }

        tracing::info!(%conversation_id, "server link established");

        Ok(Message::new(
            MessageMeta {
                message_id: String::new(),
                timestamp_ms: 0,
                from: 0,
                to: SERVER_ID,
            },
            MessageBody::ServerKeyExchangeResponse { spki: client_spki },
        ))
    }

    /// The link conversation id, once established.
    pub fn conversation_id(&self) -> Option<String> {
        self.conversation_id.lock().ok().and_then(|c| c.clone())
    }

    /// Whether the link key has been derived.
    pub fn is_established(&self) -> bool {
        self.conversation_id().is_some()
    }
}

/// Relay half of the link exchange, one per accepted connection.
pub struct ServerLinkAcceptor {
    store: Arc<SessionKeyStore>,
    keypair: ExchangeKeypair,
    conversation_id: Mutex<Option<String>>,
}

impl ServerLinkAcceptor {
    /// Create an acceptor with a fresh ephemeral keypair.
    pub fn new(store: Arc<SessionKeyStore>) -> Self {
        Self {
            store,
            keypair: ExchangeKeypair::generate(),
            conversation_id: Mutex::new(None),
        }
    }

    /// The `SERVER_KEY_EXCHANGE` offer to send on connect.
    pub fn offer(&self) -> Message {
        Message::new(
            MessageMeta {
                message_id: String::new(),
                timestamp_ms: 0,
                from: SERVER_ID,
                to: 0,
            },
            MessageBody::ServerKeyExchange {
                spki: self.keypair.public_key().to_spki(),
            },
        )
    }

    /// Handle the client's response: derive and store the link key.
    ///
    /// Returns the conversation id.
    ///
    /// # Errors
    ///
    /// Same as [`ServerLink::establish`].
    pub fn handle_response(&self, client_spki: &[u8]) -> Result<String> {
        let client_public = ExchangePublicKey::from_spki(client_spki)?;

        let server_spki = self.keypair.public_key().to_spki();
        let conversation_id = server_conversation(&server_spki, client_spki);

        let shared = self.keypair.diffie_hellman(&client_public);
        let key = derive_session_key(&shared, &conversation_id)?;
        self.store.store(&conversation_id, key)?;

        if let Ok(mut conv) = self.conversation_id.lock() {
            *conv = Some(conversation_id.clone());
        }

        tracing::debug!(%conversation_id, "client link established");
        Ok(conversation_id)
    }

    /// The link conversation id, once the response has been processed.
    pub fn conversation_id(&self) -> Option<String> {
        self.conversation_id.lock().ok().and_then(|c| c.clone())
    }
}
