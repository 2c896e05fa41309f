//! Seal and unseal.
//!
//! ## Seal
//!
//! 1. Serialize the original message to its payload bytes.
//! 2. Draw a fresh random nonce.
//! 3. Fetch the next outbound sequence for the conversation.
//! 4. Encrypt with the 8-byte big-endian sequence as associated data, so
//!    any tampering with the sequence breaks authentication.
//! 5. Emit the `ENCRYPTED` wrapper carrying the original tag, sequence,
//!    nonce, and ciphertext.
//!
//! ## Unseal
//!
//! The replay check runs before decryption; a rejected sequence drops the
//! message silently. Authentication failures surface as errors for the
//! router to report — the connection stays up.

use std::sync::Arc;

use parley_crypto::aead;
use parley_session::SessionKeyStore;
use parley_types::SERVER_ID;
use parley_wire::message::{Message, MessageBody, MessageMeta};
use parley_wire::packet::Packet;
use parley_wire::tag::MessageTag;

use crate::{EnvelopeError, Result};

/// Message kinds eligible for end-to-end sealing.
pub const ENCRYPTABLE_KINDS: &[MessageTag] = &[
    MessageTag::Text,
    MessageTag::Media,
    MessageTag::ContactRequest,
    MessageTag::CreateGroup,
    MessageTag::LeaveGroup,
    MessageTag::AddGroupMember,
    MessageTag::RemoveGroupMember,
];

/// Management kinds carried inside `SERVER_ENCRYPTED` on the relay link.
pub const SERVER_ENCRYPTABLE_KINDS: &[MessageTag] = &[
    MessageTag::CreateUser,
    MessageTag::ConnectUser,
    MessageTag::AckConnection,
    MessageTag::UpdatePseudo,
    MessageTag::RemoveContact,
    MessageTag::CreateGroup,
    MessageTag::LeaveGroup,
    MessageTag::AddGroupMember,
    MessageTag::RemoveGroupMember,
];

/// Seals and unseals message payloads against the session key store.
pub struct Envelope {
    store: Arc<SessionKeyStore>,
    encryption_enabled: bool,
}

impl Envelope {
    /// Create an envelope with encryption enabled.
    pub fn new(store: Arc<SessionKeyStore>) -> Self {
        Self::with_enabled(store, true)
    }

    /// Create an envelope with an explicit encryption switch.
    pub fn with_enabled(store: Arc<SessionKeyStore>, encryption_enabled: bool) -> Self {
        Self {
            store,
            encryption_enabled,
        }
    }

    /// The session key store backing this envelope.
    pub fn store(&self) -> &Arc<SessionKeyStore> {
        &self.store
    }

    /// Whether this kind is ever end-to-end sealed. Key-exchange kinds,
    /// acks, and wrappers never are.
    pub fn is_encryptable(tag: MessageTag) -> bool {
        ENCRYPTABLE_KINDS.contains(&tag)
    }

    /// Whether this kind rides the server envelope on the relay link.
    pub fn is_server_encryptable(tag: MessageTag) -> bool {
        SERVER_ENCRYPTABLE_KINDS.contains(&tag)
    }

    /// Sealing policy: encryption on, target is another client (or group),
    /// a session key exists, and the kind is in the encryptable set.
    pub fn should_encrypt(&self, message: &Message, conversation_id: &str) -> bool {
        self.encryption_enabled
            && message.meta.to != SERVER_ID
            && Self::is_encryptable(message.tag())
            && self.store.has_session(conversation_id)
    }

    /// Seal a message into an `ENCRYPTED` wrapper.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::NotEncryptable`] for kinds outside the set
    /// - [`EnvelopeError::NoSession`] if no key is stored
    /// - [`EnvelopeError::Wire`] if the inner payload fails to encode
    pub fn seal(&self, message: &Message, conversation_id: &str) -> Result<Message> {
        if !Self::is_encryptable(message.tag()) {
            return Err(EnvelopeError::NotEncryptable(message.tag()));
        }
        let key = self
            .store
            .get_key(conversation_id)
            .ok_or_else(|| EnvelopeError::NoSession(conversation_id.to_string()))?;

        let plaintext = message.to_payload()?;
        let nonce = aead::generate_nonce();
        let sequence = self.store.next_send_seq(conversation_id)?;

        let ciphertext = aead::encrypt(&key, &nonce, &plaintext, &sequence.to_be_bytes())
            .map_err(|_| EnvelopeError::Authentication(conversation_id.to_string()))?;

        tracing::trace!(conversation_id, sequence, "message sealed");

        Ok(Message::new(
            message.meta.clone(),
            MessageBody::Encrypted {
                original_tag: message.tag(),
                sequence,
                nonce,
                ciphertext,
            },
        ))
    }

    /// Unseal an `ENCRYPTED` wrapper back into the original typed message,
    /// stamping `from`/`to` from the wrapper.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::Replay`] if the sequence fails the strict `>`
    ///   check — drop silently
    /// - [`EnvelopeError::Authentication`] if the AEAD tag does not verify
    /// - [`EnvelopeError::NoSession`] if no key is stored
    pub fn unseal(&self, wrapper: &Message, conversation_id: &str) -> Result<Message> {
        let MessageBody::Encrypted {
            original_tag,
            sequence,
            nonce,
            ciphertext,
        } = &wrapper.body
        else {
            return Err(EnvelopeError::NotEncryptable(wrapper.tag()));
        };

        let key = self
            .store
            .get_key(conversation_id)
            .ok_or_else(|| EnvelopeError::NoSession(conversation_id.to_string()))?;

        if !self.store.validate_recv_seq(conversation_id, *sequence) {
            return Err(EnvelopeError::Replay {
                conversation_id: conversation_id.to_string(),
                sequence: *sequence,
            });
        }

        let plaintext = aead::decrypt(&key, nonce, ciphertext, &sequence.to_be_bytes())
            .map_err(|_| EnvelopeError::Authentication(conversation_id.to_string()))?;

        let inner = Packet::new(*original_tag, wrapper.meta.from, wrapper.meta.to, plaintext);
        Ok(Message::from_packet(&inner)?)
    }

    /// Seal a message into a `SERVER_ENCRYPTED` wrapper for the relay link.
    ///
    /// The server envelope carries no sequence: the underlying transport is
    /// a single in-order connection.
    ///
    /// # Errors
    ///
    /// Same as [`seal`](Self::seal), without the replay bookkeeping.
    pub fn server_seal(&self, message: &Message, conversation_id: &str) -> Result<Message> {
        let key = self
            .store
            .get_key(conversation_id)
            .ok_or_else(|| EnvelopeError::NoSession(conversation_id.to_string()))?;

        let plaintext = message.to_payload()?;
        let nonce = aead::generate_nonce();
        let ciphertext = aead::encrypt(&key, &nonce, &plaintext, &[])
            .map_err(|_| EnvelopeError::Authentication(conversation_id.to_string()))?;

        Ok(Message::new(
            MessageMeta {
                message_id: String::new(),
                timestamp_ms: 0,
                from: message.meta.from,
                to: message.meta.to,
            },
            MessageBody::ServerEncrypted {
                original_tag: message.tag(),
                nonce,
                ciphertext,
            },
        ))
    }

    /// Unseal a `SERVER_ENCRYPTED` wrapper.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::Authentication`] if the AEAD tag does not verify
    /// - [`EnvelopeError::NoSession`] if no key is stored
    pub fn server_unseal(&self, wrapper: &Message, conversation_id: &str) -> Result<Message> {
        let MessageBody::ServerEncrypted {
            original_tag,
            nonce,
            ciphertext,
        } = &wrapper.body
        else {
            return Err(EnvelopeError::NotEncryptable(wrapper.tag()));
        };

        let key = self
            .store
            .get_key(conversation_id)
            .ok_or_else(|| EnvelopeError::NoSession(conversation_id.to_string()))?;

        let plaintext = aead::decrypt(&key, nonce, ciphertext, &[])
            .map_err(|_| EnvelopeError::Authentication(conversation_id.to_string()))?;

        let inner = Packet::new(*original_tag, wrapper.meta.from, wrapper.meta.to, plaintext);
        Ok(Message::from_packet(&inner)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_crypto::key::SessionKey;
    use parley_session::private_conversation;

    fn envelope() -> Envelope {
        let store = Arc::new(SessionKeyStore::new());
        store
            .store("private_1_2", SessionKey::from_bytes([7u8; 32]))
            .expect("store");
        Envelope::new(store)
    }

    fn text(content: &str) -> Message {
        Message::new(
            MessageMeta {
                message_id: "m1".to_string(),
                timestamp_ms: 1_000,
                from: 1,
                to: 2,
            },
            MessageBody::Text {
                content: content.to_string(),
            },
        )
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let sender = envelope();
        let conv = private_conversation(1, 2);

        let sealed = sender.seal(&text("hello"), &conv).expect("seal");
        assert_eq!(sealed.tag(), MessageTag::Encrypted);

        // The receiving side has its own store with the same key.
        let receiver = envelope();
        let opened = receiver.unseal(&sealed, &conv).expect("unseal");
        assert_eq!(opened, text("hello"));
    }

    #[test]
    fn test_sequences_increment_per_seal() {
        let envelope = envelope();
        let conv = private_conversation(1, 2);

        for expected in 0..3u64 {
            let sealed = envelope.seal(&text("x"), &conv).expect("seal");
            let MessageBody::Encrypted { sequence, .. } = sealed.body else {
                unreachable!("seal produced a non-wrapper");
            };
            assert_eq!(sequence, expected);
        }
    }

    #[test]
    fn test_replay_dropped() {
        let sender = envelope();
        let receiver = envelope();
        let conv = private_conversation(1, 2);

        let sealed = sender.seal(&text("once"), &conv).expect("seal");
        receiver.unseal(&sealed, &conv).expect("first delivery");

        assert!(matches!(
            receiver.unseal(&sealed, &conv),
            Err(EnvelopeError::Replay { .. })
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let sender = envelope();
        let receiver = envelope();
        let conv = private_conversation(1, 2);

        let mut sealed = sender.seal(&text("secret"), &conv).expect("seal");
        if let MessageBody::Encrypted { ciphertext, .. } = &mut sealed.body {
            ciphertext[0] ^= 0x01;
        }

        assert!(matches!(
            receiver.unseal(&sealed, &conv),
            Err(EnvelopeError::Authentication(_))
        ));
    }

    #[test]
    fn test_tampered_sequence_fails_authentication() {
        let sender = envelope();
        let receiver = envelope();
        let conv = private_conversation(1, 2);

        let mut sealed = sender.seal(&text("secret"), &conv).expect("seal");
        if let MessageBody::Encrypted { sequence, .. } = &mut sealed.body {
            *sequence += 1;
        }

        assert!(matches!(
            receiver.unseal(&sealed, &conv),
            Err(EnvelopeError::Authentication(_))
        ));
    }

    #[test]
    fn test_key_exchange_kinds_never_sealed() {
        let envelope = envelope();
        let message = Message::new(
            MessageMeta {
                message_id: "k1".to_string(),
                timestamp_ms: 1,
                from: 1,
                to: 2,
            },
            MessageBody::KeyExchangeResponse { spki: vec![1] },
        );
        assert!(matches!(
            envelope.seal(&message, "private_1_2"),
            Err(EnvelopeError::NotEncryptable(_))
        ));
        assert!(!envelope.should_encrypt(&message, "private_1_2"));
    }

    #[test]
    fn test_should_encrypt_policy() {
        let envelope = envelope();
        assert!(envelope.should_encrypt(&text("x"), "private_1_2"));

        // No session.
        assert!(!envelope.should_encrypt(&text("x"), "private_1_9"));

        // Relay-bound.
        let mut to_server = text("x");
        to_server.meta.to = SERVER_ID;
        assert!(!envelope.should_encrypt(&to_server, "private_1_2"));

        // Encryption disabled.
        let store = Arc::new(SessionKeyStore::new());
        store
            .store("private_1_2", SessionKey::from_bytes([7u8; 32]))
            .expect("store");
        let disabled = Envelope::with_enabled(store, false);
        assert!(!disabled.should_encrypt(&text("x"), "private_1_2"));
    }

    #[test]
    fn test_server_envelope_roundtrip() {
        let store = Arc::new(SessionKeyStore::new());
        store
            .store("server_session_aabb", SessionKey::from_bytes([9u8; 32]))
            .expect("store");
        let envelope = Envelope::new(store);

        let message = Message::new(
            MessageMeta {
                message_id: "c1".to_string(),
                timestamp_ms: 5,
                from: 1,
                to: SERVER_ID,
            },
            MessageBody::CreateUser(parley_wire::message::CreateUser {
                pseudo: "alice".to_string(),
            }),
        );

        let sealed = envelope
            .server_seal(&message, "server_session_aabb")
            .expect("seal");
        assert_eq!(sealed.tag(), MessageTag::ServerEncrypted);

        let opened = envelope
            .server_unseal(&sealed, "server_session_aabb")
            .expect("unseal");
        assert_eq!(opened, message);
    }

    #[test]
    fn test_sealed_bytes_hide_plaintext() {
        let envelope = envelope();
        let sealed = envelope
            .seal(&text("attack at dawn"), "private_1_2")
            .expect("seal");
        let bytes = sealed.to_packet().expect("packet").encode();
        let haystack = String::from_utf8_lossy(&bytes);
        assert!(!haystack.contains("attack at dawn"));
    }
}
