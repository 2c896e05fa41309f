//! Group key distribution.
//!
//! The group key is a single AES-256 key shared by all current members.
//! Only the admin generates it; everyone else treats the most recent
//! received key as authoritative. Distribution is pairwise: the key is
//! wrapped per recipient under the private session key already established
//! with that recipient, and rides inside `KEY_EXCHANGE` payloads marked
//! `0xFF` (distribution) / `0xFE` (acknowledgment).
//!
//! Every membership change rotates the key: a fresh key replaces the old
//! entry and is fanned out to all current members.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parley_crypto::aead;
use parley_crypto::key::SessionKey;
use parley_session::{group_conversation, private_conversation, SessionKeyStore};
use parley_types::events::{ErrorLevel, Event, EventSink};
use parley_types::group::Group;
use parley_types::message_id::MessageIdGenerator;
use parley_types::{
    now_ms, GroupId, UserId, GROUP_ACK_TIMEOUT_SECS, KEY_EXCHANGE_TIMEOUT_SECS,
};
use parley_wire::message::{KeyExchangePayload, Message, MessageBody, MessageMeta};
use tokio::sync::mpsc;

use crate::private::PrivateKeyExchange;
use crate::{KeyExchangeError, Result};

/// Minimum length of a wrapped group key: nonce plus AEAD tag.
const MIN_WRAPPED_LEN: usize = aead::NONCE_SIZE + aead::TAG_SIZE;

/// The group key engine.
pub struct GroupKeyExchange {
    local_id: UserId,
    store: Arc<SessionKeyStore>,
    private: Arc<PrivateKeyExchange>,
    outbound: mpsc::UnboundedSender<Message>,
    ids: Arc<MessageIdGenerator>,
    events: Arc<dyn EventSink>,
    ack_timeout: Duration,
    exchange_timeout: Duration,
    /// Distributions awaiting a member acknowledgment.
    pending_acks: Mutex<HashMap<(GroupId, UserId), Instant>>,
}

impl GroupKeyExchange {
    /// Create an engine with the standard ack and exchange timeouts.
    pub fn new(
        local_id: UserId,
        store: Arc<SessionKeyStore>,
        private: Arc<PrivateKeyExchange>,
        outbound: mpsc::UnboundedSender<Message>,
        ids: Arc<MessageIdGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_timeouts(
            local_id,
            store,
            private,
            outbound,
            ids,
            events,
            Duration::from_secs(GROUP_ACK_TIMEOUT_SECS as u64),
            Duration::from_secs(KEY_EXCHANGE_TIMEOUT_SECS as u64),
        )
    }

    /// Create an engine with explicit ack and private-exchange timeouts.
    #[allow(clippy::too_many_arguments)]
    pub fn with_timeouts(
        local_id: UserId,
        store: Arc<SessionKeyStore>,
        private: Arc<PrivateKeyExchange>,
        outbound: mpsc::UnboundedSender<Message>,
        ids: Arc<MessageIdGenerator>,
        events: Arc<dyn EventSink>,
        ack_timeout: Duration,
        exchange_timeout: Duration,
    ) -> Self {
        Self {
            local_id,
            store,
            private,
            outbound,
            ids,
            events,
            ack_timeout,
            exchange_timeout,
            pending_acks: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a group session key is stored.
    pub fn has_session(&self, group_id: GroupId) -> bool {
        self.store.has_session(&group_conversation(group_id))
    }

    /// Number of distributions still awaiting an ack for `group_id`.
    pub fn pending_ack_count(&self, group_id: GroupId) -> usize {
        self.pending_acks
            .lock()
            .map(|acks| acks.keys().filter(|(gid, _)| *gid == group_id).count())
            .unwrap_or(0)
    }

    /// Group creation: generate the initial key and fan it out to every
    /// member except the admin itself.
    ///
    /// # Errors
    ///
    /// Returns [`KeyExchangeError::ProtocolViolation`] if the local user is
    /// not the group admin.
    pub async fn establish(&self, group: &Group) -> Result<()> {
        self.distribute_new_key(group).await
    }

    /// Membership-change rotation: generate a fresh key, replace the old
    /// entry, and fan the new key out to all current members.
    ///
    /// # Errors
    ///
    /// Same as [`establish`](Self::establish).
    pub async fn rotate(&self, group: &Group) -> Result<()> {
        self.distribute_new_key(group).await?;
        self.events.publish(Event::GroupKeyRotated {
            group_id: group.group_id,
        });
        Ok(())
    }

    /// Store a received group key and acknowledge it (non-admin path).
    ///
    /// The wrapped key is `nonce ‖ AES-GCM(private_session_key, group_key)`.
    ///
    /// # Errors
    ///
    /// - [`KeyExchangeError::NoSession`] if no private session with the
    ///   sender exists to unwrap under
    /// - [`KeyExchangeError::CryptoFailure`] if unwrapping fails
    /// - [`KeyExchangeError::ProtocolViolation`] if the payload is malformed
    pub fn handle_distribution(
        &self,
        from: UserId,
        group_id: GroupId,
        encrypted_key: &[u8],
    ) -> Result<()> {
        if encrypted_key.len() < MIN_WRAPPED_LEN {
            return Err(KeyExchangeError::ProtocolViolation(format!(
                "wrapped group key too short: {} bytes",
                encrypted_key.len()
            )));
        }

        let private_conv = private_conversation(self.local_id, from);
        let private_key = self
            .store
            .get_key(&private_conv)
            .ok_or(KeyExchangeError::NoSession(private_conv))?;

        let mut nonce = [0u8; aead::NONCE_SIZE];
        nonce.copy_from_slice(&encrypted_key[..aead::NONCE_SIZE]);
        let plaintext = aead::decrypt(
            &private_key,
            &nonce,
            &encrypted_key[aead::NONCE_SIZE..],
            &[],
        )
        .map_err(|_| {
            KeyExchangeError::CryptoFailure("group key unwrap failed".to_string())
        })?;

        let group_key = SessionKey::from_slice(&plaintext)
            .map_err(|e| KeyExchangeError::CryptoFailure(e.to_string()))?;

        let conversation_id = group_conversation(group_id);
        self.store.store(&conversation_id, group_key)?;

        tracing::info!(group_id, from, "group key stored");

        self.send(
            from,
            MessageBody::KeyExchange(KeyExchangePayload::GroupAck { group_id }),
        )?;
        self.events.publish(Event::SecureSessionReady { conversation_id });
        Ok(())
    }

    /// Record a member's acknowledgment of a distributed key (admin path).
    pub fn handle_ack(&self, from: UserId, group_id: GroupId) {
        let acknowledged = self
            .pending_acks
            .lock()
            .map(|mut acks| acks.remove(&(group_id, from)).is_some())
            .unwrap_or(false);
        if acknowledged {
            tracing::debug!(group_id, member = from, "group key acknowledged");
        } else {
            tracing::debug!(group_id, member = from, "unexpected group key ack");
        }
    }

    /// Remove the local group session.
    pub fn invalidate(&self, group_id: GroupId, reason: &str) {
        let conversation_id = group_conversation(group_id);
        if self.store.remove(&conversation_id) {
            tracing::info!(group_id, reason, "group session invalidated");
            self.events.publish(Event::SessionInvalidated {
                conversation_id,
                reason: reason.to_string(),
            });
        }
        if let Ok(mut acks) = self.pending_acks.lock() {
            acks.retain(|(gid, _), _| *gid != group_id);
        }
    }

    /// One sweeper pass: report distributions whose ack never arrived.
    pub fn sweep(&self) {
        let now = Instant::now();
        let timed_out: Vec<(GroupId, UserId)> = match self.pending_acks.lock() {
            Ok(mut acks) => {
                let expired: Vec<_> = acks
                    .iter()
                    .filter(|(_, sent_at)| now.duration_since(**sent_at) >= self.ack_timeout)
                    .map(|(key, _)| *key)
                    .collect();
                for key in &expired {
                    acks.remove(key);
                }
                expired
            }
            Err(_) => return,
        };

        for (group_id, member) in timed_out {
            tracing::warn!(group_id, member, "group key ack timed out");
            self.events.publish(Event::Error {
                level: ErrorLevel::Warning,
                kind: "GROUP_ACK_TIMEOUT".to_string(),
                message: format!("member {member} did not acknowledge group {group_id} key"),
            });
        }
    }

    /// Generate a fresh key, store it, and wrap it to every other member.
    async fn distribute_new_key(&self, group: &Group) -> Result<()> {
        if group.admin_id != self.local_id {
            return Err(KeyExchangeError::ProtocolViolation(format!(
                "user {} is not the admin of group {}",
                self.local_id, group.group_id
            )));
        }

        let group_key = SessionKey::random();
        let conversation_id = group_conversation(group.group_id);
        self.store.store(&conversation_id, group_key.clone())?;

        tracing::info!(
            group_id = group.group_id,
            members = group.members.len(),
            "distributing group key"
        );

        for &member in &group.members {
            if member == self.local_id {
                continue;
            }
            if let Err(err) = self.send_wrapped(group.group_id, member, &group_key).await {
                tracing::warn!(
                    group_id = group.group_id,
                    member,
                    error = %err,
                    "group key distribution failed"
                );
                self.events.publish(Event::Error {
                    level: ErrorLevel::Error,
                    kind: "GROUP_KEY_DISTRIBUTION".to_string(),
                    message: format!(
                        "could not deliver group {} key to member {member}: {err}",
                        group.group_id
                    ),
                });
            }
        }

        self.events.publish(Event::SecureSessionReady { conversation_id });
        Ok(())
    }

    /// Wrap the group key under the private session with `member`,
    /// establishing that session first if needed.
    async fn send_wrapped(
        &self,
        group_id: GroupId,
        member: UserId,
        group_key: &SessionKey,
    ) -> Result<()> {
        if let Some(waiter) = self.private.ensure_session(member)? {
            match tokio::time::timeout(self.exchange_timeout, waiter).await {
                Ok(Ok(result)) => result?,
                Ok(Err(_)) => {
                    return Err(KeyExchangeError::Internal(
                        "exchange waiter dropped".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(KeyExchangeError::Timeout(format!(
                        "private session with {member} not established"
                    )))
                }
            }
        }

        let private_conv = private_conversation(self.local_id, member);
        let private_key = self
            .store
            .get_key(&private_conv)
            .ok_or(KeyExchangeError::NoSession(private_conv))?;

        let nonce = aead::generate_nonce();
        let ciphertext = aead::encrypt(&private_key, &nonce, group_key.as_bytes(), &[])
            .map_err(|e| KeyExchangeError::CryptoFailure(e.to_string()))?;

        let mut encrypted_key = Vec::with_capacity(nonce.len() + ciphertext.len());
        encrypted_key.extend_from_slice(&nonce);
        encrypted_key.extend_from_slice(&ciphertext);

        self.send(
            member,
            MessageBody::KeyExchange(KeyExchangePayload::GroupKey {
                group_id,
                encrypted_key,
            }),
        )?;

        if let Ok(mut acks) = self.pending_acks.lock() {
            acks.insert((group_id, member), Instant::now());
        }
        Ok(())
    }

    fn send(&self, to: UserId, body: MessageBody) -> Result<()> {
        let timestamp_ms = now_ms();
        let message = Message::new(
            MessageMeta {
                message_id: self.ids.generate(self.local_id, timestamp_ms),
                timestamp_ms,
                from: self.local_id,
                to,
            },
            body,
        );
        self.outbound
            .send(message)
            .map_err(|_| KeyExchangeError::StorageFailure("outbound queue closed".to_string()))
    }
}
