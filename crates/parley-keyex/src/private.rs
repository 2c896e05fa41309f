//! Peer-to-peer ephemeral ECDH key exchange.
//!
//! ## Protocol
//!
//! 1. The initiator generates an ephemeral X25519 keypair, records a
//!    pending exchange, and sends `KEY_EXCHANGE` with its public key.
//! 2. The responder generates its own keypair, derives the session key,
//!    stores it, and answers `KEY_EXCHANGE_RESPONSE`.
//! 3. The initiator derives the same key from its stored ephemeral secret
//!    and stores the session.
//!
//! Both sides feed HKDF the canonical conversation id, so the derived key
//! is identical regardless of role.
//!
//! ## Simultaneous initiation
//!
//! If a request arrives while our own initiation to the same peer is
//! pending, the participant with the lower id wins: the winner ignores the
//! incoming request and waits for its response; the loser discards its
//! pending exchange and answers as responder. Both sides converge on the
//! winner's exchange.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use parley_crypto::kdf::derive_session_key;
use parley_crypto::x25519::{ExchangeKeypair, ExchangePublicKey};
use parley_session::{private_conversation, SessionKeyStore};
use parley_types::events::{ErrorLevel, Event, EventSink};
use parley_types::message_id::MessageIdGenerator;
use parley_types::{now_ms, UserId, CLEANUP_INTERVAL_SECS, KEY_EXCHANGE_TIMEOUT_SECS};
use parley_wire::message::{KeyExchangePayload, Message, MessageBody, MessageMeta};
use tokio::sync::{mpsc, oneshot};

use crate::pending::{self, ExchangeState, PendingKeyExchange};
use crate::{KeyExchangeError, Result};

/// One-shot future resolved when an exchange completes, fails, or expires.
pub type ExchangeWaiter = oneshot::Receiver<Result<()>>;

type WaiterMap = HashMap<UserId, Vec<oneshot::Sender<Result<()>>>>;

/// The peer-to-peer key exchange engine.
///
/// All public methods are safe for concurrent callers.
pub struct PrivateKeyExchange {
    local_id: UserId,
    store: Arc<SessionKeyStore>,
    outbound: mpsc::UnboundedSender<Message>,
    ids: Arc<MessageIdGenerator>,
    events: Arc<dyn EventSink>,
    ttl: Duration,
    gc_after: Duration,
    pending: Mutex<HashMap<UserId, PendingKeyExchange>>,
    waiters: Mutex<WaiterMap>,
}

impl PrivateKeyExchange {
    /// Create an engine with the standard 30 s exchange TTL.
    pub fn new(
        local_id: UserId,
        store: Arc<SessionKeyStore>,
        outbound: mpsc::UnboundedSender<Message>,
        ids: Arc<MessageIdGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_timing(
            local_id,
            store,
            outbound,
            ids,
            events,
            Duration::from_secs(KEY_EXCHANGE_TIMEOUT_SECS as u64),
            Duration::from_secs(2 * CLEANUP_INTERVAL_SECS as u64),
        )
    }

    /// Create an engine with explicit TTL and terminal-state GC delay.
    #[allow(clippy::too_many_arguments)]
    pub fn with_timing(
        local_id: UserId,
        store: Arc<SessionKeyStore>,
        outbound: mpsc::UnboundedSender<Message>,
        ids: Arc<MessageIdGenerator>,
        events: Arc<dyn EventSink>,
        ttl: Duration,
        gc_after: Duration,
    ) -> Self {
        Self {
            local_id,
            store,
            outbound,
            ids,
            events,
            ttl,
            gc_after,
            pending: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// The local user id this engine acts as.
    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    /// Whether a private session with `peer` exists.
    pub fn has_session(&self, peer: UserId) -> bool {
        self.store
            .has_session(&private_conversation(self.local_id, peer))
    }

    /// Current pending state for `peer`, if any.
    pub fn pending_state(&self, peer: UserId) -> Option<ExchangeState> {
        self.lock_pending()
            .ok()
            .and_then(|pending| pending.get(&peer).map(|e| e.state))
    }

    /// Start an exchange with `peer`.
    ///
    /// Returns a waiter resolved when the session is stored, the exchange
    /// fails, or the TTL expires.
    ///
    /// # Errors
    ///
    /// - [`KeyExchangeError::InvalidPeerId`] for self or non-account ids
    /// - [`KeyExchangeError::SessionAlreadyExists`] if a session is active
    /// - [`KeyExchangeError::ExchangeAlreadyInProgress`] if a non-terminal
    ///   exchange with `peer` exists
    pub fn initiate(&self, peer: UserId) -> Result<ExchangeWaiter> {
        if peer == self.local_id || peer <= 0 {
            return Err(KeyExchangeError::InvalidPeerId(peer));
        }
        let conversation_id = private_conversation(self.local_id, peer);
        if self.store.has_session(&conversation_id) {
            return Err(KeyExchangeError::SessionAlreadyExists(conversation_id));
        }

        let spki = {
            let mut pending = self.lock_pending()?;
            if let Some(existing) = pending.get(&peer) {
                if !existing.state.is_terminal() {
                    return Err(KeyExchangeError::ExchangeAlreadyInProgress(peer));
                }
            }
            let keypair = ExchangeKeypair::generate();
            let spki = keypair.public_key().to_spki();
            pending.insert(
                peer,
                PendingKeyExchange::new(peer, keypair, true, ExchangeState::Initiated),
            );
            spki
        };

        tracing::debug!(peer, "initiating key exchange");

        if let Err(err) = self.send(
            peer,
            MessageBody::KeyExchange(KeyExchangePayload::PublicKey { spki }),
        ) {
            self.mark_failed(peer);
            return Err(err);
        }

        self.register_waiter(peer)
    }

    /// Idempotent session establishment: returns `None` when a session
    /// already exists, otherwise a waiter for the (possibly already
    /// in-flight) exchange.
    pub fn ensure_session(&self, peer: UserId) -> Result<Option<ExchangeWaiter>> {
        if self.has_session(peer) {
            return Ok(None);
        }
        let in_progress = self
            .pending_state(peer)
            .is_some_and(|state| !state.is_terminal());
        if in_progress {
            return Ok(Some(self.register_waiter(peer)?));
        }
        match self.initiate(peer) {
            Ok(waiter) => Ok(Some(waiter)),
            // Lost a race against a concurrent initiation or inbound request.
            Err(KeyExchangeError::ExchangeAlreadyInProgress(_)) => {
                Ok(Some(self.register_waiter(peer)?))
            }
            Err(KeyExchangeError::SessionAlreadyExists(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Handle an inbound `KEY_EXCHANGE` request carrying the peer's public
    /// key in SPKI encoding.
    ///
    /// # Errors
    ///
    /// - [`KeyExchangeError::UnsupportedKeyFormat`] /
    ///   [`KeyExchangeError::InvalidPublicKey`] for malformed keys
    /// - [`KeyExchangeError::CryptoFailure`] if derivation fails
    pub fn handle_request(&self, from: UserId, spki: &[u8]) -> Result<()> {
        if from == self.local_id || from <= 0 {
            return Err(KeyExchangeError::InvalidPeerId(from));
        }
        let their_public = ExchangePublicKey::from_spki(spki)?;

        {
            let pending = self.lock_pending()?;
            if let Some(existing) = pending.get(&from) {
                match existing.state {
                    ExchangeState::Initiated if existing.is_initiator => {
                        if self.local_id < from {
                            // We win the tie-break: our initiation proceeds and
                            // the peer answers it. Drop their request.
                            tracing::debug!(
                                peer = from,
                                "simultaneous initiation, local side wins"
                            );
                            return Ok(());
                        }
                        tracing::debug!(
                            peer = from,
                            "simultaneous initiation, local side yields"
                        );
                        // Fall through: discard our pending and respond.
                    }
                    state if !state.is_terminal() => {
                        // Duplicate request while we are already responding.
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }

        self.respond(from, &their_public)
    }

    /// Handle an inbound `KEY_EXCHANGE_RESPONSE` completing our initiation.
    ///
    /// # Errors
    ///
    /// - [`KeyExchangeError::NoPendingExchange`] if we have no matching
    ///   `Initiated` exchange with `from`
    /// - key format and derivation errors as in
    ///   [`handle_request`](Self::handle_request)
    pub fn handle_response(&self, from: UserId, spki: &[u8]) -> Result<()> {
        let their_public = ExchangePublicKey::from_spki(spki)?;
        let conversation_id = private_conversation(self.local_id, from);

        let outcome = {
            let mut pending = self.lock_pending()?;
            let entry = pending
                .get_mut(&from)
                .filter(|e| e.state == ExchangeState::Initiated && e.is_initiator)
                .ok_or(KeyExchangeError::NoPendingExchange(from))?;

            let shared = entry.keypair.diffie_hellman(&their_public);
            match derive_session_key(&shared, &conversation_id)
                .map_err(KeyExchangeError::from)
                .and_then(|key| self.store.store(&conversation_id, key).map_err(Into::into))
            {
                Ok(()) => {
                    entry.transition(ExchangeState::Completed);
                    Ok(())
                }
                Err(err) => {
                    entry.transition(ExchangeState::Failed);
                    Err(err)
                }
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!(peer = from, %conversation_id, "key exchange completed");
                self.complete_waiters(from, Ok(()));
                self.events.publish(Event::SecureSessionReady {
                    conversation_id,
                });
                Ok(())
            }
            Err(err) => {
                self.complete_waiters(from, Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Remove the session and any pending exchange for `peer`.
    pub fn invalidate(&self, peer: UserId, reason: &str) {
        let conversation_id = private_conversation(self.local_id, peer);
        let removed = self.store.remove(&conversation_id);
        if let Ok(mut pending) = self.lock_pending() {
            pending.remove(&peer);
        }
        self.complete_waiters(
            peer,
            Err(KeyExchangeError::ProtocolViolation(format!(
                "exchange invalidated: {reason}"
            ))),
        );
        if removed {
            tracing::info!(peer, %conversation_id, reason, "session invalidated");
            self.events.publish(Event::SessionInvalidated {
                conversation_id,
                reason: reason.to_string(),
            });
        }
    }

    /// Drop the current session and start a fresh exchange.
    pub fn rotate(&self, peer: UserId) -> Result<ExchangeWaiter> {
        self.store.remove(&private_conversation(self.local_id, peer));
        if let Ok(mut pending) = self.lock_pending() {
            pending.remove(&peer);
        }
        self.initiate(peer)
    }

    /// One sweeper pass: expire stale exchanges and prune terminal entries.
    pub fn sweep(&self) {
        let outcome = match self.lock_pending() {
            Ok(mut pending) => pending::sweep(&mut pending, self.ttl, self.gc_after),
            Err(_) => return,
        };

        for peer in outcome.expired {
            tracing::warn!(peer, "key exchange expired");
            self.complete_waiters(
                peer,
                Err(KeyExchangeError::Timeout(format!(
                    "no response from peer {peer}"
                ))),
            );
            self.events.publish(Event::Error {
                level: ErrorLevel::Error,
                kind: "KEY_EXCHANGE_TIMEOUT".to_string(),
                message: format!("key exchange with peer {peer} timed out"),
            });
        }
    }

    /// Complete all outstanding waiters with [`KeyExchangeError::ServiceShutdown`].
    pub fn shutdown(&self) {
        let drained: Vec<(UserId, Vec<oneshot::Sender<Result<()>>>)> = match self.waiters.lock() {
            Ok(mut waiters) => waiters.drain().collect(),
            Err(_) => return,
        };
        for (_, senders) in drained {
            for sender in senders {
                let _ = sender.send(Err(KeyExchangeError::ServiceShutdown));
            }
        }
    }

    /// Spawn the periodic sweeper for this engine.
    pub fn spawn_sweeper(engine: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.sweep();
            }
        })
    }

    /// Responder half: derive, store, answer, notify.
    fn respond(&self, from: UserId, their_public: &ExchangePublicKey) -> Result<()> {
        let conversation_id = private_conversation(self.local_id, from);
        let keypair = ExchangeKeypair::generate();
        let spki = keypair.public_key().to_spki();

        let outcome = {
            let mut pending = self.lock_pending()?;
            let mut entry =
                PendingKeyExchange::new(from, keypair.clone(), false, ExchangeState::Received);

            let shared = keypair.diffie_hellman(their_public);
            let result = derive_session_key(&shared, &conversation_id)
                .map_err(KeyExchangeError::from)
                .and_then(|key| self.store.store(&conversation_id, key).map_err(Into::into));

            match result {
                Ok(()) => entry.transition(ExchangeState::Completed),
                Err(_) => entry.transition(ExchangeState::Failed),
            }
            pending.insert(from, entry);
            result
        };

        outcome?;

        self.send(from, MessageBody::KeyExchangeResponse { spki })?;

        tracing::info!(peer = from, %conversation_id, "key exchange answered");
        self.complete_waiters(from, Ok(()));
        self.events.publish(Event::SecureSessionReady { conversation_id });
        Ok(())
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, HashMap<UserId, PendingKeyExchange>>> {
        self.pending
            .lock()
            .map_err(|e| KeyExchangeError::StorageFailure(e.to_string()))
    }

    fn register_waiter(&self, peer: UserId) -> Result<ExchangeWaiter> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .map_err(|e| KeyExchangeError::StorageFailure(e.to_string()))?
            .entry(peer)
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn complete_waiters(&self, peer: UserId, result: Result<()>) {
        let senders = match self.waiters.lock() {
            Ok(mut waiters) => waiters.remove(&peer).unwrap_or_default(),
            Err(_) => return,
        };
        for sender in senders {
            let _ = sender.send(result.clone());
        }
    }

    fn mark_failed(&self, peer: UserId) {
        if let Ok(mut pending) = self.lock_pending() {
            if let Some(entry) = pending.get_mut(&peer) {
                entry.transition(ExchangeState::Failed);
            }
        }
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
