//! Integration test: an unanswered key exchange expires.
//!
//! Alice initiates with a peer id that never responds. After the exchange
//! TTL the sweeper marks the pending entry expired, the initiation future
//! fails, an error event is published, and no session is stored.

use std::time::Duration;

use parley_client::{Client, ClientConfig, ClientError};
use parley_integration_tests::{collect_events, start_relay, wait_until};
use parley_keyex::KeyExchangeError;
use parley_types::events::{Event, EventKind};

#[tokio::test]
async fn unanswered_exchange_expires() {
    let relay = start_relay().await;

    // A short TTL and a single attempt keep the test fast; the production
    // defaults are 30 s and 3 attempts.
    let config = ClientConfig {
        key_exchange_timeout_secs: 1,
        cleanup_interval_secs: 1,
        max_retry_attempts: 1,
        ..ClientConfig::default()
    };
    let alice = Client::connect(relay.addr, "alice", config)
        .await
        .expect("alice connects");
    let errors = collect_events(&alice.events(), EventKind::Error);

    let started = std::time::Instant::now();
    let result = alice.initiate_secure_conversation(9).await;

    assert!(
        matches!(
            result,
            Err(ClientError::KeyExchange(KeyExchangeError::Timeout(_)))
        ),
        "initiation fails with a timeout"
    );
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "the TTL elapsed before failure"
    );
    assert!(!alice.session_store().has_session("private_1_9"));

    assert!(
        wait_until(Duration::from_secs(1), || {
            errors.lock().map_or(false, |errors| {
                errors.iter().any(|event| {
                    matches!(event, Event::Error { kind, .. } if kind == "KEY_EXCHANGE_TIMEOUT")
                })
            })
        })
        .await,
        "the expiry is surfaced as an error event"
    );

    alice.shutdown();
}
