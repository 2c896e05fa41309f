//! Integration tests: replay and tamper rejection at the wire level.
//!
//! Alice is a hand-rolled protocol peer (`TestPeer`) so the tests can
//! capture the exact `ENCRYPTED` frame she produced, deliver it twice, or
//! flip ciphertext bits. Bob is a real client. The frames cross a real
//! relay, which also demonstrates that an independent implementation of
//! the wire format interoperates with the client bit-for-bit.

use std::time::Duration;

use parley_client::{Client, ClientConfig};
use parley_integration_tests::{collect_events, event_count, start_relay, wait_until, TestPeer};
use parley_types::events::{Event, EventKind};

#[tokio::test]
async fn replayed_wrapper_is_dropped_silently() {
    let relay = start_relay().await;
    let mut alice = TestPeer::connect(relay.addr, "alice").await;
    let bob = Client::connect(relay.addr, "bob", ClientConfig::default())
        .await
        .expect("bob connects");
    assert_eq!(alice.user_id, 1);
    assert_eq!(bob.user_id(), 2);

    let bob_texts = collect_events(&bob.events(), EventKind::TextReceived);
    let bob_errors = collect_events(&bob.events(), EventKind::Error);

    alice.establish_private_session(2).await;
    assert!(
        wait_until(Duration::from_secs(1), || {
            bob.session_store().has_session("private_1_2")
        })
        .await
    );

    // First delivery decrypts.
    let captured = alice.seal_text(2, "hello");
    alice.send_packet(&captured).await;
    assert!(wait_until(Duration::from_secs(2), || event_count(&bob_texts) == 1).await);

    // The identical frame again: dropped silently, one warning event.
    alice.send_packet(&captured).await;
    assert!(
        wait_until(Duration::from_secs(2), || {
            bob_errors.lock().map_or(false, |errors| {
                errors.iter().any(|event| {
                    matches!(event, Event::Error { kind, .. } if kind == "DECRYPTION_ERROR")
                })
            })
        })
        .await,
        "replay surfaces a decryption-error event"
    );
    assert_eq!(event_count(&bob_texts), 1, "no second delivery");

    // Bob's inbound watermark advanced exactly once.
    let stats = bob.session_store().stats("private_1_2").expect("stats");
    assert_eq!(stats.received, 1);
    assert_eq!(stats.recv_seq, Some(0));

    bob.shutdown();
}

#[tokio::test]
async fn tampered_ciphertext_is_rejected() {
    let relay = start_relay().await;
    let mut alice = TestPeer::connect(relay.addr, "alice").await;
    let bob = Client::connect(relay.addr, "bob", ClientConfig::default())
        .await
        .expect("bob connects");

    let bob_texts = collect_events(&bob.events(), EventKind::TextReceived);
    let bob_errors = collect_events(&bob.events(), EventKind::Error);

    alice.establish_private_session(2).await;
    assert!(
        wait_until(Duration::from_secs(1), || {
            bob.session_store().has_session("private_1_2")
        })
        .await
    );

    // Flip the lowest bit of the final ciphertext byte.
    let mut packet = alice.seal_text(2, "attack at dawn");
    let last = packet.payload.len() - 1;
    packet.payload[last] ^= 0x01;
    alice.send_packet(&packet).await;

    assert!(
        wait_until(Duration::from_secs(2), || {
            bob_errors.lock().map_or(false, |errors| {
                errors.iter().any(|event| {
                    matches!(event, Event::Error { kind, .. } if kind == "DECRYPTION_ERROR")
                })
            })
        })
        .await,
        "tampering surfaces a decryption-error event"
    );
    assert_eq!(event_count(&bob_texts), 0, "no plaintext was delivered");

    bob.shutdown();
}
