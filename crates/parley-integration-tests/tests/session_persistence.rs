//! Integration test: session keys survive a restart via the at-rest store.
//!
//! After an exchange, the client persists its end-to-end keys to the
//! encrypted key store; a later restore brings them back with reset
//! sequence counters. Link keys never leave the process.

use std::time::Duration;

use parley_client::{Client, ClientConfig};
use parley_crypto::key::SessionKey;
use parley_integration_tests::{start_relay, wait_until};
use parley_keystore::KeyStore;

#[tokio::test]
async fn session_keys_roundtrip_through_keystore() {
    let relay = start_relay().await;
    let alice = Client::connect(relay.addr, "alice", ClientConfig::default())
        .await
        .expect("alice connects");
    let bob = Client::connect(relay.addr, "bob", ClientConfig::default())
        .await
        .expect("bob connects");

    alice
        .initiate_secure_conversation(2)
        .await
        .expect("exchange");
    assert!(
        wait_until(Duration::from_secs(1), || {
            alice.session_store().has_session("private_1_2")
        })
        .await
    );

    let keystore = KeyStore::open_memory(SessionKey::random()).expect("open keystore");
    let saved = alice.persist_sessions(&keystore).expect("persist");
    assert_eq!(saved, 1, "only the end-to-end key is persisted");

    // The link key stayed out of the at-rest store.
    let all = keystore.load_all().expect("load all");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].0, "private_1_2");

    // Simulate a restart: wipe the live entry, then restore.
    let live_key = alice
        .session_store()
        .get_key("private_1_2")
        .expect("live key");
    alice.session_store().remove("private_1_2");
    let restored = alice.restore_sessions(&keystore).expect("restore");
    assert_eq!(restored, 1);

    let restored_key = alice
        .session_store()
        .get_key("private_1_2")
        .expect("restored key");
    assert_eq!(restored_key.as_bytes(), live_key.as_bytes());

    // Counters are back at zero after a restore.
    let stats = alice.session_store().stats("private_1_2").expect("stats");
    assert_eq!(stats.send_seq, 0);
    assert_eq!(stats.recv_seq, None);

    alice.shutdown();
    bob.shutdown();
}
