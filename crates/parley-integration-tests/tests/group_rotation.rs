//! Integration test: group key distribution and rotation on membership
//! change.
//!
//! The admin creates a group, the relay fans the membership out, and the
//! admin's group engine wraps the key to every member under freshly
//! established private sessions. Adding a member forces a rotation: all
//! current members (including the newcomer) end up with the same new key
//! and nobody retains the old one.

use std::time::Duration;

use parley_client::{Client, ClientConfig};
use parley_integration_tests::{start_relay, wait_until};
use parley_crypto::key::SessionKey;

fn group_key(client: &Client) -> Option<SessionKey> {
    client.session_store().get_key("group_1")
}

fn all_hold_same_key(clients: &[&Client]) -> bool {
    let keys: Vec<SessionKey> = clients.iter().filter_map(|c| group_key(c)).collect();
    keys.len() == clients.len()
        && keys
            .windows(2)
            .all(|pair| pair[0].as_bytes() == pair[1].as_bytes())
}

#[tokio::test]
async fn group_key_rotates_on_member_add() {
    let relay = start_relay().await;

    let admin = Client::connect(relay.addr, "admin", ClientConfig::default())
        .await
        .expect("admin connects");
    let bob = Client::connect(relay.addr, "bob", ClientConfig::default())
        .await
        .expect("bob connects");
    let carol = Client::connect(relay.addr, "carol", ClientConfig::default())
        .await
        .expect("carol connects");
    let dave = Client::connect(relay.addr, "dave", ClientConfig::default())
        .await
        .expect("dave connects");

    // Create the group with members {1, 2, 3}; the relay assigns id 1.
    let ack = admin.create_group("team", &[2, 3]).expect("create group");
    let outcome = ack.await.expect("create acked");
    assert_eq!(
        outcome.extras.get("group_id").and_then(|v| v.as_i64()),
        Some(1)
    );

    // Distribution runs over real private exchanges; give it a moment.
    assert!(
        wait_until(Duration::from_secs(5), || {
            all_hold_same_key(&[&admin, &bob, &carol])
        })
        .await,
        "initial group key reaches every member"
    );
    let old_key = group_key(&admin).expect("initial key");
    assert!(group_key(&dave).is_none());

    // Adding Dave rotates the key to all four.
    let ack = admin.add_group_member(1, 4).expect("add member");
    ack.await.expect("add acked");

    assert!(
        wait_until(Duration::from_secs(5), || {
            all_hold_same_key(&[&admin, &bob, &carol, &dave])
                && group_key(&admin)
                    .is_some_and(|key| key.as_bytes() != old_key.as_bytes())
        })
        .await,
        "rotated key reaches all current members"
    );

    // The previous key is gone from every participant's store.
    for client in [&admin, &bob, &carol, &dave] {
        let key = group_key(client).expect("current key");
        assert_ne!(key.as_bytes(), old_key.as_bytes());
    }

    admin.shutdown();
    bob.shutdown();
    carol.shutdown();
    dave.shutdown();
}
