//! Canonical conversation ids.
//!
//! A conversation id names the scope of one session key. The encoding is
//! deterministic and symmetric so both parties derive the same id
//! regardless of role, which in turn makes HKDF produce the same session
//! key on both sides.

use parley_types::{GroupId, UserId};
use sha2::{Digest, Sha256};

/// Conversation id for a private peer pair: `private_<min>_<max>`.
pub fn private_conversation(a: UserId, b: UserId) -> String {
    format!("private_{}_{}", a.min(b), a.max(b))
}

/// Conversation id for a group: `group_<group_id>`.
pub fn group_conversation(group_id: GroupId) -> String {
    format!("group_{group_id}")
}

/// Conversation id for the client-to-relay link:
/// `server_session_<hex(sha256(server_spki ‖ client_spki)[..8])>`.
pub fn server_conversation(server_spki: &[u8], client_spki: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server_spki);
    hasher.update(client_spki);
    let digest = hasher.finalize();
    format!("server_session_{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_id_is_symmetric() {
        assert_eq!(private_conversation(1, 2), private_conversation(2, 1));
        assert_eq!(private_conversation(1, 2), "private_1_2");
    }

    #[test]
    fn test_group_id_format() {
        assert_eq!(group_conversation(10), "group_10");
    }

    #[test]
    fn test_server_id_is_role_sensitive() {
        let id = server_conversation(b"server-key", b"client-key");
        assert!(id.starts_with("server_session_"));
        assert_eq!(id.len(), "server_session_".len() + 16);
        // Swapping the halves changes the id: the server key always comes first.
        assert_ne!(id, server_conversation(b"client-key", b"server-key"));
    }

    #[test]
    fn test_distinct_pairs_get_distinct_ids() {
        assert_ne!(private_conversation(1, 2), private_conversation(1, 3));
    }
}
