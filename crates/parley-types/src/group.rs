//! Group membership records.
//!
//! The member set is mutated only by the relay, which fans each change out
//! to all clients. The admin is always a member.

use serde::{Deserialize, Serialize};

use crate::{GroupId, UserId};

/// A chat group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group identifier.
    pub group_id: GroupId,
    /// Human-readable group name.
    pub name: String,
    /// The administrator; generates and distributes the group key.
    pub admin_id: UserId,
    /// Current members, in join order. Always contains `admin_id`.
    pub members: Vec<UserId>,
}

impl Group {
    /// Create a group with the admin as sole initial member.
    pub fn new(group_id: GroupId, name: impl Into<String>, admin_id: UserId) -> Self {
        Self {
            group_id,
            name: name.into(),
            admin_id,
            members: vec![admin_id],
        }
    }

    /// Whether `user_id` is currently a member.
    pub fn has_member(&self, user_id: UserId) -> bool {
        self.members.contains(&user_id)
    }

    /// Add a member, preserving join order. No-op if already present.
    pub fn add_member(&mut self, user_id: UserId) {
        if !self.has_member(user_id) {
            self.members.push(user_id);
        }
    }

    /// Remove a member. The admin cannot be removed.
    ///
    /// Returns whether the member was present and removed.
    pub fn remove_member(&mut self, user_id: UserId) -> bool {
        if user_id == self.admin_id {
            return false;
        }
        let before = self.members.len();
        self.members.retain(|m| *m != user_id);
        self.members.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_is_member() {
        let group = Group::new(10, "team", 1);
        assert!(group.has_member(1));
        assert_eq!(group.members, vec![1]);
    }

    #[test]
    fn test_add_and_remove_member() {
        let mut group = Group::new(10, "team", 1);
        group.add_member(2);
        group.add_member(3);
        group.add_member(2);
        assert_eq!(group.members, vec![1, 2, 3]);

        assert!(group.remove_member(2));
        assert!(!group.has_member(2));
        assert!(!group.remove_member(2));
    }

    #[test]
    fn test_admin_cannot_be_removed() {
        let mut group = Group::new(10, "team", 1);
        group.add_member(2);
        assert!(!group.remove_member(1));
        assert!(group.has_member(1));
    }
}
