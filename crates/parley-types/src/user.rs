//! User account records held by the relay's user registry.

use serde::{Deserialize, Serialize};

use crate::UserId;

/// A registered user account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Server-assigned account id (> 0).
    pub user_id: UserId,
    /// Display name chosen by the user.
    pub pseudo: String,
    /// Account creation time, epoch milliseconds UTC.
    pub created_at_ms: u64,
}

impl User {
    /// Create a new user record.
    pub fn new(user_id: UserId, pseudo: impl Into<String>, created_at_ms: u64) -> Self {
        Self {
            user_id,
            pseudo: pseudo.into(),
            created_at_ms,
        }
    }
}
