//! Repository traits for users, contacts, and groups.
//!
//! The core treats these as opaque key/value stores: each operation is
//! atomic and reads observe the caller's own completed writes. The in-memory
//! implementations back the relay and the test suites; persistent backends
//! can be substituted behind the same traits.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::contact::ContactRequest;
use crate::group::Group;
use crate::user::User;
use crate::{GroupId, UserId};

/// Repository operation errors.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// User account storage.
pub trait UserRepository: Send + Sync {
    fn find_by_id(&self, user_id: UserId) -> Option<User>;
    /// Insert a user. Fails with [`RepositoryError::Duplicate`] if the id is taken.
    fn add(&self, user: User) -> Result<()>;
    /// Replace an existing user record.
    fn update(&self, user: User) -> Result<()>;
    fn delete(&self, user_id: UserId) -> Result<()>;
}

/// Group storage.
pub trait GroupRepository: Send + Sync {
    fn find_by_id(&self, group_id: GroupId) -> Option<Group>;
    fn add(&self, group: Group) -> Result<()>;
    fn update(&self, group: Group) -> Result<()>;
    fn delete(&self, group_id: GroupId) -> Result<()>;
}

/// Contact-request storage, keyed by request id.
pub trait ContactRepository: Send + Sync {
    fn find_by_id(&self, request_id: &str) -> Option<ContactRequest>;
    fn add(&self, request: ContactRequest) -> Result<()>;
    fn update(&self, request: ContactRequest) -> Result<()>;
    fn delete(&self, request_id: &str) -> Result<()>;
}

/// In-memory [`UserRepository`].
#[derive(Default)]
pub struct InMemoryUserRepository {
    users: Mutex<HashMap<UserId, User>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserRepository for InMemoryUserRepository {
    fn find_by_id(&self, user_id: UserId) -> Option<User> {
        self.users
            .lock()
            .ok()
            .and_then(|users| users.get(&user_id).cloned())
    }

    fn add(&self, user: User) -> Result<()> {
        let mut users = self
            .users
            .lock()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if users.contains_key(&user.user_id) {
            return Err(RepositoryError::Duplicate(user.user_id.to_string()));
        }
        users.insert(user.user_id, user);
        Ok(())
    }

    fn update(&self, user: User) -> Result<()> {
        let mut users = self
            .users
            .lock()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if !users.contains_key(&user.user_id) {
            return Err(RepositoryError::NotFound(user.user_id.to_string()));
        }
        users.insert(user.user_id, user);
        Ok(())
    }

    fn delete(&self, user_id: UserId) -> Result<()> {
        let mut users = self
            .users
            .lock()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        users
            .remove(&user_id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(user_id.to_string()))
    }
}

/// In-memory [`GroupRepository`].
#[derive(Default)]
pub struct InMemoryGroupRepository {
    groups: Mutex<HashMap<GroupId, Group>>,
}

impl InMemoryGroupRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GroupRepository for InMemoryGroupRepository {
    fn find_by_id(&self, group_id: GroupId) -> Option<Group> {
        self.groups
            .lock()
            .ok()
            .and_then(|groups| groups.get(&group_id).cloned())
    }

    fn add(&self, group: Group) -> Result<()> {
        let mut groups = self
            .groups
            .lock()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if groups.contains_key(&group.group_id) {
            return Err(RepositoryError::Duplicate(group.group_id.to_string()));
        }
        groups.insert(group.group_id, group);
        Ok(())
    }

    fn update(&self, group: Group) -> Result<()> {
        let mut groups = self
            .groups
            .lock()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if !groups.contains_key(&group.group_id) {
            return Err(RepositoryError::NotFound(group.group_id.to_string()));
        }
        groups.insert(group.group_id, group);
        Ok(())
    }

    fn delete(&self, group_id: GroupId) -> Result<()> {
        let mut groups = self
            .groups
            .lock()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        groups
            .remove(&group_id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(group_id.to_string()))
    }
}

/// In-memory [`ContactRepository`].
#[derive(Default)]
pub struct InMemoryContactRepository {
    requests: Mutex<HashMap<String, ContactRequest>>,
}

impl InMemoryContactRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContactRepository for InMemoryContactRepository {
    fn find_by_id(&self, request_id: &str) -> Option<ContactRequest> {
        self.requests
            .lock()
            .ok()
            .and_then(|requests| requests.get(request_id).cloned())
    }

    fn add(&self, request: ContactRequest) -> Result<()> {
        let mut requests = self
            .requests
            .lock()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if requests.contains_key(&request.request_id) {
            return Err(RepositoryError::Duplicate(request.request_id.clone()));
        }
        requests.insert(request.request_id.clone(), request);
        Ok(())
    }

    fn update(&self, request: ContactRequest) -> Result<()> {
        let mut requests = self
            .requests
            .lock()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if !requests.contains_key(&request.request_id) {
            return Err(RepositoryError::NotFound(request.request_id.clone()));
        }
        requests.insert(request.request_id.clone(), request);
        Ok(())
    }

    fn delete(&self, request_id: &str) -> Result<()> {
        let mut requests = self
            .requests
            .lock()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        requests
            .remove(request_id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(request_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_repository_crud() {
        let repo = InMemoryUserRepository::new();
        repo.add(User::new(1, "alice", 0)).expect("add");
        assert!(repo.add(User::new(1, "alice", 0)).is_err());

        let user = repo.find_by_id(1).expect("find");
        assert_eq!(user.pseudo, "alice");

        repo.update(User::new(1, "alice2", 0)).expect("update");
        assert_eq!(repo.find_by_id(1).expect("find").pseudo, "alice2");

        repo.delete(1).expect("delete");
        assert!(repo.find_by_id(1).is_none());
        assert!(repo.delete(1).is_err());
    }

    #[test]
    fn test_group_repository_crud() {
        let repo = InMemoryGroupRepository::new();
        repo.add(Group::new(10, "team", 1)).expect("add");

        let mut group = repo.find_by_id(10).expect("find");
        group.add_member(2);
        repo.update(group).expect("update");

        assert!(repo.find_by_id(10).expect("find").has_member(2));
        assert!(repo.find_by_id(11).is_none());
    }

    #[test]
    fn test_contact_repository_crud() {
        let repo = InMemoryContactRepository::new();
        repo.add(ContactRequest::new("r1", 1, 2, 0)).expect("add");
        assert!(repo.find_by_id("r1").is_some());
        repo.delete("r1").expect("delete");
        assert!(repo.find_by_id("r1").is_none());
    }
}
