use async_trait::async_trait;
use dashmap::DashSet;
use uuid::Uuid;

use crate::error::Result;

/// Source of truth for which users exist. Owned by the identity boundary.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn exists(&self, user_id: Uuid) -> Result<bool>;
}

/// Process-local user registry for tests, simulations and single-node setups.
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: DashSet<Uuid>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the user was already registered.
    pub fn register(&self, user_id: Uuid) -> bool {
        self.users.insert(user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn exists(&self, user_id: Uuid) -> Result<bool> {
        Ok(self.users.contains(&user_id))
    }
}
