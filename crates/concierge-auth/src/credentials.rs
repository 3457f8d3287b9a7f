use std::collections::HashMap;

use async_trait::async_trait;
use concierge_types::User;

use crate::error::AuthResult;
use crate::password::hash_password;

pub const DEMO_EMAIL: &str = "demo@example.com";
pub const DEMO_PASSWORD: &str = "demo123";

/// Where accounts are looked up. Implementations are read-only.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Option<User>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentialStore {
    users: HashMap<String, User>,
}

impl InMemoryCredentialStore {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        let users = users
            .into_iter()
            .map(|user| (user.email.clone(), user))
            .collect();
        Self { users }
    }

    /// The single demo admin account.
    pub fn seeded() -> AuthResult<Self> {
        let demo = User {
            id: "1".to_string(),
            name: "Demo User".to_string(),
            email: DEMO_EMAIL.to_string(),
            password_hash: hash_password(DEMO_PASSWORD)?,
            role: "admin".to_string(),
            disabled: false,
        };
        Ok(Self::new([demo]))
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_email(&self, email: &str) -> Option<User> {
        self.users.get(email).cloned()
    }
}
