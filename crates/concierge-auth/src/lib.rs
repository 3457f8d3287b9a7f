mod credentials;
mod error;
mod grants;
mod password;
mod token;

use std::sync::Arc;

use chrono::Duration;
use concierge_types::{User, UserSummary};

pub use credentials::{CredentialStore, InMemoryCredentialStore, DEMO_EMAIL, DEMO_PASSWORD};
pub use error::{AuthError, AuthResult};
pub use grants::RoleGrants;
pub use password::{hash_password, verify_password};
pub use token::{TokenService, DEFAULT_TOKEN_TTL_MINUTES};

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub access_token: String,
    pub user: UserSummary,
}

/// Ties credential lookup to token issuance.
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    tokens: TokenService,
    token_ttl: Duration,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>, tokens: TokenService, token_ttl: Duration) -> Self {
        Self {
            store,
            tokens,
            token_ttl,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub async fn login(&self, email: &str, password: &str) -> AuthResult<LoginGrant> {
        let user = self.store.find_by_email(email.trim()).await;
        let stored_hash = match &user {
            Some(user) => user.password_hash.as_str(),
            None => password::decoy_hash(),
        };
        let verified = verify_password(password, stored_hash);
        let user = match user {
            Some(user) if verified && !user.disabled => user,
            _ => return Err(AuthError::InvalidCredentials),
        };
        let access_token = self.tokens.issue(&user.email, Some(self.token_ttl))?;
        Ok(LoginGrant {
            access_token,
            user: user.summary(),
        })
    }

    pub async fn authenticate_token(&self, token: &str) -> AuthResult<User> {
        let subject = self.tokens.validate(token)?;
        match self.store.find_by_email(&subject).await {
            Some(user) if !user.disabled => Ok(user),
            _ => Err(AuthError::InvalidToken),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(email: &str, password: &str, disabled: bool) -> User {
        User {
            id: email.to_string(),
            name: "Someone".to_string(),
            email: email.to_string(),
            password_hash: hash_password(password).expect("hash"),
            role: "viewer".to_string(),
            disabled,
        }
    }

    fn authenticator(users: Vec<User>) -> Authenticator {
        Authenticator::new(
            Arc::new(InMemoryCredentialStore::new(users)),
            TokenService::new("secret", "HS256").expect("tokens"),
            Duration::minutes(30),
        )
    }

    #[tokio::test]
    async fn seeded_demo_account_logs_in() {
        let auth = Authenticator::new(
            Arc::new(InMemoryCredentialStore::seeded().expect("seed")),
            TokenService::new("secret", "HS256").expect("tokens"),
            Duration::minutes(30),
        );
        let grant = auth.login(DEMO_EMAIL, DEMO_PASSWORD).await.expect("login");
        assert_eq!(grant.user.name, "Demo User");
        assert_eq!(grant.user.role, "admin");

        let user = auth
            .authenticate_token(&grant.access_token)
            .await
            .expect("token");
        assert_eq!(user.email, DEMO_EMAIL);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_look_the_same() {
        let auth = authenticator(vec![user("a@example.com", "right", false)]);
        assert_eq!(
            auth.login("a@example.com", "wrong").await.err(),
            Some(AuthError::InvalidCredentials)
        );
        assert_eq!(
            auth.login("nobody@example.com", "right").await.err(),
            Some(AuthError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn unknown_email_is_rejected_even_with_the_decoy_password() {
        let auth = authenticator(vec![user("a@example.com", "right", false)]);
        assert_eq!(
            auth.login("nobody@example.com", password::DECOY_PASSWORD)
                .await
                .err(),
            Some(AuthError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn disabled_user_cannot_log_in_or_use_token() {
        let auth = authenticator(vec![user("off@example.com", "pw", true)]);
        assert_eq!(
            auth.login("off@example.com", "pw").await.err(),
            Some(AuthError::InvalidCredentials)
        );
        let token = auth.tokens().issue("off@example.com", None).expect("token");
        assert_eq!(
            auth.authenticate_token(&token).await.err(),
            Some(AuthError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn token_for_unknown_subject_is_rejected() {
        let auth = authenticator(Vec::new());
        let token = auth.tokens().issue("ghost@example.com", None).expect("token");
        assert_eq!(
            auth.authenticate_token(&token).await.err(),
            Some(AuthError::InvalidToken)
        );
    }
}
