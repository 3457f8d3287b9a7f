use std::sync::OnceLock;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;

use crate::error::{AuthError, AuthResult};

/// Hashes `password` into a PHC string with a fresh random salt.
pub fn hash_password(password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hashing(format!("Failed to hash password: {e}")))
}

/// A malformed stored hash counts as a mismatch.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        tracing::warn!("stored password hash is not a valid PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub(crate) const DECOY_PASSWORD: &str = "concierge-decoy-credential";

/// Verified against when an email has no account, so a miss costs the same
/// Argon2 work as a wrong password.
pub(crate) fn decoy_hash() -> &'static str {
    static DECOY: OnceLock<String> = OnceLock::new();
    DECOY.get_or_init(|| {
        hash_password(DECOY_PASSWORD).unwrap_or_else(|err| {
            tracing::warn!("decoy hash unavailable: {}", err);
            String::new()
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_only_the_original_password() {
        let hash = hash_password("demo123").expect("hash");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("demo123", &hash));
        assert!(!verify_password("demo124", &hash));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let a = hash_password("same").expect("hash");
        let b = hash_password("same").expect("hash");
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!verify_password("demo123", "not-a-phc-string"));
    }

    #[test]
    fn decoy_hash_is_a_full_cost_argon2_hash() {
        let decoy = PasswordHash::new(decoy_hash()).expect("phc");
        let real = hash_password("demo123").expect("hash");
        let real = PasswordHash::new(&real).expect("phc");
        assert_eq!(decoy.algorithm, real.algorithm);
        assert_eq!(decoy.params, real.params);
        assert!(verify_password(DECOY_PASSWORD, decoy_hash()));
    }
}
