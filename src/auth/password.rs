use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use thiserror::Error;

use crate::validator::Validator;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password hashing failed: {0}")]
    Hash(String),
}

/// Salted argon2 hash of a user's password. The plaintext is never kept.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Password {
    hash: String,
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(..)")
    }
}

impl Password {
    pub fn set(plaintext: &str) -> Result<Self, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| PasswordError::Hash(e.to_string()))?
            .to_string();
        Ok(Self { hash })
    }

    pub fn from_hash(hash: String) -> Self {
        Self { hash }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn is_set(&self) -> bool {
        !self.hash.is_empty()
    }

    pub fn matches(&self, plaintext: &str) -> Result<bool, PasswordError> {
        let parsed = PasswordHash::new(&self.hash).map_err(|e| PasswordError::Hash(e.to_string()))?;
        Ok(Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok())
    }
    /// `set` on the blocking pool.
    pub async fn hash_blocking(plaintext: String) -> Result<Self, PasswordError> {
        tokio::task::spawn_blocking(move || Self::set(&plaintext))
            .await
            .map_err(|e| PasswordError::Hash(e.to_string()))?
    }

    /// `matches` on the blocking pool.
    pub async fn matches_blocking(&self, plaintext: String) -> Result<bool, PasswordError> {
        let password = self.clone();
        tokio::task::spawn_blocking(move || password.matches(&plaintext))
            .await
            .map_err(|e| PasswordError::Hash(e.to_string()))?
    }
}

pub fn validate_password_plaintext(v: &mut Validator, password: &str) {
    v.check(!password.is_empty(), "password", "must be provided");
    v.check(password.len() >= 8, "password", "must be at least 8 bytes long");
    v.check(password.len() <= 72, "password", "must not be more than 72 bytes long");
}
