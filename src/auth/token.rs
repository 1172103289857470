use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use crate::database::{models::User, Store, StoreError};
use crate::validator::Validator;

/// Length of every plaintext token: 16 random bytes, unpadded base32.
pub const PLAINTEXT_LEN: usize = 26;

/// Partitions tokens by purpose so one issued for activation can never
/// authenticate a request, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Activation,
    Authentication,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Activation => "activation",
            Scope::Authentication => "authentication",
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("unable to read from the system random source: {0}")]
    RandomSource(#[source] rand::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A freshly generated token. Only `plaintext` and `expiry` ever reach the
/// client; the store keeps `hash`.
#[derive(Debug, Clone, Serialize)]
pub struct Token {
    #[serde(rename = "token")]
    pub plaintext: String,
    #[serde(skip)]
    pub hash: [u8; 32],
    #[serde(skip)]
    pub user_id: i64,
    pub expiry: DateTime<Utc>,
    #[serde(skip)]
    pub scope: Scope,
}

pub fn generate_token(user_id: i64, ttl: Duration, scope: Scope) -> Result<Token, TokenError> {
    let mut random = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut random)
        .map_err(TokenError::RandomSource)?;

    let plaintext = data_encoding::BASE32_NOPAD.encode(&random);
    let hash = hash_plaintext(&plaintext);

    Ok(Token {
        plaintext,
        hash,
        user_id,
        expiry: Utc::now() + ttl,
        scope,
    })
}

pub fn hash_plaintext(plaintext: &str) -> [u8; 32] {
    Sha256::digest(plaintext.as_bytes()).into()
}

pub fn validate_plaintext(v: &mut Validator, plaintext: &str) {
    v.check(!plaintext.is_empty(), "token", "must be provided");
    v.check(plaintext.len() == PLAINTEXT_LEN, "token", "must be 26 bytes long");
}

/// Issues, resolves and revokes tokens against the persistence collaborator.
#[derive(Clone)]
pub struct TokenService {
    store: Arc<dyn Store>,
}

impl TokenService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Generates a token and persists its hash. The plaintext is only
    /// returned once the row is stored.
    pub async fn issue(&self, user_id: i64, ttl: Duration, scope: Scope) -> Result<Token, TokenError> {
        let token = generate_token(user_id, ttl, scope)?;
        self.store.insert_token(&token).await?;
        Ok(token)
    }

    /// Returns the owner of an unexpired token issued for `scope`.
    ///
    /// Mis-sized plaintexts fail with `RecordNotFound` without touching the store.
    pub async fn resolve(&self, scope: Scope, plaintext: &str) -> Result<User, TokenError> {
        if plaintext.len() != PLAINTEXT_LEN {
            return Err(StoreError::RecordNotFound.into());
        }
        let hash = hash_plaintext(plaintext);
        Ok(self.store.get_user_for_token(scope, &hash, Utc::now()).await?)
    }

    pub async fn invalidate_all(&self, scope: Scope, user_id: i64) -> Result<(), TokenError> {
        self.store.delete_all_tokens_for_user(scope, user_id).await?;
        Ok(())
    }
}
