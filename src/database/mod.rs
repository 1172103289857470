pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::auth::{Scope, Token};
use models::{Comment, CommentFilters, Metadata, Permissions, User};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    RecordNotFound,

    #[error("duplicate email")]
    DuplicateEmail,

    #[error("edit conflict")]
    EditConflict,

    #[error("query exceeded its deadline")]
    Timeout,

    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// Runs one store call under `deadline`. Expiry is reported as
/// `StoreError::Timeout` and the call is not retried.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| StoreError::Timeout)?
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Assigns `id`, `created_at` and `version` on success.
    async fn insert_user(&self, user: &mut User) -> Result<(), StoreError>;

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError>;

    /// Fails with `EditConflict` when `user.version` is stale; bumps it otherwise.
    async fn update_user(&self, user: &mut User) -> Result<(), StoreError>;

    /// Owner of the token whose hash and scope match and whose expiry is after `now`.
    async fn get_user_for_token(
        &self,
        scope: Scope,
        hash: &[u8; 32],
        now: DateTime<Utc>,
    ) -> Result<User, StoreError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, token: &Token) -> Result<(), StoreError>;

    async fn delete_all_tokens_for_user(&self, scope: Scope, user_id: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn get_all_permissions_for_user(&self, user_id: i64) -> Result<Permissions, StoreError>;

    /// Grants the known codes among `codes`; unknown codes are ignored.
    async fn add_permissions_for_user(&self, user_id: i64, codes: &[&str]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn insert_comment(&self, comment: &mut Comment) -> Result<(), StoreError>;

    async fn get_comment(&self, id: i64) -> Result<Comment, StoreError>;

    async fn update_comment(&self, comment: &mut Comment) -> Result<(), StoreError>;

    async fn delete_comment(&self, id: i64) -> Result<(), StoreError>;

    async fn list_comments(
        &self,
        filters: &CommentFilters,
    ) -> Result<(Vec<Comment>, Metadata), StoreError>;
}

/// Everything the request pipeline needs from persistence.
pub trait Store: UserStore + TokenStore + PermissionStore + CommentStore {}

impl<T> Store for T where T: UserStore + TokenStore + PermissionStore + CommentStore {}
