use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::models::{Comment, CommentFilters, Metadata, Permissions, User, KNOWN_PERMISSIONS};
use super::{CommentStore, PermissionStore, StoreError, TokenStore, UserStore};
use crate::auth::{Scope, Token};

struct TokenRow {
    hash: [u8; 32],
    user_id: i64,
    expiry: DateTime<Utc>,
    scope: Scope,
}

#[derive(Default)]
struct Tables {
    users: BTreeMap<i64, User>,
    tokens: Vec<TokenRow>,
    permissions: HashMap<i64, BTreeSet<String>>,
    comments: BTreeMap<i64, Comment>,
    next_user_id: i64,
    next_comment_id: i64,
}

/// In-process store with the same constraints as the Postgres schema:
/// unique emails, versioned updates, expiry checked at lookup.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // The lock is never held across an await, so a poisoned guard still
    // holds consistent tables.
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, user: &mut User) -> Result<(), StoreError> {
        let mut tables = self.tables();
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::DuplicateEmail);
        }
        tables.next_user_id += 1;
        user.id = tables.next_user_id;
        user.created_at = Utc::now();
        user.version = 1;
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError> {
        self.tables()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or(StoreError::RecordNotFound)
    }

    async fn update_user(&self, user: &mut User) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let email_taken = tables
            .users
            .values()
            .any(|u| u.id != user.id && u.email == user.email);
        if email_taken {
            return Err(StoreError::DuplicateEmail);
        }
        let stored = match tables.users.get_mut(&user.id) {
            Some(stored) if stored.version == user.version => stored,
            _ => return Err(StoreError::EditConflict),
        };
        user.version += 1;
        *stored = user.clone();
        Ok(())
    }

    async fn get_user_for_token(
        &self,
        scope: Scope,
        hash: &[u8; 32],
        now: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        let tables = self.tables();
        let row = tables
            .tokens
            .iter()
            .find(|t| t.scope == scope && &t.hash == hash && t.expiry > now)
            .ok_or(StoreError::RecordNotFound)?;
        tables
            .users
            .get(&row.user_id)
            .cloned()
            .ok_or(StoreError::RecordNotFound)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, token: &Token) -> Result<(), StoreError> {
        let mut tables = self.tables();
        if !tables.users.contains_key(&token.user_id) {
            return Err(StoreError::RecordNotFound);
        }
        tables.tokens.push(TokenRow {
            hash: token.hash,
            user_id: token.user_id,
            expiry: token.expiry,
            scope: token.scope,
        });
        Ok(())
    }

    async fn delete_all_tokens_for_user(&self, scope: Scope, user_id: i64) -> Result<(), StoreError> {
        self.tables()
            .tokens
            .retain(|t| !(t.scope == scope && t.user_id == user_id));
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn get_all_permissions_for_user(&self, user_id: i64) -> Result<Permissions, StoreError> {
        let tables = self.tables();
        Ok(tables
            .permissions
            .get(&user_id)
            .map(|codes| codes.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_permissions_for_user(&self, user_id: i64, codes: &[&str]) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let granted = tables.permissions.entry(user_id).or_default();
        for code in codes.iter().filter(|c| KNOWN_PERMISSIONS.contains(*c)) {
            granted.insert(code.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl CommentStore for MemoryStore {
    async fn insert_comment(&self, comment: &mut Comment) -> Result<(), StoreError> {
        let mut tables = self.tables();
        tables.next_comment_id += 1;
        comment.id = tables.next_comment_id;
        comment.created_at = Utc::now();
        comment.version = 1;
        tables.comments.insert(comment.id, comment.clone());
        Ok(())
    }

    async fn get_comment(&self, id: i64) -> Result<Comment, StoreError> {
        self.tables()
            .comments
            .get(&id)
            .cloned()
            .ok_or(StoreError::RecordNotFound)
    }

    async fn update_comment(&self, comment: &mut Comment) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let stored = match tables.comments.get_mut(&comment.id) {
            Some(stored) if stored.version == comment.version => stored,
            _ => return Err(StoreError::EditConflict),
        };
        comment.version += 1;
        *stored = comment.clone();
        Ok(())
    }

    async fn delete_comment(&self, id: i64) -> Result<(), StoreError> {
        self.tables()
            .comments
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::RecordNotFound)
    }

    async fn list_comments(
        &self,
        filters: &CommentFilters,
    ) -> Result<(Vec<Comment>, Metadata), StoreError> {
        let tables = self.tables();
        let content = filters.content.to_lowercase();

        let matching: Vec<&Comment> = tables
            .comments
            .values()
            .filter(|c| content.is_empty() || c.content.to_lowercase().contains(&content))
            .filter(|c| filters.author.is_empty() || c.author.eq_ignore_ascii_case(&filters.author))
            .collect();

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(usize::try_from(filters.offset()).unwrap_or(usize::MAX))
            .take(filters.page_size as usize)
            .cloned()
            .collect();

        Ok((page, Metadata::calculate(total, filters.page, filters.page_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{generate_token, Password};
    use crate::database::models::{COMMENTS_READ, COMMENTS_WRITE};
    use chrono::Duration;

    fn user(email: &str) -> User {
        User::new("ana", email, Password::from_hash("hash".into()))
    }

    #[tokio::test]
    async fn emails_are_unique() {
        let store = MemoryStore::new();
        store.insert_user(&mut user("ana@example.com")).await.unwrap();
        let err = store.insert_user(&mut user("ana@example.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));
    }

    #[tokio::test]
    async fn stale_user_version_conflicts() {
        let store = MemoryStore::new();
        let mut first = user("ana@example.com");
        store.insert_user(&mut first).await.unwrap();
        let mut second = first.clone();

        first.activated = true;
        store.update_user(&mut first).await.unwrap();
        assert_eq!(first.version, 2);

        second.username = "other".into();
        let err = store.update_user(&mut second).await.unwrap_err();
        assert!(matches!(err, StoreError::EditConflict));
        assert!(store.get_user_by_email("ana@example.com").await.unwrap().activated);
    }

    #[tokio::test]
    async fn token_lookup_checks_expiry_against_now() {
        let store = MemoryStore::new();
        let mut owner = user("ana@example.com");
        store.insert_user(&mut owner).await.unwrap();
        let token = generate_token(owner.id, Duration::minutes(5), Scope::Authentication).unwrap();
        store.insert_token(&token).await.unwrap();

        let before = token.expiry - Duration::seconds(1);
        assert!(store.get_user_for_token(Scope::Authentication, &token.hash, before).await.is_ok());

        let err = store
            .get_user_for_token(Scope::Authentication, &token.hash, token.expiry)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound));
    }

    #[tokio::test]
    async fn unknown_permission_codes_are_ignored() {
        let store = MemoryStore::new();
        store
            .add_permissions_for_user(1, &[COMMENTS_READ, "comments:admin"])
            .await
            .unwrap();
        let perms = store.get_all_permissions_for_user(1).await.unwrap();
        assert!(perms.include(COMMENTS_READ));
        assert!(!perms.include(COMMENTS_WRITE));
        assert!(!perms.include("comments:admin"));

        assert!(store.get_all_permissions_for_user(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_filters_and_paginates() {
        let store = MemoryStore::new();
        for (content, author) in [("hello there", "ana"), ("Hello again", "bo"), ("bye", "ana")] {
            store
                .insert_comment(&mut Comment::new(content.into(), author.into()))
                .await
                .unwrap();
        }

        let filters = CommentFilters { content: "hello".into(), ..Default::default() };
        let (comments, meta) = store.list_comments(&filters).await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(meta.total_records, Some(2));

        let filters = CommentFilters { author: "ANA".into(), page: 2, page_size: 1, ..Default::default() };
        let (comments, meta) = store.list_comments(&filters).await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].content, "bye");
        assert_eq!(meta.last_page, Some(2));
    }

    #[tokio::test]
    async fn delete_missing_comment_is_not_found() {
        let store = MemoryStore::new();
        let err = store.delete_comment(42).await.unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound));
    }
}
