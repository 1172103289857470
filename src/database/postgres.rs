use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use std::time::Duration;
use tracing::info;

use super::models::{Comment, CommentFilters, Metadata, Permissions, User};
use super::{with_deadline, CommentStore, PermissionStore, StoreError, TokenStore, UserStore};
use crate::auth::{Password, Scope, Token};
use crate::config::DatabaseConfig;

const USERS_EMAIL_KEY: &str = "users_email_key";

/// Postgres-backed store. Every call runs under the configured query deadline.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgStore {
    pub async fn connect(dsn: &str, config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
            .connect(dsn)
            .await?;

        info!(max_connections = config.max_connections, "database connection pool established");

        Ok(Self {
            pool,
            query_timeout: config.query_timeout(),
        })
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password: Password::from_hash(row.try_get("password_hash")?),
        activated: row.try_get("activated")?,
        version: row.try_get("version")?,
    })
}

fn duplicate_email(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.constraint() == Some(USERS_EMAIL_KEY) => {
            StoreError::DuplicateEmail
        }
        _ => err.into(),
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn insert_user(&self, user: &mut User) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO users (username, email, password_hash, activated)
            VALUES ($1, $2, $3, $4)
            RETURNING id, created_at, version
        "#;

        let row = with_deadline(self.query_timeout, async {
            sqlx::query(query)
                .bind(&user.username)
                .bind(&user.email)
                .bind(user.password.hash())
                .bind(user.activated)
                .fetch_one(&self.pool)
                .await
                .map_err(duplicate_email)
        })
        .await?;

        user.id = row.try_get("id")?;
        user.created_at = row.try_get("created_at")?;
        user.version = row.try_get("version")?;
        Ok(())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError> {
        let query = r#"
            SELECT id, created_at, username, email, password_hash, activated, version
            FROM users
            WHERE email = $1
        "#;

        let row = with_deadline(self.query_timeout, async {
            sqlx::query(query)
                .bind(email)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)
        })
        .await?
        .ok_or(StoreError::RecordNotFound)?;

        Ok(user_from_row(&row)?)
    }

    async fn update_user(&self, user: &mut User) -> Result<(), StoreError> {
        let query = r#"
            UPDATE users
            SET username = $1, email = $2, password_hash = $3, activated = $4, version = version + 1
            WHERE id = $5 AND version = $6
            RETURNING version
        "#;

        let row = with_deadline(self.query_timeout, async {
            sqlx::query(query)
                .bind(&user.username)
                .bind(&user.email)
                .bind(user.password.hash())
                .bind(user.activated)
                .bind(user.id)
                .bind(user.version)
                .fetch_optional(&self.pool)
                .await
                .map_err(duplicate_email)
        })
        .await?
        .ok_or(StoreError::EditConflict)?;

        user.version = row.try_get("version")?;
        Ok(())
    }

    async fn get_user_for_token(
        &self,
        scope: Scope,
        hash: &[u8; 32],
        now: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        let query = r#"
            SELECT users.id, users.created_at, users.username, users.email,
                   users.password_hash, users.activated, users.version
            FROM users
            INNER JOIN tokens ON users.id = tokens.user_id
            WHERE tokens.hash = $1 AND tokens.scope = $2 AND tokens.expiry > $3
        "#;

        let row = with_deadline(self.query_timeout, async {
            sqlx::query(query)
                .bind(&hash[..])
                .bind(scope.as_str())
                .bind(now)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)
        })
        .await?
        .ok_or(StoreError::RecordNotFound)?;

        Ok(user_from_row(&row)?)
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_token(&self, token: &Token) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO tokens (hash, user_id, expiry, scope)
            VALUES ($1, $2, $3, $4)
        "#;

        with_deadline(self.query_timeout, async {
            sqlx::query(query)
                .bind(&token.hash[..])
                .bind(token.user_id)
                .bind(token.expiry)
                .bind(token.scope.as_str())
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(StoreError::from)
        })
        .await
    }

    async fn delete_all_tokens_for_user(&self, scope: Scope, user_id: i64) -> Result<(), StoreError> {
        let query = "DELETE FROM tokens WHERE scope = $1 AND user_id = $2";

        with_deadline(self.query_timeout, async {
            sqlx::query(query)
                .bind(scope.as_str())
                .bind(user_id)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(StoreError::from)
        })
        .await
    }
}

#[async_trait]
impl PermissionStore for PgStore {
    async fn get_all_permissions_for_user(&self, user_id: i64) -> Result<Permissions, StoreError> {
        let query = r#"
            SELECT permissions.code
            FROM permissions
            INNER JOIN users_permissions ON users_permissions.permission_id = permissions.id
            WHERE users_permissions.user_id = $1
        "#;

        let codes: Vec<String> = with_deadline(self.query_timeout, async {
            sqlx::query_scalar::<_, String>(query)
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::from)
        })
        .await?;

        Ok(codes.into_iter().collect())
    }

    async fn add_permissions_for_user(&self, user_id: i64, codes: &[&str]) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO users_permissions
            SELECT $1, permissions.id FROM permissions WHERE permissions.code = ANY($2)
            ON CONFLICT DO NOTHING
        "#;
        let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();

        with_deadline(self.query_timeout, async {
            sqlx::query(query)
                .bind(user_id)
                .bind(&codes)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(StoreError::from)
        })
        .await
    }
}

#[async_trait]
impl CommentStore for PgStore {
    async fn insert_comment(&self, comment: &mut Comment) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO comments (content, author)
            VALUES ($1, $2)
            RETURNING id, created_at, version
        "#;

        let row = with_deadline(self.query_timeout, async {
            sqlx::query(query)
                .bind(&comment.content)
                .bind(&comment.author)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::from)
        })
        .await?;

        comment.id = row.try_get("id")?;
        comment.created_at = row.try_get("created_at")?;
        comment.version = row.try_get("version")?;
        Ok(())
    }

    async fn get_comment(&self, id: i64) -> Result<Comment, StoreError> {
        let query = "SELECT id, created_at, content, author, version FROM comments WHERE id = $1";

        with_deadline(self.query_timeout, async {
            sqlx::query_as::<_, Comment>(query)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)
        })
        .await?
        .ok_or(StoreError::RecordNotFound)
    }

    async fn update_comment(&self, comment: &mut Comment) -> Result<(), StoreError> {
        let query = r#"
            UPDATE comments
            SET content = $1, author = $2, version = version + 1
            WHERE id = $3 AND version = $4
            RETURNING version
        "#;

        let version = with_deadline(self.query_timeout, async {
            sqlx::query_scalar::<_, i32>(query)
                .bind(&comment.content)
                .bind(&comment.author)
                .bind(comment.id)
                .bind(comment.version)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)
        })
        .await?
        .ok_or(StoreError::EditConflict)?;

        comment.version = version;
        Ok(())
    }

    async fn delete_comment(&self, id: i64) -> Result<(), StoreError> {
        let result = with_deadline(self.query_timeout, async {
            sqlx::query("DELETE FROM comments WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RecordNotFound);
        }
        Ok(())
    }

    async fn list_comments(
        &self,
        filters: &CommentFilters,
    ) -> Result<(Vec<Comment>, Metadata), StoreError> {
        let query = r#"
            SELECT count(*) OVER() AS total_records, id, created_at, content, author, version
            FROM comments
            WHERE (to_tsvector('simple', content) @@ plainto_tsquery('simple', $1) OR $1 = '')
              AND (LOWER(author) = LOWER($2) OR $2 = '')
            ORDER BY id ASC
            LIMIT $3 OFFSET $4
        "#;

        let rows = with_deadline(self.query_timeout, async {
            sqlx::query(query)
                .bind(&filters.content)
                .bind(&filters.author)
                .bind(filters.limit())
                .bind(filters.offset())
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::from)
        })
        .await?;

        let mut total_records: i64 = 0;
        let mut comments = Vec::with_capacity(rows.len());
        for row in &rows {
            total_records = row.try_get("total_records")?;
            comments.push(Comment {
                id: row.try_get("id")?,
                created_at: row.try_get("created_at")?,
                content: row.try_get("content")?,
                author: row.try_get("author")?,
                version: row.try_get("version")?,
            });
        }

        let total = u64::try_from(total_records).unwrap_or_default();
        Ok((comments, Metadata::calculate(total, filters.page, filters.page_size)))
    }
}
