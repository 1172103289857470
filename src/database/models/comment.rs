use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::validator::Validator;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Comment {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub content: String,
    pub author: String,
    pub version: i32,
}

impl Comment {
    pub fn new(content: String, author: String) -> Self {
        Self {
            id: 0,
            created_at: Utc::now(),
            content,
            author,
            version: 0,
        }
    }
}

pub fn validate_comment(v: &mut Validator, comment: &Comment) {
    v.check(!comment.content.is_empty(), "content", "must be provided");
    v.check(comment.content.len() <= 100, "content", "must not be more than 100 bytes long");
    v.check(!comment.author.is_empty(), "author", "must be provided");
    v.check(comment.author.len() <= 25, "author", "must not be more than 25 bytes long");
}
