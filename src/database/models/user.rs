use chrono::{DateTime, Utc};
use serde::Serialize;
use validator::ValidateEmail;

use crate::auth::{validate_password_plaintext, Password};
use crate::validator::Validator;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password: Password,
    pub activated: bool,
    #[serde(skip)]
    pub version: i32,
}

impl User {
    /// An unsaved, inactive user. The store assigns `id`, `created_at` and `version`.
    pub fn new(username: &str, email: &str, password: Password) -> Self {
        Self {
            id: 0,
            created_at: Utc::now(),
            username: username.to_string(),
            email: email.to_string(),
            password,
            activated: false,
            version: 0,
        }
    }
}

/// Who a request acts on behalf of.
#[derive(Debug, Clone, Default)]
pub enum Identity {
    #[default]
    Anonymous,
    User(User),
}

impl Identity {
    pub fn user(&self) -> Option<&User> {
        match self {
            Identity::Anonymous => None,
            Identity::User(user) => Some(user),
        }
    }
}

pub fn validate_email(v: &mut Validator, email: &str) {
    v.check(!email.is_empty(), "email", "must be provided");
    v.check(email.validate_email(), "email", "must be a valid email address");
}

/// Checks a user about to be stored. `plaintext` is only present when the
/// password is being set in this request; the hash is derived from it after
/// validation passes, so it is only required when `plaintext` is absent.
pub fn validate_user(v: &mut Validator, user: &User, plaintext: Option<&str>) {
    v.check(!user.username.is_empty(), "username", "must be provided");
    v.check(user.username.len() <= 200, "username", "must not be more than 200 bytes long");

    validate_email(v, &user.email);

    match plaintext {
        Some(plaintext) => validate_password_plaintext(v, plaintext),
        None if !user.password.is_set() => v.add_error("password", "a password hash is required"),
        None => {}
    }
}
