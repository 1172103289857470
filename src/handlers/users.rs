// handlers/users.rs - POST /v1/users, PUT /v1/users/activated

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::Duration;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::api::json::{envelope, write_json, JsonBody};
use crate::auth::{validate_plaintext, Password, Scope, TokenError};
use crate::database::models::{validate_user, User, COMMENTS_READ};
use crate::database::StoreError;
use crate::error::ApiError;
use crate::mailer::USER_WELCOME;
use crate::state::AppState;
use crate::validator::Validator;

/// Missing keys decode as empty strings and are reported by validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegisterInput {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActivateInput {
    pub token: String,
}

/// Creates an inactive user with `comments:read`, issues a 3-day activation
/// token and mails it from a tracked background task.
pub async fn register_user(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<RegisterInput>,
) -> Result<Response, ApiError> {
    let mut user = User::new(&input.username, &input.email, Password::default());

    let mut v = Validator::new();
    validate_user(&mut v, &user, Some(&input.password));
    if !v.is_empty() {
        return Err(ApiError::FailedValidation(v.into_errors()));
    }

    user.password = Password::hash_blocking(input.password).await?;

    state.store.insert_user(&mut user).await?;
    state
        .store
        .add_permissions_for_user(user.id, &[COMMENTS_READ])
        .await?;

    let token = state
        .tokens
        .issue(user.id, Duration::days(3), Scope::Activation)
        .await?;

    info!(user_id = user.id, "user registered");

    let mailer = state.mailer.clone();
    let recipient = user.email.clone();
    let data = json!({
        "user_id": user.id,
        "activation_token": token.plaintext,
    });
    state.tasks.spawn("welcome_email", async move {
        if let Err(e) = mailer.send(&recipient, USER_WELCOME, &data).await {
            error!(error = %e, to = %recipient, "failed to send welcome email");
        }
    });

    Ok(write_json(StatusCode::CREATED, &envelope("user", &user)?, HeaderMap::new())?)
}

/// Activates the owner of an activation token and revokes all of that
/// user's activation tokens.
pub async fn activate_user(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<ActivateInput>,
) -> Result<Response, ApiError> {
    let mut v = Validator::new();
    validate_plaintext(&mut v, &input.token);
    if !v.is_empty() {
        return Err(ApiError::FailedValidation(v.into_errors()));
    }

    let mut user = match state.tokens.resolve(Scope::Activation, &input.token).await {
        Ok(user) => user,
        Err(TokenError::Store(StoreError::RecordNotFound)) => {
            return Err(ApiError::field("token", "invalid or expired activation token"))
        }
        Err(e) => return Err(e.into()),
    };

    user.activated = true;
    state.store.update_user(&mut user).await?;
    state.tokens.invalidate_all(Scope::Activation, user.id).await?;

    info!(user_id = user.id, "user activated");

    Ok(write_json(StatusCode::OK, &envelope("user", &user)?, HeaderMap::new())?)
}
