// handlers/tokens.rs - POST /v1/tokens/authentication

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::Duration;
use serde::Deserialize;

use crate::api::json::{envelope, write_json, JsonBody};
use crate::auth::{validate_password_plaintext, Scope};
use crate::database::models::validate_email;
use crate::database::StoreError;
use crate::error::ApiError;
use crate::state::AppState;
use crate::validator::Validator;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsInput {
    pub email: String,
    pub password: String,
}

pub async fn create_authentication_token(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<CredentialsInput>,
) -> Result<Response, ApiError> {
    let mut v = Validator::new();
    validate_email(&mut v, &input.email);
    validate_password_plaintext(&mut v, &input.password);
    if !v.is_empty() {
        return Err(ApiError::FailedValidation(v.into_errors()));
    }

    let user = match state.store.get_user_by_email(&input.email).await {
        Ok(user) => user,
        Err(StoreError::RecordNotFound) => return Err(ApiError::InvalidCredentials),
        Err(e) => return Err(e.into()),
    };

    if !user.password.matches_blocking(input.password).await? {
        return Err(ApiError::InvalidCredentials);
    }

    let token = state
        .tokens
        .issue(user.id, Duration::hours(24), Scope::Authentication)
        .await?;

    Ok(write_json(
        StatusCode::CREATED,
        &envelope("authentication_token", &token)?,
        HeaderMap::new(),
    )?)
}
