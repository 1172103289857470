// HTTP API Error Types
use axum::{
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::api::json::{write_json, DecodeError, EncodeError, Envelope};
use crate::auth::{PasswordError, TokenError};
use crate::database::StoreError;

const SERVER_ERROR_MESSAGE: &str =
    "the server encountered a problem and could not process your request";

/// Every failure a handler or middleware can surface to a client.
///
/// Client-input variants carry the specific defect. Authorization variants
/// carry fixed messages. `Internal` keeps its detail for the log only.
#[derive(Debug, Error)]
pub enum ApiError {
    // 400 Bad Request
    #[error("{0}")]
    BadRequest(String),

    // 401 Unauthorized
    #[error("invalid authentication credentials")]
    InvalidCredentials,
    #[error("invalid or missing authentication token")]
    InvalidAuthenticationToken,
    #[error("you must be authenticated to access this resource")]
    AuthenticationRequired,

    // 403 Forbidden
    #[error("your user account must be activated to access this resource")]
    InactiveAccount,
    #[error("your user account doesn't have the necessary permissions to access this resource")]
    NotPermitted,

    // 404 Not Found
    #[error("the requested resource could not be found")]
    NotFound,

    // 405 Method Not Allowed
    #[error("the {0} method is not supported for this resource")]
    MethodNotAllowed(Method),

    // 409 Conflict
    #[error("unable to update the record due to an edit conflict, please try again")]
    EditConflict,

    // 422 Unprocessable Entity
    #[error("failed validation")]
    FailedValidation(HashMap<String, String>),

    // 429 Too Many Requests
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    // 500 Internal Server Error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidCredentials
            | ApiError::InvalidAuthenticationToken
            | ApiError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            ApiError::InactiveAccount | ApiError::NotPermitted => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::EditConflict => StatusCode::CONFLICT,
            ApiError::FailedValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value placed under the `"error"` key of the response envelope.
    pub fn to_json(&self) -> Value {
        match self {
            ApiError::FailedValidation(errors) => json!(errors),
            ApiError::Internal(_) => json!(SERVER_ERROR_MESSAGE),
            other => json!(other.to_string()),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        ApiError::Internal(detail.to_string())
    }

    /// Single-field validation failure, e.g. a duplicate email.
    pub fn field(key: &str, message: &str) -> Self {
        let mut errors = HashMap::new();
        errors.insert(key.to_string(), message.to_string());
        ApiError::FailedValidation(errors)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if matches!(self, ApiError::InvalidAuthenticationToken) {
            headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        headers
    }
}

// Convert other error types to ApiError
impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RecordNotFound => ApiError::NotFound,
            StoreError::EditConflict => ApiError::EditConflict,
            StoreError::DuplicateEmail => {
                ApiError::field("email", "a user with this email already exists")
            }
            other => ApiError::internal(other),
        }
    }
}

impl From<DecodeError> for ApiError {
    fn from(err: DecodeError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<EncodeError> for ApiError {
    fn from(err: EncodeError) -> Self {
        ApiError::internal(err)
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Store(store) => store.into(),
            other => ApiError::internal(other),
        }
    }
}

impl From<PasswordError> for ApiError {
    fn from(err: PasswordError) -> Self {
        ApiError::internal(err)
    }
}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!(error = %detail, "request failed with server error");
        }

        let status = self.status_code();
        let mut envelope = Envelope::new();
        envelope.insert_value("error", self.to_json());

        match write_json(status, &envelope, self.headers()) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode error response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
