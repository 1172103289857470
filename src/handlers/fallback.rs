// handlers/fallback.rs - JSON bodies for unknown routes and unsupported methods

use axum::http::Method;

use crate::error::ApiError;

pub async fn not_found() -> ApiError {
    ApiError::NotFound
}

pub async fn method_not_allowed(method: Method) -> ApiError {
    ApiError::MethodNotAllowed(method)
}
