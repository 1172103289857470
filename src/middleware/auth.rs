use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth::{validate_plaintext, Scope, TokenError, TokenService};
use crate::database::{models::Identity, StoreError};
use crate::error::ApiError;
use crate::validator::Validator;

/// Resolves the caller from the `Authorization` header and attaches an
/// `Identity` to the request. No header means `Identity::Anonymous`.
///
/// Every response, including rejections, carries `Vary: Authorization`.
pub async fn authenticate(
    State(tokens): State<TokenService>,
    mut request: Request,
    next: Next,
) -> Response {
    let response = match resolve_identity(&tokens, request.headers()).await {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    };
    vary_on_authorization(response)
}

fn vary_on_authorization(mut response: Response) -> Response {
    response
        .headers_mut()
        .append(header::VARY, HeaderValue::from_static("Authorization"));
    response
}

async fn resolve_identity(tokens: &TokenService, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(Identity::Anonymous);
    };

    let plaintext = bearer_token(value).ok_or(ApiError::InvalidAuthenticationToken)?;

    let mut v = Validator::new();
    validate_plaintext(&mut v, plaintext);
    if !v.is_empty() {
        return Err(ApiError::InvalidAuthenticationToken);
    }

    match tokens.resolve(Scope::Authentication, plaintext).await {
        Ok(user) => Ok(Identity::User(user)),
        Err(TokenError::Store(StoreError::RecordNotFound)) => Err(ApiError::InvalidAuthenticationToken),
        Err(e) => Err(e.into()),
    }
}

/// Exactly `Bearer <token>`: one space, nothing else.
fn bearer_token(value: &HeaderValue) -> Option<&str> {
    let value = value.to_str().ok()?;
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) => Some(token),
        _ => None,
    }
}
