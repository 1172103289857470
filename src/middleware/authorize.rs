use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::database::models::{Identity, User};
use crate::database::Store;
use crate::error::ApiError;

/// The identity attached by `authenticate`, or anonymous if none was.
pub fn request_identity(request: &Request) -> Identity {
    request.extensions().get::<Identity>().cloned().unwrap_or_default()
}

pub fn authenticated(identity: &Identity) -> Result<&User, ApiError> {
    identity.user().ok_or(ApiError::AuthenticationRequired)
}

/// Authentication is checked first, so an anonymous caller always gets 401.
pub fn activated(identity: &Identity) -> Result<&User, ApiError> {
    let user = authenticated(identity)?;
    if !user.activated {
        return Err(ApiError::InactiveAccount);
    }
    Ok(user)
}

pub async fn permitted(store: &dyn Store, identity: &Identity, code: &str) -> Result<(), ApiError> {
    let user = activated(identity)?;
    let permissions = store.get_all_permissions_for_user(user.id).await?;
    if !permissions.include(code) {
        return Err(ApiError::NotPermitted);
    }
    Ok(())
}

pub async fn require_authentication(request: Request, next: Next) -> Result<Response, ApiError> {
    authenticated(&request_identity(&request))?;
    Ok(next.run(request).await)
}

pub async fn require_activated_user(request: Request, next: Next) -> Result<Response, ApiError> {
    activated(&request_identity(&request))?;
    Ok(next.run(request).await)
}

/// State for `require_permission`: which code a route needs and where to look it up.
#[derive(Clone)]
pub struct PermissionGate {
    store: Arc<dyn Store>,
    code: &'static str,
}

impl PermissionGate {
    pub fn new(store: Arc<dyn Store>, code: &'static str) -> Self {
        Self { store, code }
    }
}

pub async fn require_permission(
    State(gate): State<PermissionGate>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    permitted(gate.store.as_ref(), &request_identity(&request), gate.code).await?;
    Ok(next.run(request).await)
}
