pub mod auth;
pub mod authorize;
pub mod cors;
pub mod rate_limit;
pub mod recover;

pub use auth::authenticate;
pub use authorize::{
    activated, authenticated, permitted, request_identity, require_activated_user,
    require_authentication, require_permission, PermissionGate,
};
pub use cors::cors_layer;
pub use rate_limit::{rate_limit, RateLimiter};
pub use recover::recover_panic;
