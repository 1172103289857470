pub mod comment;
pub mod filters;
pub mod permission;
pub mod user;

pub use comment::{validate_comment, Comment};
pub use filters::{CommentFilters, Metadata};
pub use permission::{Permissions, COMMENTS_READ, COMMENTS_WRITE, KNOWN_PERMISSIONS};
pub use user::{validate_email, validate_user, Identity, User};
