use std::collections::BTreeSet;

pub const COMMENTS_READ: &str = "comments:read";
pub const COMMENTS_WRITE: &str = "comments:write";

/// Codes seeded by the schema; grants for anything else are ignored.
pub const KNOWN_PERMISSIONS: [&str; 2] = [COMMENTS_READ, COMMENTS_WRITE];

/// Permission codes held by one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions(BTreeSet<String>);

impl Permissions {
    pub fn include(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Permissions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}
