use std::collections::HashMap;

/// Accumulates at most one failure message per field key.
///
/// The first message recorded for a key wins; later messages for the same key
/// are ignored. An empty validator means the input was valid.
#[derive(Debug, Default, Clone)]
pub struct Validator {
    pub errors: HashMap<String, String>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.errors.entry(key.into()).or_insert_with(|| message.into());
    }

    /// Records `message` under `key` only when `ok` is false.
    pub fn check(&mut self, ok: bool, key: &str, message: &str) {
        if !ok {
            self.add_error(key, message);
        }
    }

    pub fn into_errors(self) -> HashMap<String, String> {
        self.errors
    }
}
