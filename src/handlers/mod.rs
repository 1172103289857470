// handlers/mod.rs - thin HTTP handlers over the store, grouped by resource
//
// Public:        healthcheck, user registration/activation, token issue
// comments:read  list + show
// comments:write create, update, delete

pub mod comments;
pub mod fallback;
pub mod healthcheck;
pub mod tokens;
pub mod users;

use axum::extract::rejection::QueryRejection;
use axum::extract::Query;
use std::collections::HashMap;

use crate::error::ApiError;
use crate::validator::Validator;

pub use fallback::{method_not_allowed, not_found};

/// Route ids are positive integers; anything else is a missing resource.
pub fn parse_id(raw: &str) -> Result<i64, ApiError> {
    match raw.parse::<i64>() {
        Ok(id) if id >= 1 => Ok(id),
        _ => Err(ApiError::NotFound),
    }
}

/// Query string as a flat map. Later duplicates win.
pub struct QueryParams(HashMap<String, String>);

impl QueryParams {
    pub fn from_extractor(
        query: Result<Query<HashMap<String, String>>, QueryRejection>,
    ) -> Result<Self, ApiError> {
        let Query(params) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
        Ok(Self(params))
    }

    pub fn string(&self, key: &str, default: &str) -> String {
        match self.0.get(key) {
            Some(value) if !value.is_empty() => value.clone(),
            _ => default.to_string(),
        }
    }

    /// Non-integer values record `must be an integer value` and fall back to `default`.
    pub fn int(&self, key: &str, default: u32, v: &mut Validator) -> u32 {
        match self.0.get(key) {
            None => default,
            Some(value) if value.is_empty() => default,
            Some(value) => value.parse().unwrap_or_else(|_| {
                v.add_error(key, "must be an integer value");
                default
            }),
        }
    }
}
