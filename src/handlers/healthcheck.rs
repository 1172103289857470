// handlers/healthcheck.rs - GET /v1/healthcheck

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde_json::json;

use crate::api::json::{write_json, Envelope};
use crate::error::ApiError;
use crate::state::AppState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn healthcheck(State(state): State<AppState>) -> Result<Response, ApiError> {
    let mut data = Envelope::new();
    data.insert_value("status", json!("available"));
    data.insert_value(
        "system_info",
        json!({
            "environment": state.config.environment.as_str(),
            "version": VERSION,
        }),
    );

    Ok(write_json(StatusCode::OK, &data, HeaderMap::new())?)
}
