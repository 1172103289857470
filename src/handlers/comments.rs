// handlers/comments.rs - /v1/comments and /v1/comments/:id

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

use crate::api::json::{envelope, write_json, Envelope, JsonBody};
use crate::database::models::{validate_comment, Comment, CommentFilters};
use crate::error::ApiError;
use crate::handlers::{parse_id, QueryParams};
use crate::state::AppState;
use crate::validator::Validator;

/// Missing keys decode as empty strings and are reported by validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CreateCommentInput {
    pub content: String,
    pub author: String,
}

/// Absent fields keep their stored value.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateCommentInput {
    pub content: Option<String>,
    pub author: Option<String>,
}

pub async fn list_comments(
    State(state): State<AppState>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> Result<Response, ApiError> {
    let params = QueryParams::from_extractor(query)?;
    let mut v = Validator::new();

    let filters = CommentFilters {
        content: params.string("content", ""),
        author: params.string("author", ""),
        page: params.int("page", 1, &mut v),
        page_size: params.int("page_size", 20, &mut v),
    };
    filters.validate(&mut v);
    if !v.is_empty() {
        return Err(ApiError::FailedValidation(v.into_errors()));
    }

    let (comments, metadata) = state.store.list_comments(&filters).await?;

    let mut data = Envelope::new();
    data.insert("comments", &comments)?;
    data.insert("metadata", &metadata)?;
    Ok(write_json(StatusCode::OK, &data, HeaderMap::new())?)
}

pub async fn create_comment(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<CreateCommentInput>,
) -> Result<Response, ApiError> {
    let mut comment = Comment::new(input.content, input.author);

    let mut v = Validator::new();
    validate_comment(&mut v, &comment);
    if !v.is_empty() {
        return Err(ApiError::FailedValidation(v.into_errors()));
    }

    state.store.insert_comment(&mut comment).await?;

    let mut headers = HeaderMap::new();
    let location = format!("/v1/comments/{}", comment.id);
    headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&location).map_err(ApiError::internal)?,
    );

    Ok(write_json(StatusCode::CREATED, &envelope("comment", &comment)?, headers)?)
}

pub async fn show_comment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let comment = state.store.get_comment(id).await?;
    Ok(write_json(StatusCode::OK, &envelope("comment", &comment)?, HeaderMap::new())?)
}

pub async fn update_comment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(input): JsonBody<UpdateCommentInput>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let mut comment = state.store.get_comment(id).await?;

    if let Some(content) = input.content {
        comment.content = content;
    }
    if let Some(author) = input.author {
        comment.author = author;
    }

    let mut v = Validator::new();
    validate_comment(&mut v, &comment);
    if !v.is_empty() {
        return Err(ApiError::FailedValidation(v.into_errors()));
    }

    state.store.update_comment(&mut comment).await?;
    Ok(write_json(StatusCode::OK, &envelope("comment", &comment)?, HeaderMap::new())?)
}

pub async fn delete_comment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    state.store.delete_comment(id).await?;

    let mut data = Envelope::new();
    data.insert_value("message", json!("comment successfully deleted"));
    Ok(write_json(StatusCode::OK, &data, HeaderMap::new())?)
}
