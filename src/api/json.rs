use axum::{
    async_trait,
    body::{Body, Bytes},
    extract::{
        rejection::{BytesRejection, FailedToBufferBody},
        FromRequest, Request,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{error::Category, ser::PrettyFormatter, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::ApiError;
use crate::state::AppState;

/// Why a request body could not be turned into the requested type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("the body must not be larger than {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("body contains unknown key \"{name}\"")]
    UnknownField { name: String },

    #[error("the body must only contain a single JSON value")]
    MultipleValues,

    #[error("the body contains badly-formed JSON (at character {offset})")]
    MalformedSyntax { offset: usize },

    #[error("the body contains badly-formed JSON")]
    TruncatedBody,

    #[error("{}", describe_mismatch(.field.as_deref(), *.offset))]
    TypeMismatch { field: Option<String>, offset: usize },

    #[error("the body must not be empty")]
    EmptyBody,

    #[error("the body could not be read: {reason}")]
    Unreadable { reason: String },
}

fn describe_mismatch(field: Option<&str>, offset: usize) -> String {
    match field {
        Some(field) => format!("the body contains the incorrect JSON type for field \"{field}\""),
        None => format!("the body contains the incorrect JSON type (at character {offset})"),
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode response body: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Decodes exactly one JSON value of type `T` from `body`.
///
/// Unknown keys are rejected by the target type (`#[serde(deny_unknown_fields)]`);
/// this function classifies that rejection along with every other failure.
pub fn read_json<T: DeserializeOwned>(body: &[u8], limit: usize) -> Result<T, DecodeError> {
    if body.len() > limit {
        return Err(DecodeError::BodyTooLarge { limit });
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::EmptyBody);
    }

    let mut de = serde_json::Deserializer::from_slice(body);
    let value: T = serde_path_to_error::deserialize(&mut de).map_err(|e| classify(body, e))?;

    // Anything but trailing whitespace means a second value.
    de.end().map_err(|_| DecodeError::MultipleValues)?;

    Ok(value)
}

fn classify(body: &[u8], err: serde_path_to_error::Error<serde_json::Error>) -> DecodeError {
    let path = err.path().to_string();
    let inner = err.into_inner();
    let offset = byte_offset(body, inner.line(), inner.column());

    match inner.classify() {
        Category::Eof => DecodeError::TruncatedBody,
        Category::Syntax => DecodeError::MalformedSyntax { offset },
        Category::Io => DecodeError::Unreadable { reason: inner.to_string() },
        Category::Data => match unknown_field_name(&inner.to_string()) {
            Some(name) => DecodeError::UnknownField { name },
            None => DecodeError::TypeMismatch {
                field: (path != ".").then_some(path),
                offset,
            },
        },
    }
}

fn unknown_field_name(message: &str) -> Option<String> {
    let rest = message.strip_prefix("unknown field `")?;
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

// serde_json reports 1-based lines and columns; clients get a byte offset.
fn byte_offset(body: &[u8], line: usize, column: usize) -> usize {
    let line_start: usize = body
        .split(|b| *b == b'\n')
        .take(line.saturating_sub(1))
        .map(|l| l.len() + 1)
        .sum();
    (line_start + column).min(body.len())
}

/// Single-key-per-concept response wrapper, e.g. `{"comment": {...}}`.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(transparent)]
pub struct Envelope(BTreeMap<String, Value>);

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<&mut Self, EncodeError> {
        self.0.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn insert_value(&mut self, key: &str, value: Value) -> &mut Self {
        self.0.insert(key.to_string(), value);
        self
    }
}

/// Builds an envelope holding one concept.
pub fn envelope<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Envelope, EncodeError> {
    let mut envelope = Envelope::new();
    envelope.insert(key, value)?;
    Ok(envelope)
}

/// Renders `data` as tab-indented JSON with a trailing newline.
///
/// Caller headers are applied first; `Content-Type` is always
/// `application/json`.
pub fn write_json(
    status: StatusCode,
    data: &Envelope,
    headers: HeaderMap,
) -> Result<Response, EncodeError> {
    let mut body = Vec::with_capacity(256);
    let mut ser = serde_json::Serializer::with_formatter(&mut body, PrettyFormatter::with_indent(b"\t"));
    data.serialize(&mut ser)?;
    body.push(b'\n');

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    response_headers.extend(headers);
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

    Ok(response)
}

/// Extractor running the strict decode contract over the request body.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T> FromRequest<AppState> for JsonBody<T>
where
    T: DeserializeOwned + Send,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let limit = state.config.json.max_body_bytes;

        let bytes = match Bytes::from_request(req, state).await {
            Ok(bytes) => bytes,
            Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) => {
                return Err(DecodeError::BodyTooLarge { limit }.into())
            }
            Err(rejection) => {
                return Err(DecodeError::Unreadable { reason: rejection.body_text() }.into())
            }
        };

        Ok(JsonBody(read_json(&bytes, limit)?))
    }
}
