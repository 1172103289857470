use axum::{
    extract::Request,
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::error;

use crate::background::panic_message;
use crate::error::ApiError;

/// Outermost stage: turns a panic anywhere below into a generic 500 and
/// closes the connection.
pub async fn recover_panic(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!(%method, %uri, panic = %panic_message(panic.as_ref()), "recovered from panic");
            let mut response = ApiError::internal("handler panicked").into_response();
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            response
        }
    }
}
