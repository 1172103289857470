use axum::{
    extract::DefaultBodyLimit,
    handler::Handler,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{timeout::RequestBodyTimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::database::models::{COMMENTS_READ, COMMENTS_WRITE};
use crate::handlers::{self, method_not_allowed, not_found};
use crate::middleware::{
    authenticate, cors_layer, rate_limit, recover_panic, require_permission, PermissionGate,
};
use crate::state::AppState;

/// The full pipeline, outermost first: panic recovery, tracing, CORS,
/// rate limiting, authentication, routing, per-route permission gates.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/healthcheck",
            get(handlers::healthcheck::healthcheck).fallback(method_not_allowed),
        )
        .merge(user_routes())
        .merge(comment_routes(&state))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(state.config.json.max_body_bytes))
        .layer(RequestBodyTimeoutLayer::new(state.config.server.read_timeout()))
        .layer(from_fn_with_state(state.tokens.clone(), authenticate))
        .layer(from_fn_with_state(state.limiter.clone(), rate_limit))
        .layer(cors_layer(&state.config.cors))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(recover_panic))
        .with_state(state)
}

fn user_routes() -> Router<AppState> {
    use handlers::{tokens, users};

    Router::new()
        .route(
            "/v1/users",
            post(users::register_user).fallback(method_not_allowed),
        )
        .route(
            "/v1/users/activated",
            put(users::activate_user).fallback(method_not_allowed),
        )
        .route(
            "/v1/tokens/authentication",
            post(tokens::create_authentication_token).fallback(method_not_allowed),
        )
}

fn comment_routes(state: &AppState) -> Router<AppState> {
    use handlers::comments;

    let can_read = from_fn_with_state(
        PermissionGate::new(state.store.clone(), COMMENTS_READ),
        require_permission,
    );
    let can_write = from_fn_with_state(
        PermissionGate::new(state.store.clone(), COMMENTS_WRITE),
        require_permission,
    );

    Router::new()
        .route(
            "/v1/comments",
            get(comments::list_comments.layer(can_read.clone()))
                .post(comments::create_comment.layer(can_write.clone()))
                .fallback(method_not_allowed),
        )
        .route(
            "/v1/comments/:id",
            get(comments::show_comment.layer(can_read))
                .patch(comments::update_comment.layer(can_write.clone()))
                .delete(comments::delete_comment.layer(can_write))
                .fallback(method_not_allowed),
        )
}

/// Serves `state` on `listener` until `signal` resolves, then shuts down:
/// stop accepting, give in-flight requests up to the grace period, then wait
/// for every tracked background task.
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let shutdown = state.shutdown.clone();
    let tasks = state.tasks.clone();
    let grace = state.config.server.shutdown_grace();

    if state.limiter.is_enabled() {
        tasks.spawn("rate_limiter_sweep", state.limiter.clone().run_sweeper(shutdown.clone()));
    }

    let app = app(state);
    let stop_accepting = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { stop_accepting.cancelled().await })
            .await
    });

    info!(%addr, "starting server");

    tokio::select! {
        result = &mut server => {
            // the server stopped without a signal
            shutdown.cancel();
            tasks.close_and_wait().await;
            return result.map_err(io::Error::other)?;
        }
        _ = signal => {
            info!("shutting down server");
        }
    }

    shutdown.cancel();
    match tokio::time::timeout(grace, &mut server).await {
        Ok(result) => result.map_err(io::Error::other)??,
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "in-flight requests outlived the grace period");
            server.abort();
        }
    }

    info!(pending = tasks.len(), "completing background tasks");
    tasks.close_and_wait().await;

    info!(%addr, "stopped server");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!(signal = "SIGINT", "caught signal"),
        () = terminate => info!(signal = "SIGTERM", "caught signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Scope;
    use crate::config::AppConfig;
    use crate::database::models::{COMMENTS_READ, COMMENTS_WRITE};
    use crate::database::{CommentStore, UserStore};
    use crate::testing::{body_json, client_addr, json_request, request, TestContext};
    use axum::{
        body::Body,
        extract::ConnectInfo,
        http::{header, Method, StatusCode},
    };
    use serde_json::json;
    use tower::ServiceExt;

    fn empty(method: Method, uri: &str, token: Option<&str>) -> axum::extract::Request {
        let mut builder = request(method, uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn healthcheck_reports_environment_and_version() {
        let ctx = TestContext::new();
        let response = app(ctx.state.clone())
            .oneshot(empty(Method::GET, "/v1/healthcheck", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[header::VARY], "Authorization");
        let json = body_json(response).await;
        assert_eq!(json["status"], "available");
        assert_eq!(json["system_info"]["environment"], "development");
    }

    #[tokio::test]
    async fn unknown_route_and_wrong_method_are_json() {
        let ctx = TestContext::new();

        let response = app(ctx.state.clone())
            .oneshot(empty(Method::GET, "/v1/nope", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await["error"],
            "the requested resource could not be found"
        );

        let response = app(ctx.state.clone())
            .oneshot(empty(Method::DELETE, "/v1/healthcheck", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            body_json(response).await["error"],
            "the DELETE method is not supported for this resource"
        );
    }

    #[tokio::test]
    async fn registration_then_activation_then_login() {
        let ctx = TestContext::new();
        let body = r#"{"username": "ana", "email": "ana@example.com", "password": "pa55word!"}"#;

        let response = app(ctx.state.clone())
            .oneshot(json_request(Method::POST, "/v1/users", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["user"]["activated"], false);
        assert!(json["user"].get("password").is_none());

        ctx.state.tasks.close_and_wait().await;
        let sent = ctx.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "ana@example.com");
        let activation = sent[0].data["activation_token"].as_str().unwrap().to_string();

        let body = json!({"token": activation}).to_string();
        let response = app(ctx.state.clone())
            .oneshot(json_request(Method::PUT, "/v1/users/activated", None, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["user"]["activated"], true);

        // activation tokens are single use
        let response = app(ctx.state.clone())
            .oneshot(json_request(Method::PUT, "/v1/users/activated", None, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let login = r#"{"email": "ana@example.com", "password": "pa55word!"}"#;
        let response = app(ctx.state.clone())
            .oneshot(json_request(Method::POST, "/v1/tokens/authentication", None, login))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let token = body_json(response).await["authentication_token"]["token"]
            .as_str()
            .unwrap()
            .to_string();

        // new users may read but not write
        let response = app(ctx.state.clone())
            .oneshot(empty(Method::GET, "/v1/comments", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(ctx.state.clone())
            .oneshot(json_request(
                Method::POST,
                "/v1/comments",
                Some(&token),
                r#"{"content": "hi", "author": "ana"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn duplicate_email_is_a_validation_error() {
        let ctx = TestContext::new();
        ctx.create_user("ana@example.com", true, &[]).await;

        let body = r#"{"username": "ana", "email": "ana@example.com", "password": "pa55word!"}"#;
        let response = app(ctx.state.clone())
            .oneshot(json_request(Method::POST, "/v1/users", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            body_json(response).await["error"]["email"],
            "a user with this email already exists"
        );
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let ctx = TestContext::new();
        ctx.create_user("ana@example.com", true, &[]).await;

        let login = r#"{"email": "ana@example.com", "password": "wrong-password"}"#;
        let response = app(ctx.state.clone())
            .oneshot(json_request(Method::POST, "/v1/tokens/authentication", None, login))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["error"],
            "invalid authentication credentials"
        );
    }

    #[tokio::test]
    async fn comment_crud_for_writer() {
        let ctx = TestContext::new();
        let writer = ctx
            .create_user("writer@example.com", true, &[COMMENTS_READ, COMMENTS_WRITE])
            .await;
        let token = Some(writer.token.as_str());

        let response = app(ctx.state.clone())
            .oneshot(json_request(
                Method::POST,
                "/v1/comments",
                token,
                r#"{"content": "first!", "author": "writer"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::LOCATION], "/v1/comments/1");

        let response = app(ctx.state.clone())
            .oneshot(json_request(
                Method::PATCH,
                "/v1/comments/1",
                token,
                r#"{"content": "edited"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["comment"]["content"], "edited");
        assert_eq!(json["comment"]["author"], "writer");
        assert_eq!(json["comment"]["version"], 2);

        let response = app(ctx.state.clone())
            .oneshot(empty(Method::GET, "/v1/comments?author=writer", token))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["comments"].as_array().unwrap().len(), 1);
        assert_eq!(json["metadata"]["total_records"], 1);

        let response = app(ctx.state.clone())
            .oneshot(empty(Method::DELETE, "/v1/comments/1", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(ctx.state.clone())
            .oneshot(empty(Method::GET, "/v1/comments/1", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_ids_and_bad_paging_are_rejected() {
        let ctx = TestContext::new();
        let reader = ctx.create_user("reader@example.com", true, &[COMMENTS_READ]).await;
        let token = Some(reader.token.as_str());

        let response = app(ctx.state.clone())
            .oneshot(empty(Method::GET, "/v1/comments/abc", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(ctx.state.clone())
            .oneshot(empty(Method::GET, "/v1/comments?page=x&page_size=500", token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["page"], "must be an integer value");
        assert_eq!(json["error"]["page_size"], "must be a maximum of 100");
    }

    #[tokio::test]
    async fn decode_taxonomy_reaches_the_client() {
        let ctx = TestContext::new();
        let writer = ctx.create_user("writer@example.com", true, &[COMMENTS_WRITE]).await;
        let token = Some(writer.token.as_str());
        let limit = ctx.state.config.json.max_body_bytes;

        let cases = [
            (
                r#"{"content": "x", "author": "y", "extra": 1}"#.to_string(),
                "body contains unknown key \"extra\"".to_string(),
            ),
            (
                "{}{}".to_string(),
                "the body must only contain a single JSON value".to_string(),
            ),
            (String::new(), "the body must not be empty".to_string()),
            (
                format!(r#"{{"content": "{}", "author": "y"}}"#, "a".repeat(limit)),
                format!("the body must not be larger than {limit} bytes"),
            ),
        ];

        for (body, message) in cases {
            let response = app(ctx.state.clone())
                .oneshot(json_request(Method::POST, "/v1/comments", token, &body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(response).await["error"], message.as_str());
        }
    }

    #[tokio::test]
    async fn missing_keys_are_validation_errors() {
        let ctx = TestContext::new();
        let writer = ctx.create_user("writer@example.com", true, &[COMMENTS_WRITE]).await;
        let token = Some(writer.token.as_str());

        let response = app(ctx.state.clone())
            .oneshot(json_request(Method::POST, "/v1/comments", token, r#"{"content": "x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["author"], "must be provided");
        assert!(json["error"].get("content").is_none());

        let response = app(ctx.state.clone())
            .oneshot(json_request(Method::POST, "/v1/users", None, r#"{"email": "x@example.com"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["username"], "must be provided");
        assert_eq!(json["error"]["password"], "must be provided");

        let response = app(ctx.state.clone())
            .oneshot(json_request(Method::PUT, "/v1/users/activated", None, "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["error"]["token"], "must be provided");
    }

    #[tokio::test]
    async fn authorization_runs_before_body_decoding() {
        let ctx = TestContext::new();
        let response = app(ctx.state.clone())
            .oneshot(json_request(Method::POST, "/v1/comments", None, "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["error"],
            "you must be authenticated to access this resource"
        );
    }

    #[tokio::test]
    async fn edit_conflict_is_409() {
        let ctx = TestContext::new();
        let mut comment = crate::database::models::Comment::new("a".into(), "b".into());
        ctx.store.insert_comment(&mut comment).await.unwrap();

        let mut stale = comment.clone();
        comment.content = "newer".into();
        ctx.store.update_comment(&mut comment).await.unwrap();

        stale.content = "older".into();
        let err = ctx.store.update_comment(&mut stale).await.unwrap_err();
        let response = axum::response::IntoResponse::into_response(crate::error::ApiError::from(err));
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn rate_limit_applies_before_authentication() {
        let mut config = AppConfig::default();
        config.limiter.enabled = true;
        config.limiter.rps = 0.001;
        config.limiter.burst = 2;
        let ctx = TestContext::with_config(config);

        for _ in 0..2 {
            let response = app(ctx.state.clone())
                .oneshot(empty(Method::GET, "/v1/healthcheck", None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        // even a bad token is not looked at once the bucket is empty
        let response = app(ctx.state.clone())
            .oneshot(empty(Method::GET, "/v1/healthcheck", Some("bogus")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ctx.state.limiter.client_count(), 1);
        assert!(ctx.state.limiter.bucket_info(&client_addr().ip()).is_some());
    }

    #[tokio::test]
    async fn missing_connect_info_is_a_server_error_when_limiting() {
        let mut config = AppConfig::default();
        config.limiter.enabled = true;
        let ctx = TestContext::with_config(config);

        let request = axum::http::Request::builder()
            .uri("/v1/healthcheck")
            .body(Body::empty())
            .unwrap();
        let response = app(ctx.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let request = axum::http::Request::builder()
            .uri("/v1/healthcheck")
            .extension(ConnectInfo(client_addr()))
            .body(Body::empty())
            .unwrap();
        let response = app(ctx.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn inactive_user_can_authenticate_but_not_read() {
        let ctx = TestContext::new();
        let bo = ctx.create_user("bo@example.com", false, &[COMMENTS_READ]).await;

        let response = app(ctx.state.clone())
            .oneshot(empty(Method::GET, "/v1/comments", Some(&bo.token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await["error"],
            "your user account must be activated to access this resource"
        );

        // the token itself is fine
        let user = ctx
            .state
            .tokens
            .resolve(Scope::Authentication, &bo.token)
            .await
            .unwrap();
        assert_eq!(user.id, ctx.store.get_user_by_email("bo@example.com").await.unwrap().id);
    }
}
