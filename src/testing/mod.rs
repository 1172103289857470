use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{request::Builder, Method, Request},
    response::Response,
};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use crate::auth::{Password, Scope};
use crate::config::AppConfig;
use crate::database::models::User;
use crate::database::{MemoryStore, PermissionStore, UserStore};
use crate::mailer::{render, MailError, Mailer};
use crate::state::AppState;

/// Mail captured by `RecordingMailer`.
#[derive(Debug, Clone)]
pub struct SentMail {
    pub recipient: String,
    pub template: String,
    pub data: Value,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, recipient: &str, template: &str, data: &Value) -> Result<(), MailError> {
        render(template, data)?;
        self.sent.lock().unwrap().push(SentMail {
            recipient: recipient.to_string(),
            template: template.to_string(),
            data: data.clone(),
        });
        Ok(())
    }
}

/// A stored user plus a live authentication token for it.
pub struct TestUser {
    pub user: User,
    pub token: String,
}

/// App state over an in-memory store with mail captured instead of sent.
pub struct TestContext {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub mailer: Arc<RecordingMailer>,
}

impl TestContext {
    /// Rate limiting is off unless the caller's config turns it on.
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.limiter.enabled = false;
        Self::with_config(config)
    }

    pub fn with_config(config: AppConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mailer = Arc::new(RecordingMailer::default());
        let state = AppState::new(config, store.clone(), mailer.clone());
        Self { state, store, mailer }
    }

    pub async fn create_user(&self, email: &str, activated: bool, permissions: &[&str]) -> TestUser {
        let password = Password::set("pa55word!").unwrap();
        let mut user = User::new("tester", email, password);
        user.activated = activated;
        self.store.insert_user(&mut user).await.unwrap();
        self.store
            .add_permissions_for_user(user.id, permissions)
            .await
            .unwrap();

        let token = self
            .state
            .tokens
            .issue(user.id, chrono::Duration::hours(24), Scope::Authentication)
            .await
            .unwrap();

        TestUser { user, token: token.plaintext }
    }
}

pub fn client_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 51000)
}

/// Request builder carrying the connect info the rate limiter keys on.
pub fn request(method: Method, uri: &str) -> Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .extension(ConnectInfo(client_addr()))
}

pub fn json_request(method: Method, uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = request(method, uri).header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn body_json(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}
