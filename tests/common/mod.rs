#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use comments_api::config::{AppConfig, Environment};
use comments_api::database::{MemoryStore, PermissionStore};
use comments_api::mailer::{MailError, Mailer};
use comments_api::server::serve;
use comments_api::state::AppState;

pub const PASSWORD: &str = "pa55word!";

#[derive(Debug, Clone)]
pub struct SentMail {
    pub recipient: String,
    pub template: String,
    pub data: Value,
}

/// Records every message. With a delay set, each send sleeps first so tests
/// can observe shutdown waiting on it.
#[derive(Default)]
pub struct CapturingMailer {
    delay: Option<Duration>,
    sent: Mutex<Vec<SentMail>>,
}

impl CapturingMailer {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay), sent: Mutex::new(Vec::new()) }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn activation_token_for(&self, recipient: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.recipient == recipient)
            .and_then(|m| m.data["activation_token"].as_str().map(str::to_string))
    }
}

#[async_trait]
impl Mailer for CapturingMailer {
    async fn send(&self, recipient: &str, template: &str, data: &Value) -> Result<(), MailError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().unwrap().push(SentMail {
            recipient: recipient.to_string(),
            template: template.to_string(),
            data: data.clone(),
        });
        Ok(())
    }
}

/// A server running in-process on a free local port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub base_url: String,
    pub client: reqwest::Client,
    pub store: Arc<MemoryStore>,
    pub mailer: Arc<CapturingMailer>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<io::Result<()>>,
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::for_environment(Environment::Development);
    config.limiter.enabled = false;
    config.server.shutdown_grace_secs = 5;
    config
}

impl TestServer {
    pub async fn start() -> Result<Self> {
        Self::start_with(test_config(), CapturingMailer::default()).await
    }

    pub async fn start_with(config: AppConfig, mailer: CapturingMailer) -> Result<Self> {
        let port = portpicker::pick_unused_port().context("failed to pick free port")?;
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .context("failed to bind test listener")?;
        let addr = listener.local_addr().context("listener has no address")?;
        let base_url = format!("http://{}", addr);

        let store = Arc::new(MemoryStore::new());
        let mailer = Arc::new(mailer);
        let state = AppState::new(config, store.clone(), mailer.clone());

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve(listener, state, async move {
            let _ = stopped.await;
        }));

        let server = Self {
            addr,
            base_url,
            client: reqwest::Client::new(),
            store,
            mailer,
            stop: Some(stop),
            handle,
        };
        server.wait_ready(Duration::from_secs(5)).await?;
        Ok(server)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Ok(resp) = self.client.get(self.url("/v1/healthcheck")).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("server did not become ready on {} within {:?}", self.base_url, timeout)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends the shutdown signal without waiting.
    pub fn signal_shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Signals shutdown and waits for `serve` to return.
    pub async fn shutdown(mut self) -> Result<()> {
        self.signal_shutdown();
        self.handle.await.context("server task panicked")??;
        Ok(())
    }

    pub async fn join(self) -> Result<()> {
        self.handle.await.context("server task panicked")??;
        Ok(())
    }

    /// Registers, activates and logs in a user, granting `extra` permission
    /// codes on top of the default read access. Returns the bearer token.
    pub async fn login_new_user(&self, email: &str, extra: &[&str]) -> Result<String> {
        let resp = self
            .client
            .post(self.url("/v1/users"))
            .json(&serde_json::json!({ "username": "tester", "email": email, "password": PASSWORD }))
            .send()
            .await?;
        anyhow::ensure!(resp.status() == 201, "register returned {}", resp.status());
        let body: Value = resp.json().await?;
        let user_id = body["user"]["id"].as_i64().context("user id missing")?;

        let activation = self.wait_for_activation_token(email).await?;
        let resp = self
            .client
            .put(self.url("/v1/users/activated"))
            .json(&serde_json::json!({ "token": activation }))
            .send()
            .await?;
        anyhow::ensure!(resp.status() == 200, "activate returned {}", resp.status());

        if !extra.is_empty() {
            self.store.add_permissions_for_user(user_id, extra).await?;
        }

        let resp = self
            .client
            .post(self.url("/v1/tokens/authentication"))
            .json(&serde_json::json!({ "email": email, "password": PASSWORD }))
            .send()
            .await?;
        anyhow::ensure!(resp.status() == 201, "login returned {}", resp.status());
        let body: Value = resp.json().await?;
        body["authentication_token"]["token"]
            .as_str()
            .map(str::to_string)
            .context("token missing")
    }

    async fn wait_for_activation_token(&self, email: &str) -> Result<String> {
        for _ in 0..100 {
            if let Some(token) = self.mailer.activation_token_for(email) {
                return Ok(token);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        anyhow::bail!("no welcome mail sent to {email}")
    }
}
