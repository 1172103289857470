pub mod templates;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SmtpConfig;
pub use templates::{render, RenderedMail, USER_WELCOME};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("unknown mail template: {0}")]
    UnknownTemplate(String),

    #[error("template {template} needs field {field}")]
    MissingField { template: &'static str, field: &'static str },

    #[error("invalid address: {0}")]
    Address(String),

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("smtp delivery failed: {0}")]
    Transport(String),
}

/// Outbound mail delivery.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipient: &str, template: &str, data: &Value) -> Result<(), MailError>;
}

/// Fixed-delay retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SmtpConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
        }
    }

    /// Calls `op` until it succeeds or attempts run out, sleeping `backoff`
    /// between attempts. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "attempt failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub struct SmtpMailer {
    transport: SmtpTransport,
    sender: String,
    retry: RetryPolicy,
}

impl SmtpMailer {
    pub fn new(host: &str, config: &SmtpConfig) -> Result<Self, MailError> {
        let mut builder = SmtpTransport::starttls_relay(host)
            .map_err(|e| MailError::Transport(e.to_string()))?
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        info!(host, port = config.port, "smtp mailer initialized");

        Ok(Self {
            transport: builder.build(),
            sender: config.sender.clone(),
            retry: RetryPolicy::from_config(config),
        })
    }

    fn build_message(&self, recipient: &str, mail: RenderedMail) -> Result<Message, MailError> {
        Message::builder()
            .from(self.sender.parse().map_err(|e: lettre::address::AddressError| MailError::Address(e.to_string()))?)
            .to(recipient.parse().map_err(|e: lettre::address::AddressError| MailError::Address(e.to_string()))?)
            .subject(mail.subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(mail.plain),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(mail.html),
                    ),
            )
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, recipient: &str, template: &str, data: &Value) -> Result<(), MailError> {
        let message = self.build_message(recipient, render(template, data)?)?;

        self.retry
            .run(|_| {
                // SmtpTransport is blocking
                let transport = self.transport.clone();
                let message = message.clone();
                async move {
                    tokio::task::spawn_blocking(move || transport.send(&message))
                        .await
                        .map_err(|e| MailError::Transport(e.to_string()))?
                        .map(|_| ())
                        .map_err(|e| MailError::Transport(e.to_string()))
                }
            })
            .await?;

        info!(to = %recipient, template, "email sent");
        Ok(())
    }
}

/// Renders and logs mail instead of delivering it. Used when no SMTP host is configured.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, recipient: &str, template: &str, data: &Value) -> Result<(), MailError> {
        let mail = render(template, data)?;
        info!(to = %recipient, subject = %mail.subject, "smtp not configured, email logged only");
        Ok(())
    }
}
