use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use comments_api::config::{AppConfig, Environment};
use comments_api::database::{MemoryStore, PgStore, Store};
use comments_api::mailer::{LogMailer, Mailer, SmtpMailer};
use comments_api::server::{serve, shutdown_signal};
use comments_api::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "comments-api", version, about = "Comments API server")]
struct Args {
    /// API server port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Environment preset: development, staging or production (overrides APP_ENV)
    #[arg(long)]
    env: Option<String>,

    /// Trusted CORS origins, space separated
    #[arg(long)]
    cors_trusted_origins: Option<String>,

    /// Enable or disable the per-client rate limiter
    #[arg(long)]
    limiter_enabled: Option<bool>,
}

impl Args {
    fn into_config(self) -> AppConfig {
        // presets first, environment variables on top, flags last
        let mut config = match self.env.as_deref() {
            Some(env) => AppConfig::from_env_with(Environment::parse(env)),
            None => AppConfig::from_env(),
        };

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(origins) = self.cors_trusted_origins {
            config.cors.trusted_origins = origins.split_whitespace().map(str::to_string).collect();
        }
        if let Some(enabled) = self.limiter_enabled {
            config.limiter.enabled = enabled;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so DATABASE_URL, SMTP_* etc. are picked up
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Args::parse().into_config();
    info!(environment = config.environment.as_str(), port = config.server.port, "starting comments api");

    let store: Arc<dyn Store> = match config.database.dsn.as_deref() {
        Some(dsn) => {
            let store = PgStore::connect(dsn, &config.database)
                .await
                .context("failed to connect to database")?;
            store.migrate().await.context("failed to apply migrations")?;
            Arc::new(store)
        }
        None => {
            info!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let mailer: Arc<dyn Mailer> = match config.smtp.host.as_deref() {
        Some(host) => Arc::new(SmtpMailer::new(host, &config.smtp).context("failed to configure smtp")?),
        None => {
            info!("SMTP_HOST not set, emails will only be logged");
            Arc::new(LogMailer)
        }
    };

    let bind_addr = format!("0.0.0.0:{}", config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    let state = AppState::new(config, store, mailer);
    serve(listener, state, shutdown_signal()).await?;

    Ok(())
}
