use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub limiter: LimiterConfig,
    pub json: JsonConfig,
    pub smtp: SmtpConfig,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        match value {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub read_timeout_secs: u64,
    /// Upper bound on waiting for in-flight requests after a shutdown signal.
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub dsn: Option<String>,
    pub max_connections: u32,
    pub connection_timeout_secs: u64,
    pub query_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub enabled: bool,
    pub rps: f64,
    pub burst: u32,
    pub sweep_interval_secs: u64,
    pub idle_threshold_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonConfig {
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub sender: String,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub trusted_origins: Vec<String>,
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl DatabaseConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl LimiterConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }
}

impl SmtpConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = env::var("APP_ENV")
            .map(|v| Environment::parse(&v))
            .unwrap_or(Environment::Development);

        // Set defaults based on environment, then override with specific env vars
        Self::for_environment(environment).with_env_overrides()
    }

    /// Like `from_env`, but with the preset chosen by the caller.
    pub fn from_env_with(environment: Environment) -> Self {
        Self::for_environment(environment).with_env_overrides()
    }

    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
    }

    fn with_env_overrides(mut self) -> Self {
        // Server overrides
        if let Ok(v) = env::var("PORT") {
            self.server.port = v.parse().unwrap_or(self.server.port);
        }
        if let Ok(v) = env::var("SERVER_SHUTDOWN_GRACE_SECS") {
            self.server.shutdown_grace_secs = v.parse().unwrap_or(self.server.shutdown_grace_secs);
        }

        // Database overrides
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.dsn = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_QUERY_TIMEOUT_MS") {
            self.database.query_timeout_ms = v.parse().unwrap_or(self.database.query_timeout_ms);
        }

        // Limiter overrides
        if let Ok(v) = env::var("LIMITER_ENABLED") {
            self.limiter.enabled = v.parse().unwrap_or(self.limiter.enabled);
        }
        if let Ok(v) = env::var("LIMITER_RPS") {
            self.limiter.rps = v.parse().unwrap_or(self.limiter.rps);
        }
        if let Ok(v) = env::var("LIMITER_BURST") {
            self.limiter.burst = v.parse().unwrap_or(self.limiter.burst);
        }
        if let Ok(v) = env::var("LIMITER_SWEEP_INTERVAL_SECS") {
            self.limiter.sweep_interval_secs = v.parse().unwrap_or(self.limiter.sweep_interval_secs);
            self.limiter.idle_threshold_secs = 3 * self.limiter.sweep_interval_secs;
        }

        // JSON overrides
        if let Ok(v) = env::var("JSON_MAX_BODY_BYTES") {
            self.json.max_body_bytes = v.parse().unwrap_or(self.json.max_body_bytes);
        }

        // SMTP overrides
        if let Ok(v) = env::var("SMTP_HOST") {
            self.smtp.host = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Ok(v) = env::var("SMTP_PORT") {
            self.smtp.port = v.parse().unwrap_or(self.smtp.port);
        }
        if let Ok(v) = env::var("SMTP_USERNAME") {
            self.smtp.username = v;
        }
        if let Ok(v) = env::var("SMTP_PASSWORD") {
            self.smtp.password = v;
        }
        if let Ok(v) = env::var("SMTP_SENDER") {
            self.smtp.sender = v;
        }

        // CORS overrides (space separated)
        if let Ok(v) = env::var("CORS_TRUSTED_ORIGINS") {
            self.cors.trusted_origins = v.split_whitespace().map(str::to_string).collect();
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            server: ServerConfig {
                port: 4000,
                read_timeout_secs: 5,
                shutdown_grace_secs: 30,
            },
            database: DatabaseConfig {
                dsn: None,
                max_connections: 10,
                connection_timeout_secs: 5,
                query_timeout_ms: 3_000,
            },
            limiter: LimiterConfig {
                enabled: true,
                rps: 2.0,
                burst: 5,
                sweep_interval_secs: 60,
                idle_threshold_secs: 180,
            },
            json: JsonConfig {
                max_body_bytes: 256_000,
            },
            smtp: SmtpConfig {
                host: None,
                port: 25,
                username: String::new(),
                password: String::new(),
                sender: "Comments Community <no-reply@comments.example.com>".to_string(),
                max_attempts: 3,
                backoff_ms: 500,
                timeout_secs: 5,
            },
            cors: CorsConfig {
                trusted_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ],
            },
        }
    }

    fn staging() -> Self {
        let mut config = Self::development();
        config.environment = Environment::Staging;
        config.database.max_connections = 20;
        config.limiter.rps = 4.0;
        config.limiter.burst = 8;
        config.cors.trusted_origins = vec!["https://staging.example.com".to_string()];
        config
    }

    fn production() -> Self {
        let mut config = Self::development();
        config.environment = Environment::Production;
        config.database.max_connections = 50;
        config.limiter.rps = 4.0;
        config.limiter.burst = 10;
        config.cors.trusted_origins = vec!["https://app.example.com".to_string()];
        config
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::development()
    }
}
