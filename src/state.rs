use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenService;
use crate::background::BackgroundTasks;
use crate::config::AppConfig;
use crate::database::Store;
use crate::mailer::Mailer;
use crate::middleware::RateLimiter;

/// Shared handles passed to every handler and middleware stage.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub tokens: TokenService,
    pub mailer: Arc<dyn Mailer>,
    pub tasks: BackgroundTasks,
    pub limiter: Arc<RateLimiter>,
    /// Cancelled once when the server begins shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn Store>, mailer: Arc<dyn Mailer>) -> Self {
        let limiter = Arc::new(RateLimiter::new(&config.limiter));
        Self {
            tokens: TokenService::new(store.clone()),
            config: Arc::new(config),
            store,
            mailer,
            tasks: BackgroundTasks::new(),
            limiter,
            shutdown: CancellationToken::new(),
        }
    }
}
