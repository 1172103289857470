use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LimiterConfig;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy)]
struct ClientBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Snapshot of one client's bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketInfo {
    pub tokens: f64,
    pub last_seen: Instant,
}

/// Per-client token buckets keyed by remote IP.
///
/// The table lock is held only for one lookup, refill, take or sweep and is
/// never held across an await.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    capacity: f64,
    refill_per_sec: f64,
    sweep_interval: Duration,
    idle_threshold: Duration,
    clients: Mutex<HashMap<IpAddr, ClientBucket>>,
}

impl RateLimiter {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            enabled: config.enabled,
            capacity: f64::from(config.burst),
            refill_per_sec: config.rps,
            sweep_interval: config.sweep_interval(),
            idle_threshold: config.idle_threshold(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<IpAddr, ClientBucket>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check(&self, client: IpAddr) -> bool {
        self.check_at(client, Instant::now())
    }

    /// Takes one permit from `client`'s bucket as of `now`, creating a full
    /// bucket on first sight. Returns false when the bucket is empty.
    pub fn check_at(&self, client: IpAddr, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        let mut clients = self.clients();
        let bucket = clients.entry(client).or_insert(ClientBucket {
            tokens: self.capacity,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops clients unseen for longer than the idle threshold. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut clients = self.clients();
        let before = clients.len();
        clients.retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) <= self.idle_threshold);
        before - clients.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    pub fn bucket_info(&self, client: &IpAddr) -> Option<BucketInfo> {
        self.clients().get(client).map(|b| BucketInfo {
            tokens: b.tokens,
            last_seen: b.last_seen,
        })
    }

    /// Sweeps on a fixed interval until `shutdown` is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("rate limiter sweep stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let removed = self.sweep_at(Instant::now());
                    if removed > 0 {
                        debug!(removed, remaining = self.client_count(), "swept idle rate limiter clients");
                    }
                }
            }
        }
    }
}

/// Rejects requests from clients that have exhausted their bucket.
///
/// A missing `ConnectInfo` means the server was not started with connect
/// info and is reported as a server error.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !limiter.is_enabled() {
        return Ok(next.run(request).await);
    }

    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .ok_or_else(|| ApiError::internal("remote address missing from request"))?;

    if !limiter.check(client) {
        warn!(client = %client, "rate limit exceeded");
        return Err(ApiError::RateLimitExceeded);
    }

    Ok(next.run(request).await)
}
