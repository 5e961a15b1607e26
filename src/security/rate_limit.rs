//! Named token-bucket rate limiters.
//!
//! # Responsibilities
//! - Keep one bucket per identifier (client IP, user sub, or a fixed name)
//! - Deny when the bucket is empty; refill at a constant rate up to `burst`
//! - Evict identifiers unseen for longer than the expiry window
//!
//! # Design Decisions
//! - One mutex per limiter guards the whole map; bucket math runs under it
//! - Limiters are looked up by name from a process-wide [`RateLimiters`]
//!   registry so the HTTP layer and the socket gateway share buckets

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::{LimiterConfig, RateLimitConfig};
use crate::error::ApiError;
use crate::observability::metrics;

/// Limiter applied per client IP to every HTTP request.
pub const API_LIMITER: &str = "api";
/// Limiter applied per user to socket upgrades.
pub const SOCK_LIMITER: &str = "sock";
/// Limiter reserved for demo traffic.
pub const DEMOS_LIMITER: &str = "demos";

/// A simple token bucket rate limiter.
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        // Refill tokens
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct LimitedClient {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Token-bucket limiter keyed by an arbitrary identifier.
pub struct RateLimiter {
    name: String,
    rate: f64,
    burst: f64,
    expiry: Duration,
    clients: Mutex<HashMap<String, LimitedClient>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, rate: f64, burst: u32, expiry: Duration) -> Self {
        Self {
            name: name.into(),
            rate,
            burst: burst as f64,
            expiry,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` when the request must be denied.
    pub fn limit(&self, identifier: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock();
        let client = clients
            .entry(identifier.to_string())
            .or_insert_with(|| LimitedClient {
                bucket: TokenBucket::new(self.burst),
                last_seen: now,
            });
        client.last_seen = now;

        let denied = !client.bucket.try_acquire(self.burst, self.rate);
        if denied {
            metrics::record_rate_limited(&self.name);
        }
        denied
    }

    /// Drop identifiers whose last request is older than the expiry.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, client| now.duration_since(client.last_seen) <= self.expiry);
        before - clients.len()
    }

    pub fn tracked(&self) -> usize {
        self.clients.lock().len()
    }
}

/// Process-wide registry of named limiters.
pub struct RateLimiters {
    limiters: DashMap<String, Arc<RateLimiter>>,
    expiry: Duration,
}

impl RateLimiters {
    /// Create the registry with the `api`, `sock`, and `demos` limiters.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let registry = Self {
            limiters: DashMap::new(),
            expiry: Duration::from_secs(config.expiry_secs),
        };
        registry.register(API_LIMITER, &config.api);
        registry.register(SOCK_LIMITER, &config.sock);
        registry.register(DEMOS_LIMITER, &config.demos);
        registry
    }

    /// Add (or replace) a named limiter.
    pub fn register(&self, name: &str, limits: &LimiterConfig) -> Arc<RateLimiter> {
        let limiter = Arc::new(RateLimiter::new(name, limits.rate, limits.burst, self.expiry));
        self.limiters.insert(name.to_string(), limiter.clone());
        limiter
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).map(|l| l.clone())
    }

    /// Deny when the named limiter denies; unknown names never deny.
    pub fn limit(&self, name: &str, identifier: &str) -> bool {
        self.get(name).map(|l| l.limit(identifier)).unwrap_or(false)
    }

    pub fn cleanup(&self) {
        for limiter in self.limiters.iter() {
            let evicted = limiter.cleanup();
            if evicted > 0 {
                tracing::debug!(limiter = %limiter.name(), evicted, "Evicted idle rate limit entries");
            }
        }
    }

    /// Run [`RateLimiters::cleanup`] on a fixed cadence until shutdown.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let limiters = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiters.cleanup(),
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

/// Per-IP limit applied to every request.
///
/// The client address comes from the connection; requests without one (in-process
/// tests) share the `unknown` bucket.
pub async fn ip_limit_middleware(
    State(limiters): State<Arc<RateLimiters>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if limiters.limit(API_LIMITER, &ip) {
        tracing::warn!(client = %ip, "Rate limit exceeded");
        return ApiError::TooManyRequests.into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_plus_one_denies() {
        let limiter = RateLimiter::new("t", 0.001, 3, Duration::from_secs(60));
        assert!(!limiter.limit("1.2.3.4"));
        assert!(!limiter.limit("1.2.3.4"));
        assert!(!limiter.limit("1.2.3.4"));
        assert!(limiter.limit("1.2.3.4"));
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = RateLimiter::new("t", 0.001, 1, Duration::from_secs(60));
        assert!(!limiter.limit("a"));
        assert!(limiter.limit("a"));
        assert!(!limiter.limit("b"));
    }

    #[test]
    fn test_refill_after_wait() {
        let limiter = RateLimiter::new("t", 100.0, 1, Duration::from_secs(60));
        assert!(!limiter.limit("a"));
        assert!(limiter.limit("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!limiter.limit("a"));
    }

    #[test]
    fn test_cleanup_evicts_idle_entries() {
        let limiter = RateLimiter::new("t", 1.0, 1, Duration::from_millis(10));
        limiter.limit("a");
        limiter.limit("b");
        assert_eq!(limiter.tracked(), 2);
        std::thread::sleep(Duration::from_millis(30));
        limiter.limit("b");
        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn test_registry_has_builtin_limiters() {
        let limiters = RateLimiters::from_config(&RateLimitConfig::default());
        assert!(limiters.get(API_LIMITER).is_some());
        assert!(limiters.get(SOCK_LIMITER).is_some());
        assert!(limiters.get(DEMOS_LIMITER).is_some());
        assert!(!limiters.limit("missing", "x"));
    }
}
