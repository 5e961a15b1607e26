//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files; every
//! section carries defaults so a missing file still yields a runnable config.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Listener configuration (bind addresses, timeouts).
    pub listener: ListenerConfig,

    /// Identity provider and cookie settings.
    pub auth: AuthConfig,

    /// Named rate limiters.
    pub rate_limit: RateLimitConfig,

    /// Session cache timings.
    pub session: SessionConfig,

    /// WebSocket gateway settings.
    pub socket: SocketConfig,

    /// HTTP response cache settings.
    pub cache: CacheConfig,

    /// Identity provider webhook socket.
    pub webhook: WebhookConfig,

    /// Relational store.
    pub database: DatabaseConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Path to the service schema (JSON).
    pub schema_path: Option<String>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address for the primary server (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional plain-HTTP listener that redirects to `app_host_url`.
    pub redirect_address: Option<String>,

    /// Request timeout for the primary server.
    pub request_timeout_secs: u64,

    /// Read/write deadline on the redirector.
    pub redirect_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            redirect_address: None,
            request_timeout_secs: 30,
            redirect_timeout_secs: 5,
        }
    }
}

/// Identity provider configuration.
///
/// Field names mirror the environment variables that override them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Public base URL of the application (APP_HOST_URL).
    pub app_host_url: String,

    /// OIDC client id (KC_USER_CLIENT).
    pub client_id: String,

    /// OIDC client secret (KC_USER_CLIENT_SECRET).
    pub client_secret: String,

    /// Realm name (KC_REALM).
    pub realm: String,

    /// Internal base URL of the provider (KC_INTERNAL).
    pub internal_url: String,

    /// Token endpoint (KC_OPENID_TOKEN_URL).
    pub token_url: String,

    /// Authorization endpoint (KC_OPENID_AUTH_URL).
    pub auth_url: String,

    /// HMAC key for signed cookies and tickets (SIGNING_KEY).
    pub signing_key: String,

    /// Scopes requested at login.
    pub scope: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            app_host_url: "https://localhost:8080".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            realm: String::new(),
            internal_url: "http://localhost:8180".to_string(),
            token_url: String::new(),
            auth_url: String::new(),
            signing_key: String::new(),
            scope: "openid profile email groups".to_string(),
        }
    }
}

impl AuthConfig {
    /// Realm issuer URL on the internal network.
    pub fn realm_url(&self) -> String {
        format!("{}/realms/{}", self.internal_url.trim_end_matches('/'), self.realm)
    }

    /// Callback registered with the provider.
    pub fn redirect_uri(&self) -> String {
        format!("{}/auth/callback", self.app_host_url.trim_end_matches('/'))
    }
}

/// Parameters for a single token-bucket limiter.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LimiterConfig {
    /// Tokens added per second.
    pub rate: f64,

    /// Bucket capacity.
    pub burst: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 20,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether the IP limiter runs on every request.
    pub enabled: bool,

    /// Limiter applied per client IP (RATE_LIMIT, RATE_LIMIT_BURST).
    pub api: LimiterConfig,

    /// Limiter applied per user to socket upgrades.
    pub sock: LimiterConfig,

    /// Limiter reserved for demo traffic.
    pub demos: LimiterConfig,

    /// Cadence of the idle-entry sweep.
    pub cleanup_interval_secs: u64,

    /// Entries unseen for this long are evicted.
    pub expiry_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api: LimiterConfig::default(),
            sock: LimiterConfig { rate: 5.0, burst: 5 },
            demos: LimiterConfig { rate: 0.5, burst: 5 },
            cleanup_interval_secs: 60,
            expiry_secs: 180,
        }
    }
}

/// Session timings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a pending login (state + verifier).
    pub temp_auth_ttl_secs: u64,

    /// Refresh when the access token expires within this window.
    pub refresh_skew_secs: u64,

    /// Cadence of the temp-auth sweep.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            temp_auth_ttl_secs: 600,
            refresh_skew_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

/// WebSocket gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Width of each decimal length prefix.
    pub pad_to: usize,

    /// Largest accepted frame in bytes.
    pub max_message_bytes: usize,

    /// Interval between ping probes.
    pub ping_interval_secs: u64,

    /// Silence after which a connection is closed.
    pub ping_timeout_secs: u64,

    /// Per-user message rate (sockHandlerLimit).
    pub handler_rate: f64,

    /// Per-user message burst (sockHandlerBurst).
    pub handler_burst: u32,

    /// Outbound frames buffered per connection before drops.
    pub outbound_queue: usize,

    /// Lifetime of an unclaimed ticket.
    pub ticket_ttl_secs: u64,

    /// Upper bound on a single router dispatch.
    pub route_deadline_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            pad_to: 5,
            max_message_bytes: 64 * 1024,
            ping_interval_secs: 30,
            ping_timeout_secs: 90,
            handler_rate: 10.0,
            handler_burst: 20,
            outbound_queue: 256,
            ticket_ttl_secs: 30,
            route_deadline_ms: 5_000,
        }
    }
}

/// HTTP response cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when an endpoint does not set one.
    pub default_duration_secs: u64,

    /// Prefix stripped from URLs when forming cache keys.
    pub api_path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: 180,
            api_path: "/api".to_string(),
        }
    }
}

/// Webhook listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    /// Unix socket path (UNIX_PATH). Disabled when unset.
    pub unix_path: Option<String>,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection string (DATABASE_URL). In-process stores are used when unset.
    pub url: Option<String>,

    /// Pool size.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for log files (LOG_DIR). Stdout only when unset.
    pub log_dir: Option<String>,

    /// Access log file name (ACCESS_LOG).
    pub access_log: String,

    /// Auth event log file name (AUTH_LOG).
    pub auth_log: String,

    /// Warning and error log file name (ERROR_LOG).
    pub error_log: String,

    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,

    /// Metrics endpoint address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            access_log: "access.log".to_string(),
            auth_log: "auth.log".to_string(),
            error_log: "errors.log".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
