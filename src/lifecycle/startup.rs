//! Startup orchestration.
//!
//! # Responsibilities
//! - Connect the backends (identity provider, relational store, caches)
//! - Build the shared state and the service registry
//! - Start background sweeps and the optional side listeners
//! - Serve the primary listener until shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Without a database URL every store runs in process
//! - Listeners start last (traffic only when ready)

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::auth::{IdentityProvider, KeycloakProvider, ProviderError, TokenError, TokenValidator};
use crate::config::AppConfig;
use crate::db::{Database, DbError, MemoryDatabase, PgDatabase};
use crate::http::redirect::run_redirector;
use crate::http::{AppState, HttpServer};
use crate::kv::MemoryKv;
use crate::lifecycle::Shutdown;
use crate::routing::{HandlerRegistry, SchemaError, ServiceRegistry, ServiceSchema};
use crate::security::{RateLimiters, Signer, SigningError};
use crate::session::groups::DirectoryGroupSource;
use crate::session::store::PgSessionStore;
use crate::session::{GroupSource, MemorySessionStore, SessionManager, SessionStore, StaticGroupSource};
use crate::socket::gateway::register_handler_limiter;
use crate::socket::{DbSocketStore, MemorySocketStore, SocketHub, SocketStore};
use crate::webhook::{bind_socket, WebhookRegistry, WebhookServer};

const KV_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("identity provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("token validator: {0}")]
    Token(#[from] TokenError),

    #[error("database: {0}")]
    Db(#[from] DbError),

    #[error("signing key: {0}")]
    Signing(#[from] SigningError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the core talks to outside the process.
pub struct Backends {
    pub database: Arc<dyn Database>,
    pub kv: Arc<MemoryKv>,
    pub sessions: Arc<dyn SessionStore>,
    pub groups: Arc<dyn GroupSource>,
    pub sockets: Arc<dyn SocketStore>,
    pub provider: Arc<dyn IdentityProvider>,
    pub validator: Arc<TokenValidator>,
}

impl Backends {
    /// Connect to the configured provider and stores.
    pub async fn connect(config: &AppConfig) -> Result<Self, StartupError> {
        let provider = Arc::new(KeycloakProvider::new(config.auth.clone())?);
        let validator = Arc::new(TokenValidator::from_realm_key(
            &provider.realm_public_key().await?,
        )?);

        let Some(url) = config.database.url.as_deref() else {
            tracing::warn!("No database configured, using in-process stores");
            return Ok(Self::in_process(provider, validator));
        };

        let pg = PgDatabase::connect_lazy(&config.database, url)?;
        let pool = pg.pool().clone();
        let database: Arc<dyn Database> = Arc::new(pg);
        Ok(Self {
            sockets: Arc::new(DbSocketStore::new(database.clone())),
            database,
            kv: Arc::new(MemoryKv::new()),
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            groups: Arc::new(DirectoryGroupSource::new(pool, provider.clone())),
            provider,
            validator,
        })
    }

    /// In-process stores around the given provider and validator.
    pub fn in_process(provider: Arc<dyn IdentityProvider>, validator: Arc<TokenValidator>) -> Self {
        Self {
            database: Arc::new(MemoryDatabase::new()),
            kv: Arc::new(MemoryKv::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            groups: Arc::new(StaticGroupSource::new()),
            sockets: Arc::new(MemorySocketStore::open()),
            provider,
            validator,
        }
    }
}

/// Handlers supplied by the embedding application.
#[derive(Default)]
pub struct Services {
    pub handlers: HandlerRegistry,
    pub webhooks: WebhookRegistry,
}

pub struct Application {
    state: AppState,
    registry: ServiceRegistry,
    webhooks: WebhookRegistry,
    kv: Arc<MemoryKv>,
}

impl Application {
    pub fn build(config: AppConfig, backends: Backends, services: Services) -> Result<Self, StartupError> {
        let schema = match config.schema_path.as_deref() {
            Some(path) => ServiceSchema::load(Path::new(path))?,
            None => ServiceSchema::default(),
        };
        let registry = ServiceRegistry::build(&schema, &services.handlers, &config.cache.api_path)?;

        let signer = Signer::new(config.auth.signing_key.as_bytes())?;
        let sessions = Arc::new(SessionManager::new(
            config.auth.clone(),
            config.session.clone(),
            signer.clone(),
            backends.validator,
            backends.provider,
            backends.sessions,
            backends.groups,
        ));

        let limiters = Arc::new(RateLimiters::from_config(&config.rate_limit));
        register_handler_limiter(&limiters, config.socket.handler_rate, config.socket.handler_burst);
        registry.register_throttles(&limiters);

        let hub = Arc::new(SocketHub::new(config.socket.clone(), signer, backends.sockets));
        sessions.set_observer(hub.clone());

        tracing::info!(
            endpoints = registry.endpoints().len(),
            handlers = services.handlers.len(),
            webhooks = services.webhooks.len(),
            "Application built"
        );

        let state = AppState {
            config: Arc::new(config),
            sessions,
            limiters,
            database: backends.database,
            kv: backends.kv.clone(),
            hub,
        };
        Ok(Self {
            state,
            registry,
            webhooks: services.webhooks,
            kv: backends.kv,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        HttpServer::new(self.state.clone(), &self.registry).router()
    }

    /// Start background work and side listeners, then serve until shutdown.
    pub async fn run(self, listener: TcpListener, shutdown: &Shutdown) -> Result<(), StartupError> {
        let config = self.state.config.clone();

        self.state.limiters.spawn_cleanup(
            Duration::from_secs(config.rate_limit.cleanup_interval_secs.max(1)),
            shutdown.subscribe(),
        );
        self.state.sessions.spawn_temp_auth_sweep(shutdown.subscribe());
        self.kv.spawn_purge(KV_PURGE_INTERVAL, shutdown.subscribe());
        self.state.hub.spawn_ticket_sweep(
            Duration::from_secs(config.socket.ticket_ttl_secs.max(1)),
            shutdown.subscribe(),
        );

        if let Some(address) = config.listener.redirect_address.as_deref() {
            let redirect_listener = TcpListener::bind(address).await?;
            let receiver = shutdown.subscribe();
            let target = config.auth.app_host_url.clone();
            let timeout = Duration::from_secs(config.listener.redirect_timeout_secs);
            tokio::spawn(async move {
                if let Err(e) = run_redirector(redirect_listener, target, timeout, receiver).await {
                    tracing::error!(error = %e, "Redirector failed");
                }
            });
        }

        if let Some(path) = config.webhook.unix_path.as_deref() {
            let unix_listener = bind_socket(path)?;
            tracing::info!(path, "Webhook socket bound");
            let server = WebhookServer::new(self.webhooks, self.state.database.clone());
            tokio::spawn(server.run(unix_listener, shutdown.subscribe()));
        }

        HttpServer::new(self.state, &self.registry)
            .run(listener, shutdown.subscribe())
            .await?;
        Ok(())
    }
}
