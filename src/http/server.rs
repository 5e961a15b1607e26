//! HTTP server setup.
//!
//! # Responsibilities
//! - Assemble the router: `/auth/*`, `/sock`, the socket ticket route, and
//!   every endpoint of the service registry
//! - Wire the global layers: access log, per-IP limit, request tracing,
//!   timeout and body limit
//! - Serve with client addresses attached until shutdown

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::auth;
use crate::http::middleware::{access_log, validate_session};
use crate::http::AppState;
use crate::routing::dispatch::MULTIPART_BODY_LIMIT;
use crate::routing::ServiceRegistry;
use crate::security::rate_limit::ip_limit_middleware;
use crate::socket::{sock_handler, ticket_handler};

/// Route of the socket ticket endpoint.
pub const SOCK_TICKET_PATH: &str = "/api/v1/sock/ticket";

pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(state: AppState, registry: &ServiceRegistry) -> Self {
        Self {
            router: Self::build_router(state, registry),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(state: AppState, registry: &ServiceRegistry) -> Router {
        let request_timeout = Duration::from_secs(state.config.listener.request_timeout_secs);

        let ticket = get(ticket_handler).layer(from_fn_with_state(state.clone(), validate_session));

        Router::new()
            .merge(auth::routes::routes())
            .route("/sock", get(sock_handler))
            .route(SOCK_TICKET_PATH, ticket)
            .with_state(state.clone())
            .merge(registry.router(state.clone()))
            .layer(RequestBodyLimitLayer::new(MULTIPART_BODY_LIMIT))
            .layer(TimeoutLayer::new(request_timeout))
            .layer(TraceLayer::new_for_http())
            .layer(from_fn_with_state(state.limiters.clone(), ip_limit_middleware))
            .layer(from_fn(access_log))
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
