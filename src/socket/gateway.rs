//! WebSocket upgrade and per-connection loop.
//!
//! # Data Flow
//! ```text
//! GET /api/v1/sock/ticket (session) → hub.issue_ticket
//! GET /sock?ticket=… → redeem → sock limiter → session → 101
//!     → writer task  (outbound queue → sink)
//!     → reader task  (stream → frames / errors)
//!     → main loop    (ping ticker | frames | errors)
//!         → per-user handler limiter → router (own task, deadline)
//! ```
//!
//! # Design Decisions
//! - Any inbound traffic counts as liveness; the ticker closes the socket
//!   once nothing has arrived for the ping timeout
//! - A frame that fails to decode ends the connection
//! - Route tasks belong to their connection and are aborted before teardown

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
    Extension, Json,
};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::LimiterConfig;
use crate::error::ApiError;
use crate::http::AppState;
use crate::security::rate_limit::SOCK_LIMITER;
use crate::security::RateLimiters;
use crate::session::ConcurrentUserSession;
use crate::socket::hub::{Connection, SocketHub};
use crate::socket::router::{route, route_deadline};

/// Per-user limiter applied to inbound frames.
pub const SOCK_HANDLER_LIMITER: &str = "sock_handler";

/// Register the frame limiter sized from the socket settings.
pub fn register_handler_limiter(limiters: &RateLimiters, rate: f64, burst: u32) {
    limiters.register(SOCK_HANDLER_LIMITER, &LimiterConfig { rate, burst });
}

#[derive(Debug, Default, Deserialize)]
pub struct TicketQuery {
    #[serde(default)]
    ticket: String,
}

/// Mint a single-use ticket for the caller's next socket.
pub async fn ticket_handler(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<ConcurrentUserSession>>,
) -> Response {
    let ticket = state.hub.issue_ticket(&session.user_sub());
    Json(json!({ "ticket": ticket })).into_response()
}

pub async fn sock_handler(
    State(state): State<AppState>,
    Query(query): Query<TicketQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let (user_sub, conn_id) = match state.hub.redeem_ticket(&query.ticket) {
        Ok(redeemed) => redeemed,
        Err(e) => {
            tracing::warn!(target: crate::observability::AUTH_TARGET, error = %e, "Socket ticket rejected");
            return ApiError::Unauthorized.into_response();
        }
    };

    if state.limiters.limit(SOCK_LIMITER, &user_sub) {
        tracing::warn!(user_sub = %user_sub, "Socket upgrade rate limited");
        return ApiError::TooManyRequests.into_response();
    }

    let session = match state.sessions.session_for_sub(&user_sub).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(target: crate::observability::AUTH_TARGET, user_sub = %user_sub, error = %e, "No session for socket");
            return ApiError::Unauthorized.into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let hub = state.hub.clone();
    let limiters = state.limiters.clone();
    upgrade
        .max_message_size(hub.config().max_message_bytes)
        .on_upgrade(move |socket| async move {
            let (tx, rx) = mpsc::channel(hub.config().outbound_queue);
            let connection = Arc::new(Connection::new(&user_sub, &conn_id, session, tx));
            if let Err(e) = hub.register(connection.clone()).await {
                tracing::error!(socket_id = %connection.socket_id, error = %e, "Failed to register socket");
                return;
            }
            run_connection(hub, limiters, connection, rx, socket).await;
        })
}

enum Inbound {
    Frame(Vec<u8>),
    Alive,
}

async fn run_connection(
    hub: Arc<SocketHub>,
    limiters: Arc<RateLimiters>,
    connection: Arc<Connection>,
    mut outbound: mpsc::Receiver<Message>,
    socket: WebSocket,
) {
    let socket_id = connection.socket_id.clone();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let (frames_tx, mut frames) = mpsc::channel::<Inbound>(64);
    let (errors_tx, mut errors) = mpsc::channel::<axum::Error>(1);
    let reader = tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            let inbound = match result {
                Ok(Message::Text(text)) => Inbound::Frame(text.as_str().as_bytes().to_vec()),
                Ok(Message::Binary(data)) => Inbound::Frame(data.to_vec()),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Inbound::Alive,
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    let _ = errors_tx.send(e).await;
                    break;
                }
            };
            if frames_tx.send(inbound).await.is_err() {
                break;
            }
        }
    });

    let config = hub.config().clone();
    let ping_timeout = Duration::from_secs(config.ping_timeout_secs);
    let deadline = route_deadline(config.route_deadline_ms);
    let mut ticker = tokio::time::interval(Duration::from_secs(config.ping_interval_secs));
    ticker.tick().await;
    let mut last_seen = Instant::now();
    let mut routes = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if last_seen.elapsed() > ping_timeout {
                    tracing::debug!(socket_id = %socket_id, "Socket ping timeout");
                    break;
                }
                connection.push(Message::Ping(Default::default()));
            }
            inbound = frames.recv() => {
                let data = match inbound {
                    None => break,
                    Some(Inbound::Alive) => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Some(Inbound::Frame(data)) => data,
                };
                last_seen = Instant::now();

                if limiters.limit(SOCK_HANDLER_LIMITER, &connection.user_sub) {
                    continue;
                }

                let message = match hub.codec().decode(&data) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(socket_id = %socket_id, error = %e, "Closing socket on bad frame");
                        break;
                    }
                };

                let hub = hub.clone();
                let connection = connection.clone();
                routes.spawn(async move {
                    let action = message.action;
                    match tokio::time::timeout(deadline, route(&hub, &connection, message)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::error!(socket_id = %connection.socket_id, ?action, error = %e, "Socket route failed"),
                        Err(_) => tracing::warn!(socket_id = %connection.socket_id, ?action, "Socket route deadline exceeded"),
                    }
                });
            }
            Some(e) = errors.recv() => {
                tracing::debug!(socket_id = %socket_id, error = %e, "Socket read error");
                break;
            }
            Some(_) = routes.join_next(), if !routes.is_empty() => {}
        }
    }

    reader.abort();
    // No route may outlive the teardown below.
    routes.abort_all();
    while routes.join_next().await.is_some() {}
    hub.teardown(&socket_id).await;
    writer.abort();
}
