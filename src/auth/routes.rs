//! `/auth/*` endpoints.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::http::AppState;
use crate::observability::AUTH_TARGET;

/// Landing page after a completed login.
pub const APP_LANDING: &str = "/app/";

#[derive(Debug, Default, Deserialize)]
struct LoginQuery {
    tz: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: String,
    #[serde(default)]
    state: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/status", get(status))
        .route("/auth/login", get(login))
        .route("/auth/callback", get(callback))
        .route("/auth/logout", get(logout))
}

async fn status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.sessions.session_from_headers(&headers).await {
        Ok(_) => Json(json!({ "authenticated": true })).into_response(),
        Err(_) => ApiError::Unauthorized.into_response(),
    }
}

async fn login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
) -> Response {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let params = state
        .sessions
        .generate_login_params(query.tz.as_deref(), user_agent);
    if params.is_empty() {
        tracing::warn!(target: AUTH_TARGET, "Login without timezone or user agent");
        return ApiError::BadRequest("missing login parameters".into()).into_response();
    }
    found(state.sessions.login_url(&params))
}

async fn callback(State(state): State<AppState>, request: Request<Body>) -> Response {
    let query = Query::<CallbackQuery>::try_from_uri(request.uri())
        .map(|Query(q)| q)
        .unwrap_or_default();
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    match state
        .sessions
        .handle_callback(&query.code, &query.state, &client_addr)
        .await
    {
        Ok(set_cookie) => {
            let mut response = found(APP_LANDING.to_string());
            if let Ok(value) = set_cookie.parse() {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            response
        }
        Err(e) => {
            tracing::warn!(target: AUTH_TARGET, error = %e, "Login callback failed");
            ApiError::from(e).into_response()
        }
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let clearing = state.sessions.logout(&headers).await;
    (StatusCode::OK, [(header::SET_COOKIE, clearing)]).into_response()
}

fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}
