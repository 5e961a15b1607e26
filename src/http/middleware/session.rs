//! Session-bearing stages: resolve the session, check the site role, bind
//! the group.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ApiError;
use crate::http::AppState;
use crate::observability::AUTH_TARGET;
use crate::routing::EndpointState;
use crate::session::ConcurrentUserSession;

/// Resolve the session behind the cookie (refreshing it when due) and attach
/// it to the request. 401 when there is none.
pub async fn validate_session(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match state.sessions.session_from_headers(request.headers()).await {
        Ok(session) => {
            request.extensions_mut().insert(session);
            next.run(request).await
        }
        Err(e) => {
            tracing::debug!(target: AUTH_TARGET, error = %e, "Session rejected");
            ApiError::Unauthorized.into_response()
        }
    }
}

/// 403 unless the session's role mask carries the endpoint's site role.
pub async fn require_role(
    State(ctx): State<EndpointState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let role = ctx.endpoint.options.site_role;
    let Some(session) = request.extensions().get::<Arc<ConcurrentUserSession>>() else {
        return ApiError::Unauthorized.into_response();
    };

    if !role.allowed_by(session.role_bits()) {
        tracing::warn!(
            target: AUTH_TARGET,
            user_sub = %session.user_sub(),
            role = %role,
            pattern = %ctx.endpoint.options.pattern,
            "Site role check failed"
        );
        return ApiError::Forbidden.into_response();
    }

    next.run(request).await
}

/// Make sure the session's group binding is present and current.
pub async fn hydrate_group(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(session) = request.extensions().get::<Arc<ConcurrentUserSession>>().cloned() else {
        return ApiError::Unauthorized.into_response();
    };

    if let Err(e) = state.sessions.hydrate_group(&session).await {
        tracing::error!(user_sub = %session.user_sub(), error = %e, "Group hydration failed");
        return ApiError::from(e).into_response();
    }

    next.run(request).await
}
