//! HTTP-facing error taxonomy.
//!
//! Every failure that reaches a client is an [`ApiError`]. Module-level errors
//! convert into it with `From`, and [`ApiError::into_response`] decides the
//! status code and how much detail the client sees.
//!
//! Handlers signal a user-presentable failure with [`ApiError::user`], which
//! wraps the text in [`USER_ERROR_SENTINEL`] markers. The markers survive being
//! formatted into outer error messages, so the final response can still carve
//! the user text back out of an otherwise internal error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

/// Marker pair delimiting user-facing text inside an error message.
pub const USER_ERROR_SENTINEL: &str = "ERROR_FOR_USER";

/// Body used for 5xx responses that carry no user-facing text.
pub const DEFAULT_ERROR_MESSAGE: &str = "An error occurred. Please try again later or contact your administrator with the request id provided.";

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Body, query, or path could not be parsed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// No session, or the session could not be refreshed.
    #[error("Unauthorized")]
    Unauthorized,

    /// The session lacks the endpoint's site role.
    #[error("Forbidden")]
    Forbidden,

    /// A rate limiter denied the request.
    #[error("Too many requests")]
    TooManyRequests,

    /// Failure whose message is meant for the end user.
    #[error("{}{}{}", USER_ERROR_SENTINEL, .0, USER_ERROR_SENTINEL)]
    User(String),

    /// Database, provider, or panic.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Conditional GET matched.
    #[error("Not modified")]
    NotModified,

    /// Callback `state` unknown or expired.
    #[error("Invalid state")]
    InvalidState,

    /// Endpoint declared but without a registered handler.
    #[error("Not implemented")]
    NotImplemented,
}

impl ApiError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::InvalidState => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::User(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotModified => StatusCode::NOT_MODIFIED,
            ApiError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Build the client response for a failed handler call, tagging it with
    /// `request_id` so the matching log line can be found.
    pub fn into_request_response(self, request_id: &Uuid) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::BadRequest(_) | ApiError::User(_) | ApiError::Internal(_) => {
                let text = self.to_string();
                let message = extract_user_message(&text).unwrap_or(DEFAULT_ERROR_MESSAGE);
                format!("Request Id: {request_id}\n{message}")
            }
            _ => return self.into_response(),
        };
        (status, body).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::NotModified => status.into_response(),
            ApiError::TooManyRequests => {
                (status, "Too many requests. Please retry later.").into_response()
            }
            ApiError::BadRequest(_) | ApiError::User(_) | ApiError::Internal(_) => {
                self.into_request_response(&Uuid::new_v4())
            }
            _ => (status, status.canonical_reason().unwrap_or_default()).into_response(),
        }
    }
}

/// Return the text between the first pair of sentinels in `message`.
pub fn extract_user_message(message: &str) -> Option<&str> {
    let start = message.find(USER_ERROR_SENTINEL)? + USER_ERROR_SENTINEL.len();
    let rest = &message[start..];
    let end = rest.find(USER_ERROR_SENTINEL)?;
    Some(rest[..end].trim())
}
