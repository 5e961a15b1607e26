//! Session subsystem.
//!
//! # Data Flow
//! ```text
//! callback → token validation → manager.store_session
//!     → groups.rs (group + sub-group snapshot, singleflight)
//!     → store.rs (INSERT / UPDATE row)
//!     → cache.rs (publish by id, index by sub)
//!
//! request → manager.session_from_headers (cache, else store + forced refresh)
//!     → manager.check_session_expiry (refresh near expiry or on stale group version)
//! ```
//!
//! # Design Decisions
//! - Sessions are shared as `Arc<ConcurrentUserSession>`; a refresh replaces the
//!   contents under the write lock so every holder sees the new snapshot
//! - Group invalidation is a version vector, not a broadcast: peers notice the
//!   bump on their next request

pub mod cache;
pub mod groups;
pub mod manager;
pub mod store;
pub mod types;

use thiserror::Error;

use crate::auth::{ProviderError, TokenError};
use crate::error::ApiError;

pub use cache::SessionCache;
pub use groups::{GroupSource, StaticGroupSource};
pub use manager::{RoleChangeObserver, SessionManager, SESSION_COOKIE};
pub use store::{MemorySessionStore, SessionStore, StoreError};
pub use types::{CachedGroup, CachedSubGroup, ConcurrentUserSession, UserSession};

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("no session")]
    NoSession,

    #[error("invalid state")]
    InvalidState,

    #[error("session has no refresh token")]
    NoRefreshToken,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("group lookup failed: {0}")]
    Group(String),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidState => ApiError::InvalidState,
            SessionError::NoSession
            | SessionError::NoRefreshToken
            | SessionError::Token(_)
            | SessionError::Provider(_) => ApiError::Unauthorized,
            SessionError::Store(_) | SessionError::Group(_) => ApiError::internal(err),
        }
    }
}
