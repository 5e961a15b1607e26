//! Shared application state handed to every handler and middleware.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::Database;
use crate::kv::KeyValueStore;
use crate::security::RateLimiters;
use crate::session::SessionManager;
use crate::socket::SocketHub;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionManager>,
    pub limiters: Arc<RateLimiters>,
    pub database: Arc<dyn Database>,
    pub kv: Arc<dyn KeyValueStore>,
    pub hub: Arc<SocketHub>,
}
