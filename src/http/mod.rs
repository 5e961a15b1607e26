//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (router assembly, global layers)
//!     → middleware/ (access log, session, role, group)
//!     → cache.rs (per-user response cache)
//!     → routing::dispatch (handler call)
//!
//! redirect.rs: plain-HTTP listener, 301 to the public host
//! ```

pub mod cache;
pub mod middleware;
pub mod redirect;
pub mod server;
mod state;

pub use server::HttpServer;
pub use state::AppState;
