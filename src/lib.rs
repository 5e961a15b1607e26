//! Session-aware API gateway library.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod kv;
pub mod lifecycle;
pub mod observability;
pub mod routing;
pub mod security;
pub mod session;
pub mod socket;
pub mod webhook;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::schema::AppConfig;
pub use error::ApiError;
pub use http::{AppState, HttpServer};
pub use lifecycle::{Application, Backends, Services, Shutdown};
