//! Service routing subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     schema JSON → descriptor.rs (ServiceSchema)
//!     → options.rs (HandlerOptions per method)
//!     → registry.rs (handler lookup, 501 stubs, throttles, axum routes)
//!
//! Per request:
//!     session → cache → role → group → dispatch.rs
//!     → handler.rs (Handler::call) → response
//! ```
//!
//! # Design Decisions
//! - Endpoints are compiled once at startup; no per-request lookup by name
//! - Handlers see JSON input and a [`ReqInfo`](crate::db::ReqInfo) only;
//!   wire formats stay in the dispatcher

pub mod descriptor;
pub mod dispatch;
pub mod handler;
pub mod options;
pub mod registry;

pub use descriptor::{SchemaError, ServiceSchema};
pub use handler::{handler_fn, Handler, HandlerOutput, HandlerRegistry};
pub use options::{CacheType, HandlerOptions};
pub use registry::{Endpoint, EndpointState, ServiceRegistry};
