//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (per-IP token bucket, 429 on deny)
//!     → signing.rs (verify session cookie / socket ticket)
//!     → roles.rs (site-role mask check)
//!     → Pass to routing
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any security check failure
//! - No trust in client input; signatures are compared in constant time

pub mod cookies;
pub mod rate_limit;
pub mod roles;
pub mod signing;

pub use rate_limit::{RateLimiter, RateLimiters};
pub use roles::SiteRole;
pub use signing::{Signer, SigningError};
