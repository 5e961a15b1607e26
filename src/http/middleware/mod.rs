//! Request pipeline stages.
//!
//! # Data Flow
//! ```text
//! global:       access log → ip limit → trace → timeout → body limit
//! per endpoint: validate_session → response cache → require_role
//!               → hydrate_group → dispatch
//! ```

mod access_log;
mod session;

pub use access_log::access_log;
pub use session::{hydrate_group, require_role, validate_session};
