//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured events; access/auth/error files)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout and LOG_DIR files
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogGuards, ACCESS_TARGET, AUTH_TARGET};
