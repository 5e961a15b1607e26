//! Structured logging.
//!
//! # Responsibilities
//! - Install the global `tracing` subscriber
//! - Route the `access` and `auth` targets to their own files
//! - Collect every warning and error into one error log
//!
//! # Design Decisions
//! - Stdout honours `RUST_LOG`, falling back to the configured level
//! - File layers carry their own filters, so `RUST_LOG` never hides an
//!   access or auth line
//! - File writers are non-blocking; the returned guards must live as long
//!   as the process or buffered lines are lost

use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::ObservabilityConfig;

/// Target of the one-line-per-request access log.
pub const ACCESS_TARGET: &str = "access";

/// Target of login, callback, and role-denial events.
pub const AUTH_TARGET: &str = "auth";

/// Keeps the background log writers alive.
#[must_use = "dropping the guards stops file logging"]
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

pub fn init_logging(config: &ObservabilityConfig) -> Result<LogGuards, Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},{}=info,{}=info", config.log_level, ACCESS_TARGET, AUTH_TARGET)));

    let stdout = fmt::layer().with_target(true).with_filter(env_filter);

    let mut guards = Vec::new();
    let files = match config.log_dir.as_deref() {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (access, guard) = file_writer(dir, &config.access_log);
            guards.push(guard);
            let (auth, guard) = file_writer(dir, &config.auth_log);
            guards.push(guard);
            let (errors, guard) = file_writer(dir, &config.error_log);
            guards.push(guard);

            let access_layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(access)
                .with_filter(Targets::new().with_target(ACCESS_TARGET, LevelFilter::INFO));
            let auth_layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(auth)
                .with_filter(Targets::new().with_target(AUTH_TARGET, LevelFilter::INFO));
            let error_layer = fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(errors)
                .with_filter(LevelFilter::WARN);

            Some(access_layer.and_then(auth_layer).and_then(error_layer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stdout)
        .with(files)
        .try_init()?;

    if let Some(dir) = config.log_dir.as_deref() {
        tracing::info!(log_dir = %dir, "File logging enabled");
    }

    Ok(LogGuards { _guards: guards })
}

fn file_writer(dir: &str, file_name: &str) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::NEVER, Path::new(dir), file_name);
    tracing_appender::non_blocking(appender)
}
