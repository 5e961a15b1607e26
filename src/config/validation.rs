//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (rates > 0, ping timeout beyond interval)
//! - Check addresses parse before any listener binds
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{AppConfig, LimiterConfig};

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Validate a loaded configuration.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("not a socket address: {}", config.listener.bind_address),
        ));
    }

    if let Some(addr) = &config.listener.redirect_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "listener.redirect_address",
                format!("not a socket address: {addr}"),
            ));
        }
    }

    if config.auth.signing_key.is_empty() {
        errors.push(ValidationError::new("auth.signing_key", "must be set"));
    }

    if url::Url::parse(&config.auth.app_host_url).is_err() {
        errors.push(ValidationError::new("auth.app_host_url", "not a URL"));
    }

    check_limiter("rate_limit.api", &config.rate_limit.api, &mut errors);
    check_limiter("rate_limit.sock", &config.rate_limit.sock, &mut errors);
    check_limiter("rate_limit.demos", &config.rate_limit.demos, &mut errors);

    let socket = &config.socket;
    if !(1..=9).contains(&socket.pad_to) {
        errors.push(ValidationError::new("socket.pad_to", "must be between 1 and 9"));
    }
    if socket.ping_timeout_secs <= socket.ping_interval_secs {
        errors.push(ValidationError::new(
            "socket.ping_timeout_secs",
            "must exceed ping_interval_secs",
        ));
    }
    if socket.handler_rate <= 0.0 || socket.handler_burst == 0 {
        errors.push(ValidationError::new("socket.handler_rate", "rate and burst must be positive"));
    }
    if socket.outbound_queue == 0 {
        errors.push(ValidationError::new("socket.outbound_queue", "must be positive"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_limiter(field: &str, limiter: &LimiterConfig, errors: &mut Vec<ValidationError>) {
    if limiter.rate <= 0.0 {
        errors.push(ValidationError::new(field, "rate must be positive"));
    }
    if limiter.burst == 0 {
        errors.push(ValidationError::new(field, "burst must be positive"));
    }
}
