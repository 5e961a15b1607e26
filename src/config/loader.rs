//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use crate::config::schema::AppConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Env { name: String, value: String },
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Env { name, value } => {
                write!(f, "Invalid value for {}: {:?}", name, value)
            }
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load configuration from an optional TOML file, apply environment
/// overrides, and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        }
        None => AppConfig::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Overlay environment variables onto a parsed config.
///
/// `lookup` abstracts the process environment so tests can inject values.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let text = |name: &str, slot: &mut String| {
        if let Some(value) = lookup(name) {
            *slot = value;
        }
    };

    text("APP_HOST_URL", &mut config.auth.app_host_url);
    text("KC_USER_CLIENT", &mut config.auth.client_id);
    text("KC_USER_CLIENT_SECRET", &mut config.auth.client_secret);
    text("KC_REALM", &mut config.auth.realm);
    text("KC_INTERNAL", &mut config.auth.internal_url);
    text("KC_OPENID_TOKEN_URL", &mut config.auth.token_url);
    text("KC_OPENID_AUTH_URL", &mut config.auth.auth_url);
    text("SIGNING_KEY", &mut config.auth.signing_key);
    text("ACCESS_LOG", &mut config.observability.access_log);
    text("AUTH_LOG", &mut config.observability.auth_log);
    text("ERROR_LOG", &mut config.observability.error_log);

    if let Some(path) = lookup("UNIX_PATH") {
        config.webhook.unix_path = Some(path);
    }
    if let Some(dir) = lookup("LOG_DIR") {
        config.observability.log_dir = Some(dir);
    }
    if let Some(url) = lookup("DATABASE_URL") {
        config.database.url = Some(url);
    }

    if let Some(value) = lookup("RATE_LIMIT") {
        config.rate_limit.api.rate = value.parse().map_err(|_| ConfigError::Env {
            name: "RATE_LIMIT".to_string(),
            value: value.clone(),
        })?;
    }
    if let Some(value) = lookup("RATE_LIMIT_BURST") {
        config.rate_limit.api.burst = value.parse().map_err(|_| ConfigError::Env {
            name: "RATE_LIMIT_BURST".to_string(),
            value: value.clone(),
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_env_overrides_replace_file_values() {
        let mut config = AppConfig::default();
        let env: HashMap<&str, &str> = [
            ("APP_HOST_URL", "https://book.example.com"),
            ("KC_REALM", "tenants"),
            ("RATE_LIMIT", "2.5"),
            ("RATE_LIMIT_BURST", "7"),
            ("UNIX_PATH", "/tmp/auth.sock"),
        ]
        .into_iter()
        .collect();

        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.auth.app_host_url, "https://book.example.com");
        assert_eq!(config.auth.realm, "tenants");
        assert_eq!(config.rate_limit.api.rate, 2.5);
        assert_eq!(config.rate_limit.api.burst, 7);
        assert_eq!(config.webhook.unix_path.as_deref(), Some("/tmp/auth.sock"));
    }

    #[test]
    fn test_database_and_log_sections_override() {
        use crate::config::{DatabaseConfig, ObservabilityConfig};

        let mut config = AppConfig {
            database: DatabaseConfig {
                max_connections: 4,
                ..Default::default()
            },
            observability: ObservabilityConfig::default(),
            ..Default::default()
        };
        apply_env_overrides(&mut config, |k| match k {
            "DATABASE_URL" => Some("postgres://app@db/slots".to_string()),
            "LOG_DIR" => Some("/var/log/slotgate".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.database.url.as_deref(), Some("postgres://app@db/slots"));
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.observability.log_dir.as_deref(), Some("/var/log/slotgate"));
    }

    #[test]
    fn test_bad_numeric_env_is_rejected() {
        let mut config = AppConfig::default();
        let result = apply_env_overrides(&mut config, |k| {
            (k == "RATE_LIMIT_BURST").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn test_parse_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[listener]
bind_address = "127.0.0.1:9000"

[socket]
pad_to = 6
"#
        )
        .unwrap();

        let content = fs::read_to_string(file.path()).unwrap();
        let config: AppConfig = toml::from_str(&content).unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:9000");
        assert_eq!(config.socket.pad_to, 6);
        assert_eq!(config.socket.ping_interval_secs, 30);
    }
}
