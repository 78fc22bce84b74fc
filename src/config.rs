//! Server configuration loaded from the environment.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::{StorageBackend, StorageConfig};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Top-level server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub storage: StorageConfig,
    pub jwt_secret: String,
    /// Period of the dirty-document checkpoint task (`None` = disabled)
    pub checkpoint_interval: Option<Duration>,
    pub max_rooms_per_connection: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            storage: StorageConfig::default(),
            jwt_secret: String::new(),
            checkpoint_interval: Some(Duration::from_secs(30)),
            max_rooms_per_connection: 64,
        }
    }
}

impl ServerConfig {
    /// Load from process environment variables (call `dotenvy::dotenv()` first)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("PORT") {
            config.port = parse("PORT", port)?;
        }
        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage.path = path;
        }
        if let Some(backend) = lookup("STORAGE_BACKEND") {
            config.storage.backend = backend
                .parse::<StorageBackend>()
                .map_err(|_| ConfigError::Invalid {
                    name: "STORAGE_BACKEND",
                    value: backend,
                })?;
        }
        if let Some(secs) = lookup("CHECKPOINT_INTERVAL_SECS") {
            let secs: u64 = parse("CHECKPOINT_INTERVAL_SECS", secs)?;
            config.checkpoint_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(max) = lookup("MAX_ROOMS_PER_CONNECTION") {
            config.max_rooms_per_connection = parse("MAX_ROOMS_PER_CONNECTION", max)?;
        }

        config.jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        Ok(config)
    }

    /// Socket address to bind
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::Invalid {
            name: "HOST",
            value: addr,
        })
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_with_secret() {
        let config = ServerConfig::from_lookup(lookup(&[("JWT_SECRET", "s3cret")])).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.storage.backend, StorageBackend::Sled);
        assert_eq!(config.checkpoint_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.bind_addr().unwrap().port(), 5000);
    }

    #[test]
    fn test_missing_secret() {
        assert_eq!(
            ServerConfig::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing("JWT_SECRET")
        );
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("JWT_SECRET", "x"),
            ("PORT", "8080"),
            ("STORAGE_BACKEND", "memory"),
            ("CHECKPOINT_INTERVAL_SECS", "0"),
            ("MAX_ROOMS_PER_CONNECTION", "3"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.checkpoint_interval, None);
        assert_eq!(config.max_rooms_per_connection, 3);
    }

    #[test]
    fn test_invalid_port() {
        let err = ServerConfig::from_lookup(lookup(&[("JWT_SECRET", "x"), ("PORT", "http")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PORT", .. }));
    }
}
