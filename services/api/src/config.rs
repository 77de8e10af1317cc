//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which `ProviderGateway` implementation to run against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayKind {
    Bridge,
    Fake,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub log_level: Level,
    pub gateway: GatewayKind,
    pub bridge_url: String,
    pub bridge_timeout: Duration,
    pub provider_max_attempts: u32,
    pub provider_backoff: Duration,
    pub notify_queue_capacity: usize,
    pub webhook_secret: Option<String>,
    pub cors_origin: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // --- Load Server and Database Settings ---
        let bind_address = parse_or::<SocketAddr, _>(&var, "BIND_ADDRESS", "0.0.0.0:8080")?;
        let database_url = var("DATABASE_URL");
        let database_max_connections = parse_or::<u32, _>(&var, "DATABASE_MAX_CONNECTIONS", "5")?;

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load Provider Settings ---
        let gateway = match var("GATEWAY").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("bridge") => GatewayKind::Bridge,
            Some("fake") => GatewayKind::Fake,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "GATEWAY".to_string(),
                    format!("'{}' is not one of bridge, fake", other),
                ))
            }
        };
        let bridge_url = var("BRIDGE_URL").unwrap_or_else(|| "http://localhost:3000".to_string());
        let bridge_timeout = Duration::from_secs(parse_or::<u64, _>(&var, "BRIDGE_TIMEOUT_SECS", "10")?);
        let provider_max_attempts = parse_or::<u32, _>(&var, "PROVIDER_MAX_ATTEMPTS", "3")?;
        if provider_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "PROVIDER_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let provider_backoff =
            Duration::from_millis(parse_or::<u64, _>(&var, "PROVIDER_BACKOFF_MS", "200")?);

        // --- Load Notification and Webhook Settings ---
        let notify_queue_capacity = parse_or::<usize, _>(&var, "NOTIFY_QUEUE_CAPACITY", "256")?;
        let webhook_secret = var("WEBHOOK_SECRET");
        let cors_origin =
            var("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_string());

        Ok(Self {
            bind_address,
            database_url,
            database_max_connections,
            log_level,
            gateway,
            bridge_url,
            bridge_timeout,
            provider_max_attempts,
            provider_backoff,
            notify_queue_capacity,
            webhook_secret,
            cors_origin,
        })
    }
}

/// Parses `key` if set, otherwise parses `default`.
fn parse_or<T, F>(var: &F, key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = var(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}
