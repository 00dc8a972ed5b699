//! Environment-driven configuration shared by the pipeline crates and workers.
//!
//! Settings are read from process environment variables. Values that belong
//! to a named resource (a task, a queue, a thread pool) are scoped with
//! [`scoped_key`], e.g. `PIPELINE_ORDERS_MAX_ATTEMPTS`.

pub mod tracing;

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("Invalid value for '{key}': {details}")]
    InvalidValue { key: String, details: String },
}

/// Application environment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Parse an environment variable, falling back to `default` when it is unset.
///
/// A variable that is set but does not parse is an error, never silently
/// replaced by the default.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(env_parse_optional(key)?.unwrap_or(default))
}

/// Parse an environment variable if it is set.
pub fn env_parse_optional<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::ParseError {
                key: key.to_string(),
                details: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Build the environment key for a setting that belongs to a named resource.
///
/// `scoped_key("PIPELINE", "order-events", "max_attempts")` yields
/// `PIPELINE_ORDER_EVENTS_MAX_ATTEMPTS`.
pub fn scoped_key(prefix: &str, name: &str, field: &str) -> String {
    [prefix, name, field]
        .iter()
        .filter(|part| !part.is_empty())
        .map(|part| normalize_key_part(part))
        .collect::<Vec<_>>()
        .join("_")
}

fn normalize_key_part(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
