//! Configuration loading from disk and the environment.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::config::schema::{ServiceConfig, DEFAULT_SERVICE_NAME};
use crate::config::validation::{validate_config, ValidationError};
use crate::net::addr;

/// Service name override.
pub const ENV_SERVICE_NAME: &str = "SERVICEKIT_NAME";
/// Service version override.
pub const ENV_SERVICE_VERSION: &str = "SERVICEKIT_VERSION";
/// Advertised address override; wins over the config file.
pub const ENV_ADVERTISED_ADDR: &str = "SERVICEKIT_ADVERTISED_ADDR";
/// Comma-separated coordination store endpoints.
pub const ENV_ETCD: &str = "SERVICEKIT_ETCD";
/// Coordination store username.
pub const ENV_ETCD_USER: &str = "SERVICEKIT_ETCD_USER";
/// Coordination store password.
pub const ENV_ETCD_PASSWORD: &str = "SERVICEKIT_ETCD_PASSWORD";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),

    /// A registration or wiring call was rejected.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Service discovery was requested but no store endpoints are set.
    #[error("coordination store not configured")]
    StoreNotConfigured,
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a TOML file without overrides or validation.
pub fn read_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load a TOML file, apply environment overrides, fill derived defaults and
/// validate.
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    finalize(read_config(path)?, |key| std::env::var(key).ok())
}

/// Apply environment overrides and defaults to an in-memory config, then
/// validate it.
///
/// `env` looks up a variable by name, so callers and tests can supply
/// something other than the process environment.
pub fn finalize<F>(mut config: ServiceConfig, env: F) -> Result<ServiceConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    apply_env(&mut config, &env);

    if config.service.name.is_empty() {
        config.service.name = DEFAULT_SERVICE_NAME.to_string();
    }
    if config.service.version.is_empty() {
        config.service.version = "v0.0.1".to_string();
    }
    if config.service.build.is_empty() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        config.service.build = format!("dev-{}", nanos);
    }

    validate_config(&config).map_err(ConfigError::Validation)?;

    if config.http.advertised_address.is_none() {
        let advertised = addr::advertised_address(&config.http.address)
            .map_err(|e| ConfigError::Invalid(format!("invalid address: {}", e)))?;
        config.http.advertised_address = Some(advertised);
    }

    Ok(config)
}

fn apply_env<F>(config: &mut ServiceConfig, env: &F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| env(key).filter(|v| !v.is_empty());

    if config.service.name.is_empty() {
        if let Some(name) = non_empty(ENV_SERVICE_NAME) {
            config.service.name = name;
        }
    }
    if config.service.version.is_empty() {
        if let Some(version) = non_empty(ENV_SERVICE_VERSION) {
            config.service.version = version;
        }
    }
    if let Some(advertised) = non_empty(ENV_ADVERTISED_ADDR) {
        config.http.advertised_address = Some(advertised);
    }
    if let Some(endpoints) = non_empty(ENV_ETCD) {
        config.store.endpoints = endpoints
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(user) = non_empty(ENV_ETCD_USER) {
        config.store.username = Some(user);
    }
    if let Some(password) = non_empty(ENV_ETCD_PASSWORD) {
        config.store.password = Some(password);
    }
}
