//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (durations > 0, addresses parse)
//! - Validate the service name charset
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs after environment overrides are applied

use std::net::SocketAddr;

use crate::config::schema::ServiceConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Whether `name` only uses `[a-zA-Z0-9-_.]` and is non-empty.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Validate a fully merged configuration.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !is_valid_name(&config.service.name) {
        errors.push(ValidationError::new(
            "service.name",
            format!(
                "invalid service name {:?}, expected ^[a-zA-Z0-9\\-\\_\\.]+$",
                config.service.name
            ),
        ));
    }

    if config.http.address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "http.address",
            format!("invalid listen address {:?}", config.http.address),
        ));
    }

    if let Some(advertised) = &config.http.advertised_address {
        if advertised.is_empty() {
            errors.push(ValidationError::new(
                "http.advertised_address",
                "must not be empty when set",
            ));
        }
    }

    if config.registry.prefix.is_empty() || config.registry.prefix.ends_with('/') {
        errors.push(ValidationError::new(
            "registry.prefix",
            "must be non-empty without a trailing '/'",
        ));
    }

    for (field, value) in [
        ("registry.lease_ttl_ms", config.registry.lease_ttl_ms),
        ("registry.keepalive_interval_ms", config.registry.keepalive_interval_ms),
        ("registry.cooldown_ms", config.registry.cooldown_ms),
        ("client.dial_timeout_ms", config.client.dial_timeout_ms),
        ("upgrade.timeout_secs", config.upgrade.timeout_secs),
        ("http.request_timeout_secs", config.http.request_timeout_secs),
        ("http.max_connections", config.http.max_connections as u64),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.registry.keepalive_interval_ms >= config.registry.lease_ttl_ms {
        errors.push(ValidationError::new(
            "registry.keepalive_interval_ms",
            "must be shorter than the lease TTL",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
