//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a service.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default service name when neither the file nor the environment sets one.
pub const DEFAULT_SERVICE_NAME: &str = "servicekit-default";

/// Default key prefix services are registered under.
pub const DEFAULT_REGISTER_PREFIX: &str = "servicekit/register";

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service identity.
    pub service: IdentityConfig,

    /// Listener and HTTP plane settings.
    pub http: HttpConfig,

    /// Registration loop settings.
    pub registry: RegistryConfig,

    /// Outbound connection settings.
    pub client: ClientConfig,

    /// Live upgrade settings.
    pub upgrade: UpgradeConfig,

    /// Coordination store connection.
    pub store: StoreConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Service identity.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct IdentityConfig {
    /// Service name; also the second segment of every registration key.
    pub name: String,

    /// Service version (e.g. "v1.0.0").
    pub version: String,

    /// Build identifier, reported in the `x-service` header.
    pub build: String,

    /// Free-form description.
    pub description: String,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address (e.g., "0.0.0.0:5001").
    pub address: String,

    /// Address other services should dial. Derived from the listen port
    /// and the local non-loopback IP when unset.
    pub advertised_address: Option<String>,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Header read timeout for HTTP/1 connections in seconds.
    pub read_header_timeout_secs: u64,

    /// Maximum concurrently open connections across both planes.
    pub max_connections: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:5001".to_string(),
            advertised_address: None,
            request_timeout_secs: 30,
            read_header_timeout_secs: 30,
            max_connections: 10_000,
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn read_header_timeout(&self) -> Duration {
        Duration::from_secs(self.read_header_timeout_secs)
    }
}

/// Registration loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Key prefix for registration keys.
    pub prefix: String,

    /// Lease TTL in milliseconds.
    pub lease_ttl_ms: u64,

    /// Keep-alive poll interval in milliseconds.
    pub keepalive_interval_ms: u64,

    /// Delay before relaunching the loop after a fault, in milliseconds.
    pub cooldown_ms: u64,
}

impl RegistryConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_REGISTER_PREFIX.to_string(),
            lease_ttl_ms: 10_000,
            keepalive_interval_ms: 5_000,
            cooldown_ms: 10_000,
        }
    }
}

/// Outbound connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Dial timeout in milliseconds.
    pub dial_timeout_ms: u64,
}

impl ClientConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 5_000,
        }
    }
}

/// Live upgrade configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Maximum time the replacement process has to become ready, in seconds.
    pub timeout_secs: u64,
}

impl UpgradeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

/// Coordination store connection.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Store endpoints; empty means no store is configured.
    pub endpoints: Vec<String>,

    /// Optional username.
    pub username: Option<String>,

    /// Optional password.
    pub password: Option<String>,
}

impl StoreConfig {
    /// Whether any store endpoint is configured.
    pub fn is_configured(&self) -> bool {
        !self.endpoints.is_empty()
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Serve `/metrics` on the web plane.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}
