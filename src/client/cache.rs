//! Per-key cache of outbound channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;

use crate::client::channel::{normalize_endpoint, probe};
use crate::client::balancer::Target;
use crate::client::{resolver, Channel, DialError};
use crate::config::{ConfigError, ServiceConfig};
use crate::error::{Error, Result};
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::registry::service_prefix;
use crate::rpc::ServiceDescriptor;
use crate::store::SharedStore;

/// Cache of [`Channel`]s keyed by remote service, RPC service and optional
/// static endpoint.
pub struct ConnectionCache {
    channels: RwLock<HashMap<String, Channel>>,
    store: Option<SharedStore>,
    prefix: String,
    dial_timeout: Duration,
    dials: AtomicUsize,
    closed: AtomicBool,
    signal: ShutdownSignal,
}

fn cache_key(service_name: &str, rpc_name: &str, endpoint: Option<&str>) -> String {
    match endpoint {
        Some(endpoint) => format!("{}/{}@{}", service_name, rpc_name, endpoint),
        None => format!("{}/{}", service_name, rpc_name),
    }
}

impl ConnectionCache {
    pub fn new(config: &ServiceConfig, store: Option<SharedStore>, signal: ShutdownSignal) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            store,
            prefix: config.registry.prefix.clone(),
            dial_timeout: config.client.dial_timeout(),
            dials: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            signal,
        }
    }

    /// Channel to `descriptor` on `service_name`, dialing on first use.
    ///
    /// With `endpoint` the address is dialed directly; otherwise the
    /// endpoints registered in the coordination store are used.
    pub async fn resolve(
        &self,
        service_name: &str,
        descriptor: &ServiceDescriptor,
        endpoint: Option<&str>,
    ) -> Result<Channel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DialError::Closed.into());
        }

        let key = cache_key(service_name, descriptor.name(), endpoint);
        if let Some(channel) = self.channels.read().await.get(&key) {
            return Ok(channel.clone());
        }

        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(&key) {
            return Ok(channel.clone());
        }

        let channel = self.dial(service_name, descriptor, endpoint).await?;
        channels.insert(key, channel.clone());
        Ok(channel)
    }

    async fn dial(
        &self,
        service_name: &str,
        descriptor: &ServiceDescriptor,
        endpoint: Option<&str>,
    ) -> Result<Channel> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}/{}", service_name, descriptor.name());

        let result = match endpoint {
            Some(endpoint) => self.dial_static(&name, endpoint).await,
            None => self.dial_discovered(&name, service_name, descriptor).await,
        };

        match &result {
            Ok(channel) => {
                metrics::record_dial("success");
                tracing::info!(channel = %name, endpoints = ?channel.endpoints(), "Dialed");
            }
            Err(e) => {
                metrics::record_dial("failure");
                tracing::warn!(channel = %name, error = %e, "Dial failed");
            }
        }
        result
    }

    async fn dial_static(&self, name: &str, endpoint: &str) -> Result<Channel> {
        let address = normalize_endpoint(endpoint)?;
        probe(&address, self.dial_timeout).await?;

        let channel = Channel::new(name, self.dial_timeout);
        channel.upsert(Target {
            key: address.clone(),
            address,
            metadata: Default::default(),
        });
        Ok(channel)
    }

    async fn dial_discovered(
        &self,
        name: &str,
        service_name: &str,
        descriptor: &ServiceDescriptor,
    ) -> Result<Channel> {
        let store = self
            .store
            .clone()
            .ok_or(Error::Config(ConfigError::StoreNotConfigured))?;

        let channel = Channel::new(name, self.dial_timeout);
        let prefix = service_prefix(&self.prefix, service_name, descriptor.name());
        resolver::start(store, prefix, channel.clone(), self.signal.clone()).await?;

        if let Err(e) = channel.wait_reachable(self.dial_timeout).await {
            channel.close().await;
            return Err(e.into());
        }
        Ok(channel)
    }

    /// Number of dials performed (successful or not).
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Number of cached channels.
    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every cached channel and refuse further resolves.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let channels: Vec<Channel> = self.channels.write().await.drain().map(|(_, c)| c).collect();
        for channel in &channels {
            channel.close().await;
        }
        tracing::info!(channels = channels.len(), "Connection cache closed");
    }
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("prefix", &self.prefix)
            .field("dial_timeout", &self.dial_timeout)
            .field("dials", &self.dial_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use std::sync::Arc;

    fn config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.client.dial_timeout_ms = 200;
        config
    }

    fn calc() -> ServiceDescriptor {
        ServiceDescriptor::new("calc.v1.Calculator")
    }

    #[tokio::test]
    async fn concurrent_resolve_dials_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let shutdown = Shutdown::new();
        let cache = Arc::new(ConnectionCache::new(&config(), None, shutdown.subscribe()));

        let resolves: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let address = address.clone();
                tokio::spawn(async move { cache.resolve("calc", &calc(), Some(&address)).await })
            })
            .collect();

        for resolve in resolves {
            let channel = resolve.await.unwrap().unwrap();
            assert_eq!(channel.endpoints(), vec![address.clone()]);
        }
        assert_eq!(cache.dial_count(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn failed_dial_is_not_cached() {
        let shutdown = Shutdown::new();
        let cache = ConnectionCache::new(&config(), None, shutdown.subscribe());

        // Nothing listens on port 1.
        assert!(cache.resolve("calc", &calc(), Some("127.0.0.1:1")).await.is_err());
        assert!(cache.resolve("calc", &calc(), Some("127.0.0.1:1")).await.is_err());
        assert_eq!(cache.dial_count(), 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn discovery_without_store_is_config_error() {
        let shutdown = Shutdown::new();
        let cache = ConnectionCache::new(&config(), None, shutdown.subscribe());
        let err = cache.resolve("calc", &calc(), None).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::StoreNotConfigured)));
    }

    #[tokio::test]
    async fn closed_cache_refuses_resolves() {
        let shutdown = Shutdown::new();
        let cache = ConnectionCache::new(&config(), None, shutdown.subscribe());
        cache.close().await;
        let err = cache.resolve("calc", &calc(), Some("127.0.0.1:1")).await.unwrap_err();
        assert!(matches!(err, Error::Dial(DialError::Closed)));
    }
}
