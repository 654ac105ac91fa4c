//! The service: one listener, two planes, registration, outbound channels
//! and an orderly exit.
//!
//! # Data Flow
//! ```text
//! Service::new(config)
//!     → finalize config, connect store
//!     → ConnectionCache + "connection-cache" hook
//! collaborators register RPC services and web routes on server_mut()
//! Service::start()
//!     → Upgrader::listen (inherit or bind)
//!     → Server::start (+ "http-server" hook)
//!     → Upgrader::ready, signal watcher
//!     → Registry::start (+ "registry" hook)
//! RunningService::wait()
//!     → Upgraded | Stopped | Shutdown::trigger
//!     → Shutdown::run (hooks concurrently)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::client::ConnectionCache;
use crate::config::{finalize, ConfigError, ServiceConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::http::{Server, ServerHandle};
use crate::lifecycle::{Shutdown, UpgradeState, Upgrader};
use crate::net::connection::ConnectionTracker;
use crate::net::demux::Plane;
use crate::net::listener::Listener;
use crate::registry::Registry;
use crate::store::SharedStore;

/// A configured service that has not started serving yet.
pub struct Service {
    config: ServiceConfig,
    store: Option<SharedStore>,
    shutdown: Shutdown,
    cache: Arc<ConnectionCache>,
    server: Server,
}

#[cfg(feature = "etcd")]
async fn connect_store(config: &StoreConfig) -> Result<Option<SharedStore>> {
    if !config.is_configured() {
        return Ok(None);
    }
    let store = crate::store::etcd::EtcdStore::connect(config).await?;
    tracing::info!(endpoints = ?config.endpoints, "Connected to coordination store");
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "etcd"))]
async fn connect_store(config: &StoreConfig) -> Result<Option<SharedStore>> {
    if !config.is_configured() {
        return Ok(None);
    }
    Err(ConfigError::Invalid(
        "store endpoints are configured but the etcd feature is disabled".to_string(),
    )
    .into())
}

impl Service {
    /// Finalize `config` and connect to the coordination store it names.
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        let config = finalize(config, |key| std::env::var(key).ok())?;
        let store = connect_store(&config.store).await?;
        Self::build(config, store)
    }

    /// Like [`Service::new`] but with a caller-supplied store.
    pub fn with_store(config: ServiceConfig, store: Option<SharedStore>) -> Result<Self> {
        let config = finalize(config, |key| std::env::var(key).ok())?;
        Self::build(config, store)
    }

    fn build(config: ServiceConfig, store: Option<SharedStore>) -> Result<Self> {
        let shutdown = Shutdown::new();
        let tracker = ConnectionTracker::new();
        let cache = Arc::new(ConnectionCache::new(&config, store.clone(), shutdown.subscribe()));

        {
            // Runs after the server has drained and every later hook is done.
            let cache = Arc::clone(&cache);
            shutdown.add_release_hook("connection-cache", move || async move {
                cache.close().await;
            });
        }

        let server = Server::new(&config, tracker);

        tracing::info!(
            service = %config.service.name,
            version = %config.service.version,
            build = %config.service.build,
            store = store.is_some(),
            "Service configured"
        );

        Ok(Self {
            config,
            store,
            shutdown,
            cache,
            server,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The server, for registering RPC services and web routes.
    pub fn server_mut(&mut self) -> &mut Server {
        &mut self.server
    }

    /// Shared outbound connection cache.
    pub fn client(&self) -> Arc<ConnectionCache> {
        Arc::clone(&self.cache)
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Bind (or inherit) the listener, start serving and registering.
    pub async fn start(self) -> Result<RunningService> {
        let Service {
            config,
            store,
            shutdown,
            cache,
            server,
        } = self;

        let upgrader = Arc::new(Upgrader::new(config.upgrade.timeout()));
        let std_listener = upgrader.listen(&config.http.address)?;
        let listener = Listener::from_std(std_listener, config.http.max_connections)?;

        let descriptors = server.descriptors();
        let handle = server.start(listener, &shutdown).map_err(Error::Bind)?;

        upgrader.ready();
        let signals = match upgrader.watch_signals() {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::warn!(error = %e, "Signal handlers unavailable, upgrades disabled");
                None
            }
        };

        if descriptors.is_empty() {
            tracing::info!("No RPC services declared, skipping registration");
        } else if let Some(store) = store {
            let address = advertised(&config, handle.local_addr())?;
            let registry = Registry::new(
                store,
                &config.registry,
                &config.service.name,
                &address,
                &descriptors,
            )?;
            Arc::new(registry).start(&shutdown);
        } else {
            tracing::warn!("No coordination store configured, RPC services will not be registered");
        }

        Ok(RunningService {
            handle,
            shutdown,
            upgrader,
            cache,
            signals,
        })
    }

    /// Start, then block until the process should exit and shutdown is done.
    pub async fn serve(self) -> Result<()> {
        self.start().await?.wait().await
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.config.service.name)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

/// The configured advertised address, with port 0 replaced by the bound port.
fn advertised(config: &ServiceConfig, bound: SocketAddr) -> Result<String> {
    let configured = config
        .http
        .advertised_address
        .clone()
        .unwrap_or_else(|| bound.to_string());

    match configured.parse::<SocketAddr>() {
        Ok(addr) if addr.port() == 0 => Ok(SocketAddr::new(addr.ip(), bound.port()).to_string()),
        Ok(_) => Ok(configured),
        // host:port advertised names are passed through untouched.
        Err(_) if configured.rsplit_once(':').is_some() => Ok(configured),
        Err(_) => Err(ConfigError::Invalid(format!("invalid advertised address: {}", configured)).into()),
    }
}

/// A service that is serving.
pub struct RunningService {
    handle: ServerHandle,
    shutdown: Shutdown,
    upgrader: Arc<Upgrader>,
    cache: Arc<ConnectionCache>,
    signals: Option<JoinHandle<()>>,
}

impl RunningService {
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Connections routed to `plane` so far.
    pub fn routed(&self, plane: Plane) -> u64 {
        self.handle.routed(plane)
    }

    pub fn server(&self) -> &ServerHandle {
        &self.handle
    }

    pub fn client(&self) -> Arc<ConnectionCache> {
        Arc::clone(&self.cache)
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn upgrade_state(&self) -> UpgradeState {
        self.upgrader.state()
    }

    /// Request a stop, as SIGTERM would.
    pub fn stop(&self) {
        self.upgrader.stop();
    }

    /// Wait until an upgrade completes, a stop is requested or shutdown is
    /// triggered, then run every shutdown hook.
    pub async fn wait(self) -> Result<()> {
        let mut signal = self.shutdown.subscribe();
        tokio::select! {
            state = self.upgrader.exited() => {
                tracing::info!(state = ?state, "Leaving serving state");
            }
            _ = signal.recv() => {
                tracing::info!("Shutdown triggered");
            }
        }

        self.shutdown.run().await;
        if let Some(signals) = self.signals {
            signals.abort();
        }
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for RunningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningService")
            .field("local_addr", &self.handle.local_addr())
            .field("state", &self.upgrader.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(advertised: Option<&str>) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.http.advertised_address = advertised.map(String::from);
        config
    }

    #[test]
    fn advertised_fills_in_bound_port() {
        let bound: SocketAddr = "127.0.0.1:40123".parse().unwrap();
        assert_eq!(
            advertised(&config(Some("10.0.0.5:0")), bound).unwrap(),
            "10.0.0.5:40123"
        );
        assert_eq!(
            advertised(&config(Some("10.0.0.5:7000")), bound).unwrap(),
            "10.0.0.5:7000"
        );
        assert_eq!(
            advertised(&config(Some("calc.internal:7000")), bound).unwrap(),
            "calc.internal:7000"
        );
        assert_eq!(advertised(&config(None), bound).unwrap(), "127.0.0.1:40123");
        assert!(advertised(&config(Some("nonsense")), bound).is_err());
    }

    #[cfg(not(feature = "etcd"))]
    #[tokio::test]
    async fn store_endpoints_without_backend_are_rejected() {
        let mut config = ServiceConfig::default();
        config.http.address = "127.0.0.1:0".to_string();
        config.store.endpoints = vec!["127.0.0.1:2379".to_string()];

        let err = Service::new(config).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::Invalid(_))));
    }
}
