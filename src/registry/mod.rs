//! Lease-based service registration.
//!
//! # Data Flow
//! ```text
//! every keepalive_interval:
//!     Unbound  → lease_grant(ttl) → put every key with the lease → Bound
//!                                       └── any put fails → Unbound
//!     Bound    → Renewing → keep_alive_once → Bound
//!                                      └── error → Unbound (re-register next tick)
//!
//! supervisor: loop panics → log → sleep(cooldown) → relaunch
//! shutdown hook "registry": stop loop → delete every key
//! ```
//!
//! # Design Decisions
//! - Store failures are logged and retried on the next tick, never surfaced
//! - Only the loop task touches the lease
//! - Deregistration waits for the loop to exit, so no put can land after
//!   the final deletes

pub mod key;
pub mod lease;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RegistryConfig;
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::observability::metrics;
use crate::rpc::ServiceDescriptor;
use crate::store::{Endpoint, LeaseId, SharedStore, StoreError};

pub use key::{host_identity, service_prefix, RegistrationKey};
pub use lease::{Lease, LeaseState};

/// Registration failures. Logged by the loop, never returned to callers.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("lease grant failed: {0}")]
    Grant(#[source] StoreError),

    #[error("put {key} failed: {source}")]
    Put {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("lease {lease} expired: {source}")]
    LeaseExpired {
        lease: LeaseId,
        #[source]
        source: StoreError,
    },
}

/// One key and the value registered under it.
#[derive(Debug, Clone)]
struct Entry {
    key: RegistrationKey,
    value: Vec<u8>,
}

/// Keeps this process's RPC services registered in the coordination store.
pub struct Registry {
    store: SharedStore,
    entries: Vec<Entry>,
    ttl: Duration,
    interval: Duration,
    cooldown: Duration,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Build one registration per descriptor, advertising `address`.
    pub fn new(
        store: SharedStore,
        config: &RegistryConfig,
        service_name: &str,
        address: &str,
        descriptors: &[ServiceDescriptor],
    ) -> Result<Self, StoreError> {
        let identity = host_identity();
        let entries = descriptors
            .iter()
            .map(|descriptor| {
                let endpoint = Endpoint {
                    address: address.to_string(),
                    metadata: descriptor.metadata_map().clone(),
                };
                Ok(Entry {
                    key: RegistrationKey::new(&config.prefix, service_name, descriptor.name(), &identity),
                    value: endpoint.encode()?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Self {
            store,
            entries,
            ttl: config.lease_ttl(),
            interval: config.keepalive_interval(),
            cooldown: config.cooldown(),
            supervisor: Mutex::new(None),
        })
    }

    /// Keys this registry maintains.
    pub fn keys(&self) -> Vec<RegistrationKey> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    /// Launch the supervised loop and add the `registry` shutdown hook.
    pub fn start(self: Arc<Self>, shutdown: &Shutdown) {
        let task = tokio::spawn(Arc::clone(&self).supervise(shutdown.subscribe()));
        *self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);

        tracing::info!(
            keys = ?self.keys().iter().map(RegistrationKey::as_str).collect::<Vec<_>>(),
            ttl = ?self.ttl,
            interval = ?self.interval,
            "Registration started"
        );

        shutdown.add_hook("registry", move || async move { self.deregister().await });
    }

    async fn supervise(self: Arc<Self>, mut signal: ShutdownSignal) {
        loop {
            let worker = tokio::spawn(Arc::clone(&self).keep_registered(signal.clone()));
            match worker.await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    metrics::record_lease_event("loop_panic");
                    tracing::error!(
                        cooldown = ?self.cooldown,
                        "Registration loop panicked, relaunching after cooldown"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Registration loop cancelled");
                    return;
                }
            }

            tokio::select! {
                _ = signal.recv() => return,
                _ = tokio::time::sleep(self.cooldown) => {}
            }
            tracing::info!("Relaunching registration loop");
        }
    }

    async fn keep_registered(self: Arc<Self>, mut signal: ShutdownSignal) {
        let mut lease = Lease::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = signal.recv() => {
                    tracing::debug!("Registration loop stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.step(&mut lease).await {
                tracing::warn!(error = %e, "Registration step failed");
            }
        }
    }

    async fn step(&self, lease: &mut Lease) -> Result<(), RegistrationError> {
        match lease.state() {
            LeaseState::Unbound => {
                let id = self
                    .store
                    .lease_grant(self.ttl)
                    .await
                    .map_err(RegistrationError::Grant)?;
                metrics::record_lease_event("granted");
                tracing::info!(lease = id, "Lease granted");
                // A partial registration is retried from scratch; the
                // abandoned lease expires on its own.
                self.register_all(id).await?;
                lease.bind(id);
                Ok(())
            }
            LeaseState::Bound(_) | LeaseState::Renewing(_) => {
                let Some(id) = lease.begin_renewal() else {
                    lease.reset();
                    return Ok(());
                };
                match self.store.lease_keep_alive_once(id).await {
                    Ok(remaining) => {
                        lease.renewed();
                        tracing::trace!(lease = id, remaining = ?remaining, "Lease renewed");
                        Ok(())
                    }
                    Err(source) => {
                        lease.reset();
                        metrics::record_lease_event("expired");
                        Err(RegistrationError::LeaseExpired { lease: id, source })
                    }
                }
            }
        }
    }

    async fn register_all(&self, lease: LeaseId) -> Result<(), RegistrationError> {
        let mut first_error = None;
        for entry in &self.entries {
            match self.store.put(entry.key.as_str(), entry.value.clone(), Some(lease)).await {
                Ok(()) => tracing::info!(key = %entry.key, lease, "Registered"),
                Err(source) => {
                    let err = RegistrationError::Put {
                        key: entry.key.to_string(),
                        source,
                    };
                    tracing::warn!(error = %err, "Registration failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop the loop and delete every key. Best effort.
    pub async fn deregister(&self) {
        let task = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Registration supervisor failed");
            }
        }

        for entry in &self.entries {
            match self.store.delete(entry.key.as_str()).await {
                Ok(()) => tracing::info!(key = %entry.key, "Deregistered"),
                Err(e) => tracing::warn!(key = %entry.key, error = %e, "Deregistration failed"),
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.keys())
            .field("ttl", &self.ttl)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CoordinationStore, MemoryStore, WatchStream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` puts, then behaves like the wrapped store.
    #[derive(Debug)]
    struct FlakyPuts {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl CoordinationStore for FlakyPuts {
        async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
            self.inner.lease_grant(ttl).await
        }

        async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<Duration, StoreError> {
            self.inner.lease_keep_alive_once(lease).await
        }

        async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                return Err(StoreError::Unavailable);
            }
            self.inner.put(key, value, lease).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
            self.inner.get_prefix(prefix).await
        }

        async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
            self.inner.watch_prefix(prefix).await
        }
    }

    fn config() -> RegistryConfig {
        RegistryConfig {
            prefix: "reg".to_string(),
            lease_ttl_ms: 200,
            keepalive_interval_ms: 50,
            cooldown_ms: 50,
        }
    }

    fn registry(store: &MemoryStore) -> Arc<Registry> {
        let descriptors = [ServiceDescriptor::new("calc.v1.Calculator").metadata("zone", "a")];
        Arc::new(
            Registry::new(Arc::new(store.clone()), &config(), "calc", "127.0.0.1:5001", &descriptors)
                .unwrap(),
        )
    }

    async fn wait_for_keys(store: &MemoryStore, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.get_prefix("reg/").await.map(|kv| kv.len()).unwrap_or(0) != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn registers_with_lease_and_deregisters() {
        let store = MemoryStore::new();
        let shutdown = Shutdown::new();
        let registry = registry(&store);
        let key = registry.keys()[0].clone();
        registry.start(&shutdown);

        wait_for_keys(&store, 1).await;
        assert!(store.lease_of(key.as_str()).is_some());

        let stored = store.get_prefix("reg/calc/").await.unwrap();
        let endpoint = Endpoint::decode(&stored[0].1).unwrap();
        assert_eq!(endpoint.address, "127.0.0.1:5001");
        assert_eq!(endpoint.metadata.get("zone").map(String::as_str), Some("a"));

        shutdown.run().await;
        assert!(store.get_prefix("reg/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_registers_after_lease_loss() {
        let store = MemoryStore::new();
        let shutdown = Shutdown::new();
        let registry = registry(&store);
        let key = registry.keys()[0].clone();
        registry.start(&shutdown);

        wait_for_keys(&store, 1).await;
        let first = store.lease_of(key.as_str()).unwrap();
        store.revoke(first);
        wait_for_keys(&store, 0).await;

        wait_for_keys(&store, 1).await;
        assert_ne!(store.lease_of(key.as_str()), Some(first));
        shutdown.run().await;
    }

    #[tokio::test]
    async fn failed_put_is_retried_with_a_fresh_lease() {
        let store = MemoryStore::new();
        let flaky = Arc::new(FlakyPuts {
            inner: store.clone(),
            failures: AtomicUsize::new(1),
        });
        let descriptors = [ServiceDescriptor::new("calc.v1.Calculator")];
        let registry = Arc::new(
            Registry::new(flaky.clone(), &config(), "calc", "127.0.0.1:5001", &descriptors).unwrap(),
        );
        let key = registry.keys()[0].clone();
        let shutdown = Shutdown::new();
        registry.start(&shutdown);

        wait_for_keys(&store, 1).await;
        assert_eq!(flaky.failures.load(Ordering::SeqCst), 0);
        // The first lease was abandoned with the failed put.
        assert!(store.lease_of(key.as_str()).is_some_and(|lease| lease >= 2));

        // Still registered after the abandoned lease's TTL has passed.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get_prefix("reg/").await.unwrap().len(), 1);

        shutdown.run().await;
        assert!(store.get_prefix("reg/").await.unwrap().is_empty());
    }
}
