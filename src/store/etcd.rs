//! etcd v3 adapter for [`CoordinationStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions,
};
use futures_util::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::config::StoreConfig;
use crate::store::{CoordinationStore, LeaseId, StoreError, WatchEvent, WatchStream};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const KEEP_ALIVE_TIME: Duration = Duration::from_secs(10);

type KeepAlive = (LeaseKeeper, LeaseKeepAliveStream);

/// A store backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    /// One keep-alive stream per lease, opened on first renewal.
    keepers: Arc<Mutex<HashMap<LeaseId, KeepAlive>>>,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

fn backend(e: etcd_client::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// etcd TTLs are whole seconds; round up so a lease never lives shorter
/// than asked.
fn ttl_seconds(ttl: Duration) -> i64 {
    ttl.as_secs_f64().ceil().max(1.0) as i64
}

impl EtcdStore {
    /// Connect to the endpoints in `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(DIAL_TIMEOUT)
            .with_keep_alive(KEEP_ALIVE_TIME, DIAL_TIMEOUT);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(config.endpoints.clone(), Some(options))
            .await
            .map_err(backend)?;

        tracing::info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self {
            client,
            keepers: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let mut client = self.client.clone();
        let secs = ttl_seconds(ttl);
        if Duration::from_secs(secs as u64) != ttl {
            tracing::debug!(requested = ?ttl, granted_secs = secs, "Lease TTL rounded up to whole seconds");
        }
        let resp = client.lease_grant(secs, None).await.map_err(backend)?;
        Ok(resp.id())
    }

    async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<Duration, StoreError> {
        let mut keepers = self.keepers.lock().await;
        if !keepers.contains_key(&lease) {
            let mut client = self.client.clone();
            let opened = client.lease_keep_alive(lease).await.map_err(backend)?;
            keepers.insert(lease, opened);
        }

        let renewed = match keepers.get_mut(&lease) {
            Some((keeper, responses)) => match keeper.keep_alive().await {
                Ok(()) => match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => Ok(Duration::from_secs(resp.ttl() as u64)),
                    Ok(_) => Err(StoreError::LeaseNotFound(lease)),
                    Err(e) => Err(backend(e)),
                },
                Err(e) => Err(backend(e)),
            },
            None => Err(StoreError::LeaseNotFound(lease)),
        };

        // Drop the stream once its lease died or its connection broke.
        if renewed.is_err() {
            keepers.remove(&lease);
        }
        renewed
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await.map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.delete(key, None).await.map_err(backend)?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend)?;

        resp.kvs()
            .iter()
            .map(|kv| {
                let key = kv.key_str().map_err(backend)?.to_string();
                Ok((key, kv.value().to_vec()))
            })
            .collect()
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let mut client = self.client.clone();
        let (watcher, responses) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(backend)?;

        // The watcher is carried along so the watch stays open as long as
        // the stream is polled.
        let batches = stream::unfold(Some((watcher, responses)), |state| async move {
            let (watcher, mut responses) = state?;
            match responses.message().await {
                Ok(Some(resp)) => {
                    let events: Vec<Result<WatchEvent, StoreError>> = resp
                        .events()
                        .iter()
                        .filter_map(|event| {
                            let kv = event.kv()?;
                            let key = kv.key_str().ok()?.to_string();
                            Some(Ok(match event.event_type() {
                                EventType::Put => WatchEvent::Put {
                                    key,
                                    value: kv.value().to_vec(),
                                },
                                EventType::Delete => WatchEvent::Delete { key },
                            }))
                        })
                        .collect();
                    Some((events, Some((watcher, responses))))
                }
                Ok(None) => None,
                Err(e) => Some((vec![Err(backend(e))], None)),
            }
        });

        Ok(batches.flat_map(stream::iter).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_up_to_whole_seconds() {
        assert_eq!(ttl_seconds(Duration::from_millis(300)), 1);
        assert_eq!(ttl_seconds(Duration::from_millis(1_500)), 2);
        assert_eq!(ttl_seconds(Duration::from_secs(10)), 10);
        assert_eq!(ttl_seconds(Duration::ZERO), 1);
    }
}
