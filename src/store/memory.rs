//! In-process coordination store.
//!
//! Implements leases with TTL expiry, prefix reads and prefix watches with
//! the same observable semantics the registry and resolver rely on from a
//! real cluster. Used by tests and single-node deployments.
//!
//! Lease expiry is evaluated lazily at the start of every operation, so an
//! expired lease's keys disappear (and watchers see `Delete`) on the next
//! access after the deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::store::{CoordinationStore, LeaseId, StoreError, WatchEvent, WatchStream};

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
    next_lease: AtomicI64,
}

/// A thread-safe, cloneable in-memory store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                available: AtomicBool::new(true),
                next_lease: AtomicI64::new(1),
            }),
        }
    }

    /// Simulate the store becoming unreachable (`false`) or recovering.
    ///
    /// While unavailable every operation fails with
    /// [`StoreError::Unavailable`]; leases keep ticking toward expiry.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        tracing::debug!(available, "Memory store availability changed");
    }

    /// Lease currently bound to `key`, if the key exists.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.lock();
        self.expire(&mut state);
        state.kvs.get(key).and_then(|e| e.lease)
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        let mut state = self.lock();
        self.expire(&mut state);
        state.leases.len()
    }

    /// Revoke a lease immediately, deleting every key bound to it.
    pub fn revoke(&self, lease: LeaseId) {
        let mut state = self.lock();
        state.leases.remove(&lease);
        self.drop_keys_of(&mut state, &[lease]);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn expire(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        if expired.is_empty() {
            return;
        }
        for id in &expired {
            state.leases.remove(id);
            tracing::debug!(lease = id, "Lease expired");
        }
        self.drop_keys_of(state, &expired);
    }

    fn drop_keys_of(&self, state: &mut State, leases: &[LeaseId]) {
        let doomed: Vec<String> = state
            .kvs
            .iter()
            .filter(|(_, e)| e.lease.is_some_and(|l| leases.contains(&l)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            state.kvs.remove(&key);
            let _ = self.inner.events.send(WatchEvent::Delete { key });
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        self.check_available()?;
        let id = self.inner.next_lease.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        self.expire(&mut state);
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<Duration, StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        self.expire(&mut state);
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        entry.deadline = Instant::now() + entry.ttl;
        Ok(entry.ttl)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        self.expire(&mut state);
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }
        state.kvs.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        let _ = self.inner.events.send(WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        self.expire(&mut state);
        if state.kvs.remove(key).is_some() {
            let _ = self.inner.events.send(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        self.expire(&mut state);
        Ok(state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        self.check_available()?;
        let rx = self.inner.events.subscribe();
        let prefix = prefix.to_string();

        // A lagged receiver has lost events: report the gap once, then end.
        let events = stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), Some(rx))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Watch stream lagged");
                        let err = StoreError::Backend(format!("watch lagged, {skipped} events skipped"));
                        return Some((Err(err), None));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event: &Result<WatchEvent, StoreError>| {
            let keep = match event {
                Ok(event) => event.key().starts_with(prefix.as_str()),
                Err(_) => true,
            };
            std::future::ready(keep)
        });

        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryStore::new();
        store.put("svc/a/1", b"one".to_vec(), None).await.unwrap();
        store.put("svc/a/2", b"two".to_vec(), None).await.unwrap();
        store.put("svc/b/1", b"other".to_vec(), None).await.unwrap();

        let found = store.get_prefix("svc/a/").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], ("svc/a/1".to_string(), b"one".to_vec()));

        store.delete("svc/a/1").await.unwrap();
        store.delete("svc/a/missing").await.unwrap();
        assert_eq!(store.get_prefix("svc/a/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn put_overwrites() {
        let store = MemoryStore::new();
        store.put("k", b"v1".to_vec(), None).await.unwrap();
        store.put("k", b"v2".to_vec(), None).await.unwrap();
        assert_eq!(store.get_prefix("k").await.unwrap(), vec![("k".to_string(), b"v2".to_vec())]);
    }

    #[tokio::test]
    async fn lease_expiry_removes_keys() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(Duration::from_millis(50)).await.unwrap();
        store.put("svc/x", b"v".to_vec(), Some(lease)).await.unwrap();
        assert_eq!(store.lease_of("svc/x"), Some(lease));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get_prefix("svc/").await.unwrap().is_empty());
        assert_eq!(
            store.lease_keep_alive_once(lease).await,
            Err(StoreError::LeaseNotFound(lease))
        );
    }

    #[tokio::test]
    async fn keep_alive_extends_lease() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(Duration::from_millis(100)).await.unwrap();
        store.put("svc/x", b"v".to_vec(), Some(lease)).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.lease_keep_alive_once(lease).await.unwrap();
        }
        assert_eq!(store.get_prefix("svc/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_everything() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert_eq!(
            store.lease_grant(Duration::from_secs(1)).await,
            Err(StoreError::Unavailable)
        );
        assert_eq!(store.delete("k").await, Err(StoreError::Unavailable));

        store.set_available(true);
        assert!(store.lease_grant(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn watch_sees_prefix_changes_only() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("svc/a/").await.unwrap();

        store.put("svc/b/1", b"x".to_vec(), None).await.unwrap();
        store.put("svc/a/1", b"y".to_vec(), None).await.unwrap();
        store.delete("svc/a/1").await.unwrap();

        assert_eq!(
            watch.next().await.unwrap().unwrap(),
            WatchEvent::Put {
                key: "svc/a/1".into(),
                value: b"y".to_vec()
            }
        );
        assert_eq!(
            watch.next().await.unwrap().unwrap(),
            WatchEvent::Delete { key: "svc/a/1".into() }
        );
    }

    #[tokio::test]
    async fn revoke_deletes_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(Duration::from_secs(10)).await.unwrap();
        store.put("a", b"1".to_vec(), Some(lease)).await.unwrap();
        store.put("b", b"2".to_vec(), None).await.unwrap();

        store.revoke(lease);
        assert_eq!(store.lease_count(), 0);
        let keys: Vec<_> = store.get_prefix("").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b"]);
    }

    #[tokio::test]
    async fn lagging_watch_reports_gap_and_ends() {
        let store = MemoryStore::new();
        store.put("svc/a/1", b"v".to_vec(), None).await.unwrap();
        let mut watch = store.watch_prefix("svc/a/").await.unwrap();

        // Unrelated traffic overflows the shared buffer before the delete.
        for i in 0..WATCH_CAPACITY + 100 {
            store.put(&format!("other/{i}"), b"x".to_vec(), None).await.unwrap();
        }
        store.delete("svc/a/1").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, Err(StoreError::Backend(_))));
        assert!(watch.next().await.is_none());
    }
}
