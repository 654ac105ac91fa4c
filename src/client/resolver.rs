//! Store-backed endpoint discovery for a [`Channel`].
//!
//! # Responsibilities
//! - Seed the channel from the current keys under a service prefix
//! - Follow put/delete events until the channel closes or shutdown fires
//! - Re-subscribe and re-list after the watch stream fails or ends

use std::time::Duration;

use futures_util::stream::{self, StreamExt};

use crate::client::balancer::Target;
use crate::client::{Channel, DialError};
use crate::lifecycle::ShutdownSignal;
use crate::store::{Endpoint, SharedStore, WatchEvent, WatchStream};

/// Pause before re-subscribing after a broken watch.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

fn decode(key: &str, value: &[u8]) -> Option<Target> {
    match Endpoint::decode(value) {
        Ok(endpoint) => Some(Target {
            key: key.to_string(),
            address: endpoint.address,
            metadata: endpoint.metadata,
        }),
        Err(e) => {
            tracing::warn!(key, error = %e, "Skipping undecodable endpoint");
            None
        }
    }
}

/// Subscribe, then list, so no change between the two is lost.
async fn subscribe(store: &SharedStore, prefix: &str, channel: &Channel) -> Result<WatchStream, DialError> {
    let events = store.watch_prefix(prefix).await?;
    let current = store.get_prefix(prefix).await?;
    let targets: Vec<Target> = current
        .iter()
        .filter_map(|(key, value)| decode(key, value))
        .collect();

    tracing::debug!(prefix, endpoints = targets.len(), "Discovered endpoints");
    channel.replace_all(targets);
    Ok(events)
}

fn apply(channel: &Channel, event: WatchEvent) {
    match event {
        WatchEvent::Put { key, value } => {
            if let Some(target) = decode(&key, &value) {
                channel.upsert(target);
            }
        }
        WatchEvent::Delete { key } => channel.remove(&key),
    }
}

/// Seed `channel` from `prefix` and attach a task that keeps it current.
pub async fn start(
    store: SharedStore,
    prefix: String,
    channel: Channel,
    mut signal: ShutdownSignal,
) -> Result<(), DialError> {
    let mut events = subscribe(&store, &prefix, &channel).await?;

    let task_channel = channel.clone();
    let task = tokio::spawn(async move {
        let channel = task_channel;
        loop {
            let event = tokio::select! {
                _ = channel.closed() => break,
                _ = signal.recv() => break,
                event = events.next() => event,
            };
            match event {
                Some(Ok(event)) => {
                    apply(&channel, event);
                    continue;
                }
                Some(Err(e)) => {
                    tracing::warn!(prefix = %prefix, error = %e, "Watch failed, re-subscribing");
                }
                None => tracing::warn!(prefix = %prefix, "Watch stream ended, re-subscribing"),
            }

            // Events may have been missed: re-list before following again.
            events = stream::empty().boxed();
            tokio::select! {
                _ = channel.closed() => break,
                _ = signal.recv() => break,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
            match subscribe(&store, &prefix, &channel).await {
                Ok(fresh) => events = fresh,
                Err(e) => tracing::warn!(prefix = %prefix, error = %e, "Re-subscribe failed"),
            }
        }
        tracing::debug!(prefix = %prefix, "Resolver stopped");
    });

    channel.attach_resolver(task);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn follows_puts_and_deletes() {
        let memory = MemoryStore::new();
        let store: SharedStore = Arc::new(memory.clone());
        let shutdown = Shutdown::new();

        let a = Endpoint::new("127.0.0.1:7001").encode().unwrap();
        store.put("reg/calc/Svc/a", a, None).await.unwrap();

        let channel = Channel::new("calc/Svc", Duration::from_millis(100));
        start(store.clone(), "reg/calc/Svc".into(), channel.clone(), shutdown.subscribe())
            .await
            .unwrap();
        assert_eq!(channel.endpoints(), vec!["127.0.0.1:7001".to_string()]);

        let b = Endpoint::new("127.0.0.1:7002").encode().unwrap();
        store.put("reg/calc/Svc/b", b, None).await.unwrap();
        store.put("reg/other/Svc/c", Endpoint::new("x:1").encode().unwrap(), None).await.unwrap();
        store.delete("reg/calc/Svc/a").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while channel.endpoints() != vec!["127.0.0.1:7002".to_string()] {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        channel.close().await;
    }

    #[tokio::test]
    async fn lagged_watch_is_repaired_by_relisting() {
        let memory = MemoryStore::new();
        let store: SharedStore = Arc::new(memory.clone());
        let shutdown = Shutdown::new();

        for (key, address) in [("reg/calc/Svc/a", "127.0.0.1:7001"), ("reg/calc/Svc/b", "127.0.0.1:7002")] {
            store.put(key, Endpoint::new(address).encode().unwrap(), None).await.unwrap();
        }
        let channel = Channel::new("calc/Svc", Duration::from_millis(100));
        start(store.clone(), "reg/calc/Svc".into(), channel.clone(), shutdown.subscribe())
            .await
            .unwrap();
        assert_eq!(channel.endpoints().len(), 2);

        // None of these await, so the resolver task falls behind the buffer
        // and the delete is lost from its stream.
        for i in 0..1100 {
            store.put(&format!("other/{i}"), b"x".to_vec(), None).await.unwrap();
        }
        store.delete("reg/calc/Svc/a").await.unwrap();
        for i in 0..1100 {
            store.put(&format!("other/{i}"), b"y".to_vec(), None).await.unwrap();
        }

        tokio::time::timeout(RESUBSCRIBE_DELAY * 3, async {
            while channel.endpoints() != vec!["127.0.0.1:7002".to_string()] {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        channel.close().await;
    }
}
