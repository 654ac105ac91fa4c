//! Coordination store subsystem.
//!
//! # Data Flow
//! ```text
//! registry (writer)                         client::resolver (reader)
//!     lease_grant / keep_alive_once             get_prefix
//!     put(key, Endpoint, lease)                 watch_prefix → WatchEvent stream
//!     delete(key)                                     │
//!            │                                        │
//!            └──────────► CoordinationStore ◄─────────┘
//!                           ├── memory.rs (in-process, TTL + watches)
//!                           └── etcd.rs   (feature "etcd")
//! ```
//!
//! # Design Decisions
//! - The store is an external collaborator; the core only talks to the trait
//! - Values are JSON-encoded [`Endpoint`]s using the etcd naming layout
//! - Watch streams carry raw key/value events; decoding happens in the reader

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;

/// Identifier of a lease granted by the store.
pub type LeaseId = i64;

/// Stream of changes under a watched prefix.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn CoordinationStore>;

/// Errors returned by store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("coordination store unavailable")]
    Unavailable,

    /// The lease is unknown to the store, usually because it expired.
    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),

    /// Backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

/// A single change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was created or overwritten.
    Put { key: String, value: Vec<u8> },
    /// A key was deleted or its lease expired.
    Delete { key: String },
}

impl WatchEvent {
    /// The key this event refers to.
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

/// The operations the core needs from a distributed key-value store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    /// Grant a lease that expires after `ttl` unless kept alive.
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Renew `lease` once, returning its remaining TTL.
    async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<Duration, StoreError>;

    /// Write `value` at `key`, optionally bound to `lease`. Overwrites.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Every key/value pair whose key starts with `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Changes to keys under `prefix` from now on.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError>;
}

/// One reachable instance of a service, as stored under a registration key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Address to dial, `host:port`.
    #[serde(rename = "Addr")]
    pub address: String,

    /// Free-form metadata copied from the service descriptor.
    #[serde(rename = "Metadata", default, deserialize_with = "null_as_empty")]
    pub metadata: BTreeMap<String, String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Encode for storage.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Decode a stored value.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uses_naming_layout() {
        let mut endpoint = Endpoint::new("10.0.0.1:5001");
        endpoint.metadata.insert("zone".into(), "a".into());

        let json: serde_json::Value = serde_json::from_slice(&endpoint.encode().unwrap()).unwrap();
        assert_eq!(json["Addr"], "10.0.0.1:5001");
        assert_eq!(json["Metadata"]["zone"], "a");
    }

    #[test]
    fn endpoint_decodes_without_metadata() {
        let endpoint = Endpoint::decode(br#"{"Op":0,"Addr":"127.0.0.1:9000"}"#).unwrap();
        assert_eq!(endpoint.address, "127.0.0.1:9000");
        assert!(endpoint.metadata.is_empty());

        let endpoint =
            Endpoint::decode(br#"{"Op":0,"Addr":"127.0.0.1:9000","Metadata":null}"#).unwrap();
        assert_eq!(endpoint.address, "127.0.0.1:9000");
        assert!(endpoint.metadata.is_empty());
        assert!(Endpoint::decode(b"nope").is_err());
    }
}
