//! Outbound connections to other services.
//!
//! # Data Flow
//! ```text
//! ConnectionCache::resolve(service, descriptor, endpoint?)
//!     → read lock hit → Channel
//!     → write lock, re-check, dial:
//!         static endpoint → TCP probe → Channel(single target)
//!         discovery       → resolver.rs (get_prefix + watch_prefix)
//!                           → Channel(targets) → wait until one is reachable
//! Channel::call → balancer.rs (round robin) → HTTP/2 request
//! ```
//!
//! # Design Decisions
//! - Exactly one dial per cache key, even under concurrent first use
//! - Failed dials are never cached
//! - No eviction; channels live until shutdown

pub mod balancer;
pub mod cache;
pub mod channel;
pub mod resolver;

use std::time::Duration;

use thiserror::Error;

use crate::rpc::RpcStatus;
use crate::store::StoreError;

pub use cache::ConnectionCache;
pub use channel::{read_json, Channel};

/// Error type for outbound connections.
#[derive(Debug, Error)]
pub enum DialError {
    /// No endpoint became reachable in time.
    #[error("no reachable endpoint after {0:?}")]
    Timeout(Duration),

    /// Discovery found nothing registered.
    #[error("no endpoints registered for {0}")]
    NoEndpoints(String),

    /// The TCP connection was refused or failed.
    #[error("connect to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The channel or cache was shut down.
    #[error("channel closed")]
    Closed,

    /// The endpoint string is not a dialable address.
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    /// The remote answered with a non-OK gRPC status.
    #[error("rpc failed: {0}")]
    Rpc(RpcStatus),

    /// The HTTP/2 request itself failed.
    #[error("request failed: {0}")]
    Request(String),

    /// Discovery could not read the store.
    #[error("discovery failed: {0}")]
    Store(#[from] StoreError),
}
