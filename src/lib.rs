//! Service runtime: one listener serving an HTTP/2 RPC plane and an HTTP/1
//! web plane, live upgrades by listener hand-off, lease-based registration
//! in a coordination store and cached, discovered outbound channels.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod rpc;
pub mod service;

// Discovery
pub mod client;
pub mod registry;
pub mod store;

// Cross-cutting concerns
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod observability;

pub use client::{Channel, ConnectionCache, DialError};
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use http::{ErrorBody, HandlerFault};
pub use lifecycle::{Shutdown, UpgradeState};
pub use net::demux::Plane;
pub use rpc::{gateway, LocalRpc, RpcStatus, ServiceDescriptor};
pub use service::{RunningService, Service};
pub use store::{CoordinationStore, Endpoint, MemoryStore, SharedStore};
