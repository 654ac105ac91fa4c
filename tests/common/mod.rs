//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::post;
use axum::Json;
use serde::{Deserialize, Serialize};
use servicekit::http::Server;
use servicekit::store::{LeaseId, StoreError, WatchStream};
use servicekit::{
    CoordinationStore, HandlerFault, MemoryStore, RunningService, Service, ServiceConfig,
    ServiceDescriptor, SharedStore,
};

pub const CALC: &str = "calc.v1.Calculator";

#[derive(Debug, Serialize, Deserialize)]
pub struct AddRequest {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddReply {
    pub sum: i64,
}

/// Config bound to an ephemeral loopback port with fast registry timings.
pub fn test_config(name: &str) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.service.name = name.to_string();
    config.service.version = "v0.0.1-test".to_string();
    config.http.address = "127.0.0.1:0".to_string();
    config.http.request_timeout_secs = 5;
    config.registry.prefix = "test/register".to_string();
    config.registry.lease_ttl_ms = 300;
    config.registry.keepalive_interval_ms = 50;
    config.registry.cooldown_ms = 100;
    config.client.dial_timeout_ms = 1_000;
    config
}

async fn add(Json(request): Json<AddRequest>) -> Result<Json<AddReply>, HandlerFault> {
    request
        .a
        .checked_add(request.b)
        .map(|sum| Json(AddReply { sum }))
        .ok_or_else(|| HandlerFault::validation("overflow"))
}

/// Register `calc.v1.Calculator/Add`.
pub fn register_calc(server: &mut Server) {
    server
        .register_rpc(
            ServiceDescriptor::new(CALC).method("Add").metadata("zone", "test"),
            post(add),
            None,
        )
        .unwrap();
}

/// Build and start a service, letting `setup` register routes first.
pub async fn start_service<F>(config: ServiceConfig, store: Option<SharedStore>, setup: F) -> RunningService
where
    F: FnOnce(&mut Server),
{
    let mut service = Service::with_store(config, store).unwrap();
    setup(service.server_mut());
    service.start().await.unwrap()
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// An HTTP/1 client that opens a new connection per request.
pub fn http1_client() -> reqwest::Client {
    reqwest::Client::builder()
        .http1_only()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}

/// An HTTP/2 prior-knowledge client, as a gRPC client would connect.
pub fn h2_client() -> reqwest::Client {
    reqwest::Client::builder()
        .http2_prior_knowledge()
        .build()
        .unwrap()
}

/// A store that panics inside the first `panics` keep-alive calls.
#[derive(Debug)]
pub struct PanickingStore {
    inner: MemoryStore,
    panics: AtomicUsize,
}

impl PanickingStore {
    pub fn new(inner: MemoryStore, panics: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            panics: AtomicUsize::new(panics),
        })
    }

    pub fn remaining_panics(&self) -> usize {
        self.panics.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationStore for PanickingStore {
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        self.inner.lease_grant(ttl).await
    }

    async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<Duration, StoreError> {
        let left = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if left.is_ok() {
            panic!("injected keep-alive panic");
        }
        self.inner.lease_keep_alive_once(lease).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
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
