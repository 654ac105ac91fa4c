//! Client channel: a balanced HTTP/2 handle to one remote RPC service.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderValue, Method, Request, Response, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::client::balancer::{LoadBalancer, RoundRobin, Target};
use crate::client::DialError;
use crate::http::request::X_REQUEST_ID;
use crate::rpc::{Code, RpcStatus};

/// Delay between reachability sweeps while waiting for an endpoint.
const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// A cloneable handle over an HTTP/2 client and a live endpoint set.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    targets: RwLock<BTreeMap<String, Arc<Target>>>,
    changed: Notify,
    balancer: RoundRobin,
    client: Client<HttpConnector, Body>,
    dial_timeout: Duration,
    closed: watch::Sender<bool>,
    is_closed: AtomicBool,
    resolver: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub(crate) fn new(name: impl Into<String>, dial_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(dial_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build(connector);

        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                targets: RwLock::new(BTreeMap::new()),
                changed: Notify::new(),
                balancer: RoundRobin::new(),
                client,
                dial_timeout,
                closed,
                is_closed: AtomicBool::new(false),
                resolver: Mutex::new(None),
            }),
        }
    }

    /// What this channel dials, e.g. `calc/calc.v1.Calculator`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Addresses currently eligible for calls.
    pub fn endpoints(&self) -> Vec<String> {
        self.read_targets()
            .values()
            .map(|t| t.address.clone())
            .collect()
    }

    pub(crate) fn upsert(&self, target: Target) {
        let mut targets = self
            .inner
            .targets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::debug!(channel = %self.inner.name, key = %target.key, address = %target.address, "Endpoint added");
        targets.insert(target.key.clone(), Arc::new(target));
        drop(targets);
        self.inner.changed.notify_waiters();
    }

    pub(crate) fn remove(&self, key: &str) {
        let mut targets = self
            .inner
            .targets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if targets.remove(key).is_some() {
            tracing::debug!(channel = %self.inner.name, key, "Endpoint removed");
        }
        drop(targets);
        self.inner.changed.notify_waiters();
    }

    pub(crate) fn replace_all(&self, fresh: Vec<Target>) {
        let mut targets = self
            .inner
            .targets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *targets = fresh
            .into_iter()
            .map(|t| (t.key.clone(), Arc::new(t)))
            .collect();
        drop(targets);
        self.inner.changed.notify_waiters();
    }

    fn read_targets(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Target>>> {
        self.inner
            .targets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> Vec<Arc<Target>> {
        self.read_targets().values().cloned().collect()
    }

    /// Next endpoint in round-robin order.
    pub fn pick(&self) -> Result<Arc<Target>, DialError> {
        if self.is_closed() {
            return Err(DialError::Closed);
        }
        self.inner
            .balancer
            .next_target(&self.snapshot())
            .ok_or_else(|| DialError::NoEndpoints(self.inner.name.clone()))
    }

    /// Wait until some endpoint accepts a TCP connection.
    pub(crate) async fn wait_reachable(&self, timeout: Duration) -> Result<(), DialError> {
        let sweep = async {
            loop {
                let changed = self.inner.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();

                for target in self.snapshot() {
                    match probe(&target.address, self.inner.dial_timeout).await {
                        Ok(()) => return,
                        Err(e) => tracing::debug!(address = %target.address, error = %e, "Endpoint unreachable"),
                    }
                }

                tokio::select! {
                    _ = changed => {}
                    _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                }
            }
        };

        match tokio::time::timeout(timeout, sweep).await {
            Ok(()) => Ok(()),
            Err(_) if self.read_targets().is_empty() => {
                Err(DialError::NoEndpoints(self.inner.name.clone()))
            }
            Err(_) => Err(DialError::Timeout(timeout)),
        }
    }

    /// Send `request` to the next endpoint. Scheme and authority are
    /// rewritten; path, query, headers and body are kept. A request
    /// without `x-request-id` gets a fresh one.
    pub async fn call(&self, request: Request<Body>) -> Result<Response<Incoming>, DialError> {
        let target = self.pick()?;
        let (mut parts, body) = request.into_parts();

        let mut uri_parts = parts.uri.clone().into_parts();
        uri_parts.scheme = Some(Scheme::HTTP);
        uri_parts.authority = Some(
            Authority::from_str(&target.address)
                .map_err(|_| DialError::InvalidEndpoint(target.address.clone()))?,
        );
        if uri_parts.path_and_query.is_none() {
            uri_parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        parts.uri = Uri::from_parts(uri_parts)
            .map_err(|_| DialError::InvalidEndpoint(target.address.clone()))?;

        if !parts.headers.contains_key(X_REQUEST_ID) {
            if let Ok(id) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
                parts.headers.insert(X_REQUEST_ID, id);
            }
        }

        tracing::trace!(channel = %self.inner.name, uri = %parts.uri, "Calling endpoint");

        self.inner
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| DialError::Request(e.to_string()))
    }

    /// POST `payload` as JSON to `/{service}/{method}`.
    pub async fn invoke_json<T: Serialize>(
        &self,
        service: &str,
        method: &str,
        payload: &T,
    ) -> Result<Response<Incoming>, DialError> {
        let body = serde_json::to_vec(payload).map_err(|e| DialError::Request(e.to_string()))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/{}/{}", service, method))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|e| DialError::Request(e.to_string()))?;
        self.call(request).await
    }

    pub(crate) fn attach_resolver(&self, task: JoinHandle<()>) {
        let mut slot = self
            .inner
            .resolver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(task);
    }

    /// Resolve once the channel has been closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::SeqCst)
    }

    /// Stop the resolver and reject further calls.
    pub async fn close(&self) {
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.closed.send_replace(true);

        let task = self
            .inner
            .resolver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(channel = %self.inner.name, error = %e, "Resolver task failed");
            }
        }
        tracing::debug!(channel = %self.inner.name, "Channel closed");
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("endpoints", &self.endpoints())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Collect a response body and decode it as JSON.
///
/// A non-OK `grpc-status` header becomes [`DialError::Rpc`].
pub async fn read_json<T: DeserializeOwned>(response: Response<Incoming>) -> Result<T, DialError> {
    if let Some(status) = RpcStatus::from_headers(response.headers()) {
        if status.code != Code::Ok {
            return Err(DialError::Rpc(status));
        }
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| DialError::Request(e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| DialError::Request(e.to_string()))
}

/// Open and immediately drop a TCP connection to `address`.
pub(crate) async fn probe(address: &str, timeout: Duration) -> Result<(), DialError> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(source)) => Err(DialError::Connect {
            address: address.to_string(),
            source,
        }),
        Err(_) => Err(DialError::Timeout(timeout)),
    }
}

/// Reduce `host:port` or `scheme://host:port/...` to a dialable `host:port`.
pub(crate) fn normalize_endpoint(endpoint: &str) -> Result<String, DialError> {
    let invalid = || DialError::InvalidEndpoint(endpoint.to_string());

    if endpoint.contains("://") {
        let url = url::Url::parse(endpoint).map_err(|_| invalid())?;
        let host = url.host_str().ok_or_else(invalid)?;
        let port = url.port_or_known_default().ok_or_else(invalid)?;
        return Ok(format!("{}:{}", host, port));
    }

    let authority = Authority::from_str(endpoint).map_err(|_| invalid())?;
    if authority.port_u16().is_none() || authority.host().is_empty() {
        return Err(invalid());
    }
    Ok(authority.as_str().to_string())
}
