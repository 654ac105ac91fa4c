//! Dual-protocol HTTP server setup.
//!
//! # Responsibilities
//! - Collect RPC registrations and collaborator web routes
//! - Build the RPC router and the HTTP (gateway + web) router
//! - Wire up middleware (request ID, identity header, trace, timeout, metrics)
//! - Run the accept loop and one serve loop per plane
//! - Drain connections on shutdown
//!
//! # Data Flow
//! ```text
//! Listener::accept → track → Demux::dispatch (peek preface)
//!     ├── Plane::Rpc → http2 connection → RPC router
//!     └── Plane::Web → http1 connection → gateway router ─fallback→ web router
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use hyper::server::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::sync::mpsc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{ConfigError, HttpConfig, ServiceConfig};
use crate::health::{self, RpcHealth};
use crate::http::request::{service_header, track_requests, X_SERVICE};
use crate::http::response::{not_found, recover_web};
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::net::connection::ConnectionTracker;
use crate::net::demux::{Demux, DemuxStats, Plane, Routed, SNIFF_TIMEOUT};
use crate::net::listener::Listener;
use crate::observability::metrics;
use crate::rpc::{GatewayHandler, LocalRpc, RpcServices, ServiceDescriptor};

/// Per-plane queue depth between the demultiplexer and the serve loops.
const PLANE_QUEUE: usize = 1024;

/// Pause after a failed accept (e.g. EMFILE) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Grace period after shutdown fires during which bytes already sent by a
/// client still become a served request.
const DRAIN_SETTLE: Duration = Duration::from_millis(250);

/// The dual-protocol server, before it starts serving.
pub struct Server {
    name: String,
    version: String,
    identity: HeaderValue,
    http: HttpConfig,
    metrics_enabled: bool,
    rpc: RpcServices,
    web: Router,
    tracker: ConnectionTracker,
}

impl Server {
    /// Create a server. `tracker` counts every connection it accepts.
    pub fn new(config: &ServiceConfig, tracker: ConnectionTracker) -> Self {
        let service = &config.service;
        Self {
            name: service.name.clone(),
            version: service.version.clone(),
            identity: service_header(&service.name, &service.version, &service.build)
                .unwrap_or_else(|| HeaderValue::from_static("servicekit")),
            http: config.http.clone(),
            metrics_enabled: config.observability.metrics_enabled,
            rpc: RpcServices::new(),
            web: Router::new(),
            tracker,
        }
    }

    /// Declare an RPC service, optionally with an HTTP gateway.
    pub fn register_rpc<S>(
        &mut self,
        descriptor: ServiceDescriptor,
        service: S,
        gateway: Option<GatewayHandler>,
    ) -> Result<(), ConfigError>
    where
        S: tower::Service<Request<Body>, Error = std::convert::Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: IntoResponse + 'static,
        S::Future: Send + 'static,
    {
        self.rpc.register(descriptor, service, gateway)
    }

    /// The collaborator-owned web router.
    pub fn web(&self) -> &Router {
        &self.web
    }

    /// Add routes to the web router.
    pub fn route_web<F>(&mut self, build: F)
    where
        F: FnOnce(Router) -> Router,
    {
        let web = std::mem::take(&mut self.web);
        self.web = build(web);
    }

    /// Descriptors of every registered RPC service.
    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        self.rpc.descriptors().cloned().collect()
    }

    /// Start serving on `listener`.
    ///
    /// Registers an `http-server` shutdown hook that stops accepting and
    /// waits for every connection to finish.
    pub fn start(self, listener: Listener, shutdown: &Shutdown) -> std::io::Result<ServerHandle> {
        let local_addr = listener.local_addr()?;
        let rpc_services: Vec<String> = self.rpc.descriptors().map(|d| d.name().to_string()).collect();

        let mut rpc = self.rpc;
        let rpc_health = RpcHealth::new(
            &self.name,
            rpc_services.iter().map(String::as_str),
            shutdown.subscribe(),
        );
        if let Err(e) = rpc.register(RpcHealth::descriptor(), rpc_health.into_service(), None) {
            tracing::warn!(error = %e, "RPC health service not installed");
        }

        let (rpc_router, gateways) = rpc.into_parts();
        let local = LocalRpc::new(rpc_router.clone());
        let gateway_router = gateways
            .into_iter()
            .fold(Router::new(), |router, gateway| gateway(router, local.clone()));

        let mut web = health::routes(self.web, &self.name, &self.version);
        if self.metrics_enabled && metrics::init_metrics().is_some() {
            web = web.route("/metrics", get(metrics_handler));
        }
        let web = web.fallback(not_found);

        let http_app = with_common_layers(
            with_timeout(
                gateway_router
                    .fallback_service(web)
                    .layer(axum::middleware::from_fn(recover_web)),
                self.http.request_timeout(),
            ),
            Plane::Web,
            self.identity.clone(),
        );
        let rpc_app = with_common_layers(rpc_router, Plane::Rpc, self.identity);

        let (demux, planes) = Demux::new(PLANE_QUEUE, SNIFF_TIMEOUT);
        let stats = demux.stats();
        let signal = shutdown.subscribe();
        let header_timeout = self.http.read_header_timeout();

        let accept = tokio::spawn(accept_loop(
            listener,
            demux,
            self.tracker.clone(),
            signal.clone(),
        ));
        let rpc_loop = tokio::spawn(plane_loop(planes.rpc, rpc_app, header_timeout, signal.clone()));
        let web_loop = tokio::spawn(plane_loop(planes.web, http_app, header_timeout, signal));

        let tracker = self.tracker.clone();
        shutdown.add_hook("http-server", move || async move {
            for task in [accept, rpc_loop, web_loop] {
                if let Err(e) = task.await {
                    tracing::error!(error = %e, "Server task failed");
                }
            }
            tracker.wait_idle().await;
            tracing::info!("HTTP server drained");
        });

        tracing::info!(
            address = %local_addr,
            rpc_services = ?rpc_services,
            "Server started"
        );

        Ok(ServerHandle {
            local_addr,
            stats,
            tracker: self.tracker,
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("address", &self.http.address)
            .field("rpc", &self.rpc)
            .finish_non_exhaustive()
    }
}

/// Handle to a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    stats: Arc<DemuxStats>,
    tracker: ConnectionTracker,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections routed to `plane` so far.
    pub fn routed(&self, plane: Plane) -> u64 {
        self.stats.routed(plane)
    }

    /// Connections currently open.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

#[allow(deprecated)]
fn with_timeout(router: Router, timeout: Duration) -> Router {
    router.layer(TimeoutLayer::new(timeout))
}

fn with_common_layers(router: Router, plane: Plane, identity: HeaderValue) -> Router {
    router
        .layer(axum::middleware::from_fn_with_state(plane, track_requests))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(X_SERVICE),
            identity,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn accept_loop(
    listener: Listener,
    demux: Demux,
    tracker: ConnectionTracker,
    mut signal: ShutdownSignal,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = signal.recv() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer, permit)) => {
                let guard = tracker.track();
                let demux = demux.clone();
                tokio::spawn(async move {
                    demux.dispatch(stream, peer, permit, guard).await;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    tracing::info!("Stopped accepting connections");
}

async fn plane_loop(
    mut connections: mpsc::Receiver<Routed>,
    app: Router,
    header_timeout: Duration,
    signal: ShutdownSignal,
) {
    while let Some(routed) = connections.recv().await {
        tokio::spawn(serve_connection(
            routed,
            app.clone(),
            header_timeout,
            signal.clone(),
        ));
    }
}

/// Drive a hyper connection until it finishes, shutting it down gracefully
/// once the signal fires.
macro_rules! serve_until_drained {
    ($conn:expr, $signal:ident) => {{
        let conn = $conn;
        tokio::pin!(conn);
        tokio::select! {
            result = conn.as_mut() => result,
            _ = $signal.recv() => {
                match tokio::time::timeout(DRAIN_SETTLE, conn.as_mut()).await {
                    Ok(result) => result,
                    Err(_) => {
                        conn.as_mut().graceful_shutdown();
                        conn.as_mut().await
                    }
                }
            }
        }
    }};
}

async fn serve_connection(
    routed: Routed,
    app: Router,
    header_timeout: Duration,
    mut signal: ShutdownSignal,
) {
    let Routed {
        stream,
        peer,
        plane,
        permit,
        guard,
    } = routed;

    let io = TokioIo::new(stream);
    let service = TowerToHyperService::new(app);

    let result = match plane {
        Plane::Rpc => serve_until_drained!(
            http2::Builder::new(TokioExecutor::new())
                .timer(TokioTimer::new())
                .serve_connection(io, service),
            signal
        ),
        Plane::Web => serve_until_drained!(
            http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(header_timeout)
                .keep_alive(true)
                .serve_connection(io, service),
            signal
        ),
    };

    if let Err(e) = result {
        tracing::debug!(
            connection_id = %guard.id(),
            peer_addr = %peer,
            plane = plane.as_str(),
            error = %e,
            "Connection closed with error"
        );
    }

    drop(permit);
    drop(guard);
}
