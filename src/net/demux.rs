//! Protocol demultiplexing on a shared listener.
//!
//! # Responsibilities
//! - Peek the first bytes of each accepted connection
//! - Route HTTP/2 prior-knowledge connections to the RPC plane
//! - Route everything else to the web plane
//! - Count routed connections per plane

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::net::connection::ConnectionGuard;
use crate::net::listener::ConnectionPermit;

/// HTTP/2 client connection preface (RFC 9113 §3.4).
pub const HTTP2_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// How long a client gets to send enough bytes to classify it.
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

const PARTIAL_READ_BACKOFF: Duration = Duration::from_millis(2);

/// Which sub-server a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    /// HTTP/2 prior knowledge (gRPC and friends).
    Rpc,
    /// HTTP/1.x: gateway, web routes, health, metrics.
    Web,
}

impl Plane {
    pub fn as_str(self) -> &'static str {
        match self {
            Plane::Rpc => "rpc",
            Plane::Web => "web",
        }
    }
}

/// Classify buffered bytes. `None` means more bytes are needed.
pub fn classify(prefix: &[u8]) -> Option<Plane> {
    let n = prefix.len().min(HTTP2_PREFACE.len());
    if prefix[..n] != HTTP2_PREFACE[..n] {
        return Some(Plane::Web);
    }
    if n == HTTP2_PREFACE.len() {
        Some(Plane::Rpc)
    } else {
        None
    }
}

/// Peek at `stream` until it can be classified.
///
/// A connection closed before sending anything, or one that stays silent
/// past `timeout`, goes to the web plane.
pub async fn sniff(stream: &TcpStream, timeout: Duration) -> Plane {
    let peek = async {
        let mut buf = [0u8; 24];
        loop {
            match stream.peek(&mut buf).await {
                Ok(0) => return Plane::Web,
                Ok(n) => {
                    if let Some(plane) = classify(&buf[..n]) {
                        return plane;
                    }
                    // A partial preface; peeking again returns at once.
                    tokio::time::sleep(PARTIAL_READ_BACKOFF).await;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Peek failed");
                    return Plane::Web;
                }
            }
        }
    };

    tokio::time::timeout(timeout, peek)
        .await
        .unwrap_or(Plane::Web)
}

/// A classified connection on its way to a plane's accept loop.
#[derive(Debug)]
pub struct Routed {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub plane: Plane,
    pub permit: ConnectionPermit,
    pub guard: ConnectionGuard,
}

/// Per-plane routing counters.
#[derive(Debug, Default)]
pub struct DemuxStats {
    rpc: AtomicU64,
    web: AtomicU64,
}

impl DemuxStats {
    pub fn routed(&self, plane: Plane) -> u64 {
        match plane {
            Plane::Rpc => self.rpc.load(Ordering::Relaxed),
            Plane::Web => self.web.load(Ordering::Relaxed),
        }
    }

    fn record(&self, plane: Plane) {
        match plane {
            Plane::Rpc => self.rpc.fetch_add(1, Ordering::Relaxed),
            Plane::Web => self.web.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Sending half of the demultiplexer: one channel per plane.
#[derive(Debug, Clone)]
pub struct Demux {
    rpc: mpsc::Sender<Routed>,
    web: mpsc::Sender<Routed>,
    stats: Arc<DemuxStats>,
    timeout: Duration,
}

/// Receiving halves, one per plane accept loop.
#[derive(Debug)]
pub struct PlaneReceivers {
    pub rpc: mpsc::Receiver<Routed>,
    pub web: mpsc::Receiver<Routed>,
}

impl Demux {
    /// Create a demultiplexer with bounded per-plane queues.
    pub fn new(capacity: usize, timeout: Duration) -> (Self, PlaneReceivers) {
        let (rpc_tx, rpc_rx) = mpsc::channel(capacity);
        let (web_tx, web_rx) = mpsc::channel(capacity);
        let demux = Self {
            rpc: rpc_tx,
            web: web_tx,
            stats: Arc::new(DemuxStats::default()),
            timeout,
        };
        (demux, PlaneReceivers { rpc: rpc_rx, web: web_rx })
    }

    pub fn stats(&self) -> Arc<DemuxStats> {
        Arc::clone(&self.stats)
    }

    /// Classify one connection and hand it to its plane.
    pub async fn dispatch(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: ConnectionPermit,
        guard: ConnectionGuard,
    ) {
        let plane = sniff(&stream, self.timeout).await;
        self.stats.record(plane);
        crate::observability::metrics::record_connection(plane.as_str());

        tracing::trace!(
            connection_id = %guard.id(),
            peer_addr = %peer,
            plane = plane.as_str(),
            "Connection classified"
        );

        let routed = Routed {
            stream,
            peer,
            plane,
            permit,
            guard,
        };
        let tx = match plane {
            Plane::Rpc => &self.rpc,
            Plane::Web => &self.web,
        };
        if tx.send(routed).await.is_err() {
            tracing::debug!(plane = plane.as_str(), "Plane closed, dropping connection");
        }
    }
}
