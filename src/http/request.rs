//! Request identification and accounting.
//!
//! # Responsibilities
//! - Read the request ID assigned by `SetRequestIdLayer`
//! - Build the `x-service` identity header
//! - Record per-plane request metrics
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing (outermost layer)
//! - A client-supplied `x-request-id` is kept, not replaced

use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;

use crate::net::demux::Plane;
use crate::observability::metrics;

/// Header carrying the request correlation ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Response header identifying the serving process.
pub const X_SERVICE: &str = "x-service";

/// The request ID, or `"unknown"` when none was assigned.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// `{name}/{version}/{build}`, if it is a valid header value.
pub fn service_header(name: &str, version: &str, build: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("{}/{}/{}", name, version, build)).ok()
}

/// Count and time every request on `plane`.
pub async fn track_requests(State(plane): State<Plane>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let response = next.run(request).await;
    metrics::record_request(plane.as_str(), method.as_str(), response.status().as_u16(), start);
    response
}
