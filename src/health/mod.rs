//! Process health reporting.
//!
//! `/health` answers from process state only; it never calls the
//! coordination store or peers, so it stays green while a live upgrade
//! hands the listener over.
//!
//! The RPC plane carries the same answer as `grpc.health.v1.Health/Check`:
//! the empty service name, the service's own name and every registered RPC
//! service report `SERVING` until shutdown starts, then `NOT_SERVING`.
//! Unknown names get `NOT_FOUND`.

use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Bytes;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::lifecycle::ShutdownSignal;
use crate::rpc::{Code, RpcStatus, ServiceDescriptor};

/// Fully qualified name of the RPC health service.
pub const RPC_HEALTH_SERVICE: &str = "grpc.health.v1.Health";

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthReport {
    pub status: String,
    pub service: String,
    pub version: String,
    pub pid: u32,
}

impl HealthReport {
    pub fn healthy(service: &str, version: &str) -> Self {
        Self {
            status: "ok".to_string(),
            service: service.to_string(),
            version: version.to_string(),
            pid: std::process::id(),
        }
    }
}

/// Add `GET /health` to `router`.
pub fn routes(router: Router, service: &str, version: &str) -> Router {
    let report = HealthReport::healthy(service, version);
    router.route("/health", get(move || async move { Json(report) }))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    #[serde(default)]
    pub service: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Serving,
    NotServing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

/// Serving state behind `grpc.health.v1.Health/Check`.
#[derive(Debug, Clone)]
pub struct RpcHealth {
    known: Arc<HashSet<String>>,
    signal: ShutdownSignal,
}

impl RpcHealth {
    pub fn new<'a>(service: &str, rpc_services: impl IntoIterator<Item = &'a str>, signal: ShutdownSignal) -> Self {
        let mut known: HashSet<String> = rpc_services.into_iter().map(str::to_string).collect();
        known.insert(String::new());
        known.insert(service.to_string());
        Self {
            known: Arc::new(known),
            signal,
        }
    }

    pub fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new(RPC_HEALTH_SERVICE).method("Check")
    }

    pub fn check(&self, service: &str) -> Result<ServingStatus, RpcStatus> {
        if !self.known.contains(service) {
            return Err(RpcStatus::new(Code::NotFound, format!("unknown service {service}")));
        }
        Ok(if self.signal.is_triggered() {
            ServingStatus::NotServing
        } else {
            ServingStatus::Serving
        })
    }

    /// The `Check` method as a routable service. An empty body asks about
    /// the server as a whole.
    pub fn into_service(self) -> MethodRouter {
        post(move |body: Bytes| async move {
            let request = if body.is_empty() {
                HealthCheckRequest::default()
            } else {
                match serde_json::from_slice::<HealthCheckRequest>(&body) {
                    Ok(request) => request,
                    Err(e) => return RpcStatus::new(Code::InvalidArgument, e.to_string()).into_response(),
                }
            };
            respond(self.check(&request.service))
        })
    }
}

fn respond(result: Result<ServingStatus, RpcStatus>) -> Response {
    match result {
        Ok(status) => Json(HealthCheckResponse { status }).into_response(),
        Err(status) => status.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn reports_identity_and_pid() {
        let app = routes(Router::new(), "calc", "v1.2.3");
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let report: HealthReport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report.service, "calc");
        assert_eq!(report.version, "v1.2.3");
        assert_eq!(report.pid, std::process::id());
    }

    #[tokio::test]
    async fn rpc_check_follows_shutdown() {
        let shutdown = Shutdown::new();
        let health = RpcHealth::new("calc", ["calc.v1.Calculator"], shutdown.subscribe());

        assert_eq!(health.check(""), Ok(ServingStatus::Serving));
        assert_eq!(health.check("calc"), Ok(ServingStatus::Serving));
        assert_eq!(health.check("calc.v1.Calculator"), Ok(ServingStatus::Serving));
        assert_eq!(health.check("ghost").unwrap_err().code, Code::NotFound);

        shutdown.trigger();
        assert_eq!(health.check(""), Ok(ServingStatus::NotServing));
    }

    #[tokio::test]
    async fn rpc_check_accepts_empty_body() {
        let shutdown = Shutdown::new();
        let app = Router::new().route_service(
            "/grpc.health.v1.Health/Check",
            RpcHealth::new("calc", std::iter::empty(), shutdown.subscribe()).into_service(),
        );
        let response = app
            .oneshot(
                Request::post("/grpc.health.v1.Health/Check")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let reply: HealthCheckResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply.status, ServingStatus::Serving);
    }
}
