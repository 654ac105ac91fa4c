//! RPC plane: service registrations and the HTTP/2 router.
//!
//! # Data Flow
//! ```text
//! Server::register_rpc(descriptor, service, gateway)
//!     → validate descriptor, reject duplicates
//!     → route_service("/{name}/{method}") per method → type-erased Router
//!
//! At serve time:
//!     merge every Router → fallback UNIMPLEMENTED → recover_rpc
//!     → LocalRpc handle → each GatewayHandler builds HTTP routes
//! ```
//!
//! # Design Decisions
//! - Any `tower::Service` with `Infallible` errors can be registered, so
//!   generated gRPC servers fit without a dependency on their codegen
//! - Faults become gRPC statuses here; the web plane renders them as JSON

pub mod descriptor;
pub mod local;
pub mod status;

use std::convert::Infallible;
use std::panic::AssertUnwindSafe;

use axum::body::Body;
use axum::extract::Request;
use axum::http::Uri;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::FutureExt;

use crate::config::ConfigError;
use crate::http::request::request_id;
use crate::http::response::{panic_message, FaultInfo, HandlerFault};

pub use descriptor::ServiceDescriptor;
pub use local::LocalRpc;
pub use status::{Code, RpcStatus};

/// Builds HTTP gateway routes on top of the RPC plane.
pub type GatewayHandler = Box<dyn FnOnce(Router, LocalRpc) -> Router + Send>;

/// Box a closure as a [`GatewayHandler`].
pub fn gateway<F>(handler: F) -> Option<GatewayHandler>
where
    F: FnOnce(Router, LocalRpc) -> Router + Send + 'static,
{
    Some(Box::new(handler))
}

struct Registration {
    descriptor: ServiceDescriptor,
    router: Router,
    gateway: Option<GatewayHandler>,
}

/// Every RPC service declared on a server.
#[derive(Default)]
pub struct RpcServices {
    registrations: Vec<Registration>,
}

impl RpcServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a service. Fails on an invalid descriptor or a name that is
    /// already registered.
    pub fn register<S>(
        &mut self,
        descriptor: ServiceDescriptor,
        service: S,
        gateway: Option<GatewayHandler>,
    ) -> Result<(), ConfigError>
    where
        S: tower::Service<Request<Body>, Error = Infallible> + Clone + Send + Sync + 'static,
        S::Response: IntoResponse + 'static,
        S::Future: Send + 'static,
    {
        descriptor.validate()?;
        if self
            .registrations
            .iter()
            .any(|r| r.descriptor.name() == descriptor.name())
        {
            return Err(ConfigError::Invalid(format!(
                "rpc service {} registered twice",
                descriptor.name()
            )));
        }

        let router = if descriptor.methods().is_empty() {
            Router::new().route_service(&format!("/{}/{{method}}", descriptor.name()), service)
        } else {
            descriptor
                .methods()
                .iter()
                .fold(Router::new(), |router, method| {
                    router.route_service(&descriptor.path(method), service.clone())
                })
        };

        tracing::info!(
            service = descriptor.name(),
            methods = ?descriptor.methods(),
            gateway = gateway.is_some(),
            "RPC service registered"
        );

        self.registrations.push(Registration {
            descriptor,
            router,
            gateway,
        });
        Ok(())
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.registrations.iter().map(|r| &r.descriptor)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Assemble the RPC router and collect gateway handlers.
    pub(crate) fn into_parts(self) -> (Router, Vec<GatewayHandler>) {
        let mut router = Router::new();
        let mut gateways = Vec::new();
        for registration in self.registrations {
            router = router.merge(registration.router);
            gateways.extend(registration.gateway);
        }

        let router = router
            .fallback(unimplemented)
            .layer(axum::middleware::from_fn(recover_rpc));
        (router, gateways)
    }
}

impl std::fmt::Debug for RpcServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.registrations.iter().map(|r| r.descriptor.name()))
            .finish()
    }
}

async fn unimplemented(uri: Uri) -> RpcStatus {
    RpcStatus::new(Code::Unimplemented, format!("unknown method {}", uri.path()))
}

impl From<&HandlerFault> for RpcStatus {
    fn from(fault: &HandlerFault) -> Self {
        match fault {
            HandlerFault::Validation(message) => RpcStatus::new(Code::InvalidArgument, message.clone()),
            HandlerFault::Internal(message) => RpcStatus::new(Code::Internal, message.clone()),
        }
    }
}

/// Top-level fault recovery for the RPC plane.
async fn recover_rpc(request: Request, next: Next) -> Response {
    let request_id = request_id(request.headers());
    let path = request.uri().path().to_string();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => match response.extensions().get::<FaultInfo>() {
            Some(FaultInfo(fault)) => {
                tracing::warn!(request_id = %request_id, path = %path, error = %fault, "RPC handler failed");
                RpcStatus::from(fault).into_response()
            }
            None => response,
        },
        Err(panic) => {
            tracing::error!(
                request_id = %request_id,
                path = %path,
                panic = %panic_message(&*panic),
                "RPC handler panicked"
            );
            RpcStatus::new(Code::Internal, "internal error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode};
    use axum::routing::post;
    use tower::ServiceExt;

    fn calc() -> ServiceDescriptor {
        ServiceDescriptor::new("calc.v1.Calculator").method("AddInt")
    }

    fn call(path: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn rejects_duplicates() {
        let mut services = RpcServices::new();
        services.register(calc(), post(|| async { "ok" }), None).unwrap();
        let err = services.register(calc(), post(|| async { "ok" }), None);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
        assert_eq!(services.len(), 1);
    }

    #[tokio::test]
    async fn routes_declared_methods_only() {
        let mut services = RpcServices::new();
        services.register(calc(), post(|| async { "sum" }), None).unwrap();
        let (router, gateways) = services.into_parts();
        assert!(gateways.is_empty());

        let ok = router.clone().oneshot(call("/calc.v1.Calculator/AddInt")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert!(ok.headers().get(status::GRPC_STATUS).is_none());

        let missing = router.oneshot(call("/calc.v1.Calculator/Sub")).await.unwrap();
        let status = RpcStatus::from_headers(missing.headers()).unwrap();
        assert_eq!(status.code, Code::Unimplemented);
    }

    #[tokio::test]
    async fn wildcard_and_fault_mapping() {
        let mut services = RpcServices::new();
        services
            .register(
                ServiceDescriptor::new("faults.Svc"),
                post(|| async { Err::<(), _>(HandlerFault::validation("bad input")) }),
                None,
            )
            .unwrap();
        services
            .register(
                ServiceDescriptor::new("panics.Svc").method("Go"),
                post(|| async { panic!("boom") as () }),
                None,
            )
            .unwrap();
        let (router, _) = services.into_parts();

        let invalid = router.clone().oneshot(call("/faults.Svc/Anything")).await.unwrap();
        let status = RpcStatus::from_headers(invalid.headers()).unwrap();
        assert_eq!(status.code, Code::InvalidArgument);
        assert_eq!(status.message, "bad input");

        let panicked = router.oneshot(call("/panics.Svc/Go")).await.unwrap();
        let status = RpcStatus::from_headers(panicked.headers()).unwrap();
        assert_eq!(status.code, Code::Internal);
    }
}
