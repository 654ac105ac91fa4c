//! In-process access to the RPC plane.

use axum::body::Body;
use axum::http::{header, Method, Request};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde::Serialize;
use tower::ServiceExt;

use crate::http::response::HandlerFault;

/// Handle that dispatches requests straight into the RPC router, without
/// a network hop. Handed to gateway handlers.
#[derive(Clone)]
pub struct LocalRpc {
    router: Router,
}

impl LocalRpc {
    pub(crate) fn new(router: Router) -> Self {
        Self { router }
    }

    /// Dispatch a request as if it had arrived on the RPC plane.
    pub async fn call(&self, request: Request<Body>) -> Response {
        match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    /// POST `payload` as JSON to `/{service}/{method}`.
    pub async fn invoke_json<T: Serialize>(
        &self,
        service: &str,
        method: &str,
        payload: &T,
    ) -> Response {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => return HandlerFault::internal(e).into_response(),
        };
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/{}/{}", service, method))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body));

        match request {
            Ok(request) => self.call(request).await,
            Err(e) => HandlerFault::validation(e.to_string()).into_response(),
        }
    }
}

impl std::fmt::Debug for LocalRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRpc").finish_non_exhaustive()
    }
}
