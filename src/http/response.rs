//! Handler faults and the JSON error envelope.
//!
//! # Responsibilities
//! - Define [`HandlerFault`], the error type handlers on either plane return
//! - Recover panics and faults at the top of the web plane
//! - Render every web-plane error as `{status, message, request_id}`
//!
//! # Design Decisions
//! - A fault renders to a placeholder response tagged with [`FaultInfo`];
//!   each plane's recovery middleware decides the final wire format
//! - Panic payloads are logged, never sent to clients

use std::any::Any;
use std::panic::AssertUnwindSafe;

use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::request::request_id;

/// A failure raised by a handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerFault {
    /// The request was malformed or failed validation.
    #[error("{0}")]
    Validation(String),
    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl HandlerFault {
    pub fn validation(message: impl Into<String>) -> Self {
        HandlerFault::Validation(message.into())
    }

    pub fn internal(error: impl std::fmt::Display) -> Self {
        HandlerFault::Internal(error.to_string())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, HandlerFault::Validation(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            HandlerFault::Validation(_) => StatusCode::BAD_REQUEST,
            HandlerFault::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Marker left on a response produced from a [`HandlerFault`].
#[derive(Debug, Clone)]
pub struct FaultInfo(pub HandlerFault);

impl IntoResponse for HandlerFault {
    fn into_response(self) -> Response {
        let mut response = self.status().into_response();
        response.extensions_mut().insert(FaultInfo(self));
        response
    }
}

/// JSON error body used on the web plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub status: u16,
    pub message: String,
    pub request_id: String,
}

/// Build the JSON error envelope.
pub fn error_response(status: StatusCode, message: impl Into<String>, request_id: String) -> Response {
    let body = ErrorBody {
        status: status.as_u16(),
        message: message.into(),
        request_id,
    };
    (status, Json(body)).into_response()
}

/// Best-effort text of a panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Top-level fault recovery for the web plane.
pub async fn recover_web(request: Request, next: Next) -> Response {
    let request_id = request_id(request.headers());
    let path = request.uri().path().to_string();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => match response.extensions().get::<FaultInfo>() {
            Some(FaultInfo(fault)) => {
                if fault.is_validation() {
                    tracing::debug!(request_id = %request_id, path = %path, error = %fault, "Rejected request");
                } else {
                    tracing::error!(request_id = %request_id, path = %path, error = %fault, "Handler failed");
                }
                error_response(fault.status(), fault.to_string(), request_id)
            }
            None => response,
        },
        Err(panic) => {
            tracing::error!(
                request_id = %request_id,
                path = %path,
                panic = %panic_message(&*panic),
                "Handler panicked"
            );
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
                request_id,
            )
        }
    }
}

/// Web-plane fallback: JSON 404.
pub async fn not_found(headers: HeaderMap) -> Response {
    error_response(StatusCode::NOT_FOUND, "not found", request_id(&headers))
}
