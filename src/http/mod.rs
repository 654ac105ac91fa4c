//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Demultiplexed connection
//!     → server.rs (hyper http1/http2 connection, per plane)
//!     → request.rs (request ID, identity header, metrics)
//!     → gateway routes → web routes (/health, /metrics, collaborator routes)
//!     → response.rs (fault recovery, JSON error envelope)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{X_REQUEST_ID, X_SERVICE};
pub use response::{ErrorBody, HandlerFault};
pub use server::{Server, ServerHandle};
