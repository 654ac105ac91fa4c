//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config)
//!     → /metrics on the web plane (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through both planes as `x-request-id`
//! - Metrics are cheap (atomic increments)
//! - Both initializers are idempotent so tests can call them freely

pub mod logging;
pub mod metrics;
