//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking for drain)
//!     → demux.rs (peek preface: HTTP/2 → RPC plane, else → web plane)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Accepts are bounded by `max_connections`
//! - Each connection tracked for graceful shutdown
//! - Sniffing peeks, never consumes, so the chosen server sees every byte

pub mod addr;
pub mod connection;
pub mod demux;
pub mod listener;
