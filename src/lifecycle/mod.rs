//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGUSR2/SIGHUP → Upgrader::upgrade
//!     SIGINT/SIGTERM/SIGQUIT → Upgrader::stop
//!
//! Upgrade (upgrade.rs):
//!     Ready → UpgradeRequested → Upgrading → Upgraded | back to Ready
//!
//! Shutdown (shutdown.rs):
//!     Upgraded/Stopped → trigger signal → run hooks concurrently → exit
//! ```
//!
//! # Design Decisions
//! - Listener is inherited across upgrades, never re-bound
//! - Shutdown has no deadline: every hook is awaited

pub mod shutdown;
pub mod signals;
pub mod upgrade;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use upgrade::{UpgradeError, UpgradeState, Upgrader};
