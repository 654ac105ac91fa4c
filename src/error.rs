//! Crate-wide error types.
//!
//! Fatal classes (`Config`, `Bind`) stop the process after logging.
//! `Dial` is returned to callers of `ConnectionCache::resolve`. Store and
//! lease failures are handled inside the registry and never surface here
//! unless they happen during startup.

use thiserror::Error;

use crate::net::listener::ListenerError;

pub use crate::client::DialError;
pub use crate::config::loader::ConfigError;
pub use crate::lifecycle::upgrade::UpgradeError;
pub use crate::store::StoreError;

/// Top-level error returned by [`crate::Service`] operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listening socket could not be bound or inherited.
    #[error("bind error: {0}")]
    Bind(#[source] std::io::Error),

    /// An outbound connection could not be established.
    #[error("dial error: {0}")]
    Dial(#[from] DialError),

    /// The coordination store rejected an operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A live upgrade failed.
    #[error("upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),

    /// Any other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<ListenerError> for Error {
    fn from(err: ListenerError) -> Self {
        match err {
            ListenerError::Bind(e) | ListenerError::Accept(e) => Error::Bind(e),
        }
    }
}
