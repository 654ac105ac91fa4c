//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGUSR2, SIGHUP, SIGINT, SIGTERM, SIGQUIT)
//! - Translate signals to internal events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGUSR2/SIGHUP request a live upgrade, not a reload
//! - Everything else requests a graceful stop
//! - Non-unix targets only see Ctrl-C, mapped to stop

use std::io;

/// What a received signal asks the process to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Replace this process with a fresh copy (SIGUSR2, SIGHUP).
    Upgrade,
    /// Shut down gracefully (SIGINT, SIGTERM, SIGQUIT).
    Stop,
}

/// Stream of process signals.
#[cfg(unix)]
pub struct Signals {
    usr2: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    term: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    /// Install handlers. Must be called from within a Tokio runtime.
    pub fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            usr2: signal(SignalKind::user_defined2())?,
            hup: signal(SignalKind::hangup())?,
            int: signal(SignalKind::interrupt())?,
            term: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Wait for the next signal. `None` once every handler is gone.
    pub async fn recv(&mut self) -> Option<ProcessSignal> {
        tokio::select! {
            Some(()) = self.usr2.recv() => Some(ProcessSignal::Upgrade),
            Some(()) = self.hup.recv() => Some(ProcessSignal::Upgrade),
            Some(()) = self.int.recv() => Some(ProcessSignal::Stop),
            Some(()) = self.term.recv() => Some(ProcessSignal::Stop),
            Some(()) = self.quit.recv() => Some(ProcessSignal::Stop),
            else => None,
        }
    }
}

/// Stream of process signals.
#[cfg(not(unix))]
pub struct Signals {
    _priv: (),
}

#[cfg(not(unix))]
impl Signals {
    pub fn new() -> io::Result<Self> {
        Ok(Self { _priv: () })
    }

    pub async fn recv(&mut self) -> Option<ProcessSignal> {
        tokio::signal::ctrl_c().await.ok().map(|()| ProcessSignal::Stop)
    }
}
