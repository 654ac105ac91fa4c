//! Zero-downtime live upgrade.
//!
//! # Data Flow
//! ```text
//! parent                                   child (re-exec of current_exe)
//!   SIGUSR2/SIGHUP
//!   dup(listener fd), clear CLOEXEC
//!   socketpair() for readiness
//!   spawn ── SERVICEKIT_LISTEN_FD ──────────► Upgrader::listen() adopts fd
//!           SERVICEKIT_READY_FD                serve both planes
//!   wait ≤ timeout ◄────── 1 byte ──────────── Upgrader::ready()
//!   Upgraded → stop accepting, drain, hooks, exit
//! ```
//!
//! # Design Decisions
//! - The parent keeps its own listener open until the child has signalled
//!   readiness, so there is never a window where nobody holds the socket
//! - On failure the child is killed and the parent goes back to Ready
//! - A stop during an upgrade kills the child and wins over the upgrade
//! - Upgrade requests arriving while not Ready are ignored
//! - Only unix targets can upgrade; elsewhere [`Upgrader::upgrade`] returns
//!   [`UpgradeError::Unsupported`]

use std::ffi::OsString;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use crate::lifecycle::signals::{ProcessSignal, Signals};
use crate::net::listener::{bind_std, ListenerError};

/// Environment variable carrying the inherited listener fd.
pub const ENV_LISTEN_FD: &str = "SERVICEKIT_LISTEN_FD";

/// Environment variable carrying the readiness socket fd.
pub const ENV_READY_FD: &str = "SERVICEKIT_READY_FD";

/// Process-level upgrade state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    /// Serving; an upgrade may be requested.
    Ready,
    /// An upgrade signal was accepted.
    UpgradeRequested,
    /// The replacement process has been spawned and is starting.
    Upgrading,
    /// The replacement is serving; this process should drain and exit.
    Upgraded,
    /// A stop was requested; this process should drain and exit.
    Stopped,
}

impl UpgradeState {
    /// Whether this process should wind down.
    pub fn is_terminal(self) -> bool {
        matches!(self, UpgradeState::Upgraded | UpgradeState::Stopped)
    }
}

/// Error type for upgrade operations.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The child did not signal readiness in time.
    #[error("replacement process not ready after {0:?}")]
    Timeout(Duration),

    /// The child exited before signalling readiness.
    #[error("replacement process exited early (code {0:?})")]
    ChildExited(Option<i32>),

    /// The child could not be started.
    #[error("failed to spawn replacement process: {0}")]
    Spawn(#[source] io::Error),

    /// Live upgrades are not available on this platform.
    #[error("live upgrade not supported on this platform")]
    Unsupported,

    /// Another upgrade is running or the process is shutting down.
    #[error("upgrade not possible in state {0:?}")]
    InProgress(UpgradeState),

    /// A stop arrived before the replacement was ready.
    #[error("upgrade aborted by stop")]
    Aborted,
}

/// Coordinates listener inheritance, readiness and the upgrade handoff.
pub struct Upgrader {
    state: watch::Sender<UpgradeState>,
    timeout: Duration,
    /// Duplicate of the serving listener kept for handoff.
    handoff: Mutex<Option<std::net::TcpListener>>,
    /// Write end of the parent's readiness socket, if we were spawned by one.
    #[cfg(unix)]
    parent: Mutex<Option<std::os::unix::net::UnixStream>>,
    inherited_fd: Mutex<Option<i32>>,
    from_parent: bool,
    /// Replacement program and arguments; defaults to re-executing ourselves.
    command: Option<(OsString, Vec<OsString>)>,
}

impl Upgrader {
    /// Create an upgrader, picking up fds passed by a parent process.
    pub fn new(timeout: Duration) -> Self {
        let (state, _) = watch::channel(UpgradeState::Ready);
        let inherited_fd = env_fd(ENV_LISTEN_FD);

        #[cfg(unix)]
        let parent = env_fd(ENV_READY_FD).map(|fd| {
            use std::os::unix::io::FromRawFd;
            // SAFETY: the parent passed us this fd for exclusive use.
            let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
            let _ = set_cloexec(fd, true);
            stream
        });

        Self {
            state,
            timeout,
            handoff: Mutex::new(None),
            #[cfg(unix)]
            parent: Mutex::new(parent),
            from_parent: inherited_fd.is_some(),
            inherited_fd: Mutex::new(inherited_fd),
            command: None,
        }
    }

    /// Spawn `program args..` as the replacement instead of this executable.
    pub fn with_command<I, A>(mut self, program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.command = Some((program.into(), args.into_iter().map(Into::into).collect()));
        self
    }

    /// Whether a parent handed us a listener.
    pub fn has_parent(&self) -> bool {
        self.from_parent
    }

    /// Adopt the inherited listener, or bind a fresh one on `address`.
    pub fn listen(&self, address: &str) -> Result<std::net::TcpListener, ListenerError> {
        let listener = match lock(&self.inherited_fd).take() {
            Some(fd) => {
                let listener = adopt(fd).map_err(ListenerError::Bind)?;
                tracing::info!(
                    fd,
                    address = ?listener.local_addr().ok(),
                    "Adopted listener from parent process"
                );
                listener
            }
            None => bind_std(address)?,
        };

        let dup = listener.try_clone().map_err(ListenerError::Bind)?;
        *lock(&self.handoff) = Some(dup);
        Ok(listener)
    }

    /// Tell the parent process (if any) that we are serving.
    ///
    /// Idempotent; a no-op when there is no parent.
    pub fn ready(&self) {
        #[cfg(unix)]
        if let Some(mut stream) = lock(&self.parent).take() {
            use std::io::Write;
            match stream.write_all(&[1]) {
                Ok(()) => tracing::info!("Signalled readiness to parent process"),
                Err(e) => tracing::warn!(error = %e, "Failed to signal readiness to parent"),
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> UpgradeState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn watch(&self) -> watch::Receiver<UpgradeState> {
        self.state.subscribe()
    }

    /// Resolve once the process should wind down, with the reason.
    pub async fn exited(&self) -> UpgradeState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => UpgradeState::Stopped,
        };
        state
    }

    /// Request a stop from any state.
    pub fn stop(&self) {
        let previous = self.state.send_replace(UpgradeState::Stopped);
        if previous != UpgradeState::Stopped {
            tracing::info!(from = ?previous, "Stop requested");
        }
    }

    fn transition(&self, from: UpgradeState, to: UpgradeState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Spawn the replacement process and wait for it to become ready.
    pub async fn upgrade(&self) -> Result<(), UpgradeError> {
        if !self.transition(UpgradeState::Ready, UpgradeState::UpgradeRequested) {
            return Err(UpgradeError::InProgress(self.state()));
        }
        tracing::info!("Upgrade requested");

        let result = self.spawn_and_wait().await;
        match &result {
            Ok(()) => {
                self.transition(UpgradeState::Upgrading, UpgradeState::Upgraded);
                crate::observability::metrics::record_upgrade("success");
                tracing::info!("Upgrade complete, draining");
            }
            Err(UpgradeError::Aborted) => {
                crate::observability::metrics::record_upgrade("aborted");
                tracing::info!("Upgrade aborted by stop");
            }
            Err(e) => {
                // Stop may have won the race; leave it alone then.
                self.transition(UpgradeState::Upgrading, UpgradeState::Ready);
                self.transition(UpgradeState::UpgradeRequested, UpgradeState::Ready);
                crate::observability::metrics::record_upgrade("failure");
                tracing::error!(error = %e, "Upgrade failed, continuing to serve");
            }
        }
        result
    }

    #[cfg(unix)]
    async fn spawn_and_wait(&self) -> Result<(), UpgradeError> {
        use std::os::unix::io::AsRawFd;
        use tokio::io::AsyncReadExt;

        let listener = lock(&self.handoff)
            .as_ref()
            .map(|l| l.try_clone())
            .transpose()
            .map_err(UpgradeError::Spawn)?
            .ok_or_else(|| {
                UpgradeError::Spawn(io::Error::new(io::ErrorKind::NotFound, "no listener to hand off"))
            })?;
        let listen_fd = listener.as_raw_fd();
        set_cloexec(listen_fd, false).map_err(UpgradeError::Spawn)?;

        let (ours, theirs) = std::os::unix::net::UnixStream::pair().map_err(UpgradeError::Spawn)?;
        let ready_fd = theirs.as_raw_fd();
        set_cloexec(ready_fd, false).map_err(UpgradeError::Spawn)?;

        let (program, args) = match &self.command {
            Some((program, args)) => (program.clone(), args.clone()),
            None => (
                std::env::current_exe().map_err(UpgradeError::Spawn)?.into_os_string(),
                std::env::args_os().skip(1).collect(),
            ),
        };

        let mut state = self.state.subscribe();
        if !self.transition(UpgradeState::UpgradeRequested, UpgradeState::Upgrading) {
            return Err(UpgradeError::Aborted);
        }

        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .env(ENV_LISTEN_FD, listen_fd.to_string())
            .env(ENV_READY_FD, ready_fd.to_string())
            .spawn()
            .map_err(UpgradeError::Spawn)?;

        // The child owns its copies now.
        drop(listener);
        drop(theirs);

        tracing::info!(pid = ?child.id(), program = ?program, "Spawned replacement process");

        ours.set_nonblocking(true).map_err(UpgradeError::Spawn)?;
        let mut ours = tokio::net::UnixStream::from_std(ours).map_err(UpgradeError::Spawn)?;
        let mut byte = [0u8; 1];

        let outcome = tokio::time::timeout(self.timeout, async {
            tokio::select! {
                read = ours.read(&mut byte) => match read {
                    Ok(1) => Ok(()),
                    Ok(_) => Err(UpgradeError::ChildExited(None)),
                    Err(e) => Err(UpgradeError::Spawn(e)),
                },
                status = child.wait() => {
                    Err(UpgradeError::ChildExited(status.ok().and_then(|s| s.code())))
                }
                _ = async { state.wait_for(|s| *s == UpgradeState::Stopped).await.map(|_| ()) } => {
                    Err(UpgradeError::Aborted)
                }
            }
        })
        .await
        .unwrap_or(Err(UpgradeError::Timeout(self.timeout)));

        if outcome.is_err() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Replacement process already gone");
            }
            let _ = child.wait().await;
        }
        outcome
    }

    #[cfg(not(unix))]
    async fn spawn_and_wait(&self) -> Result<(), UpgradeError> {
        Err(UpgradeError::Unsupported)
    }

    /// Spawn the task that turns process signals into upgrades and stops.
    pub fn watch_signals(self: &Arc<Self>) -> io::Result<tokio::task::JoinHandle<()>> {
        let mut signals = Signals::new()?;
        let upgrader = Arc::clone(self);

        Ok(tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                match signal {
                    ProcessSignal::Upgrade => {
                        if upgrader.state() != UpgradeState::Ready {
                            tracing::warn!(state = ?upgrader.state(), "Ignoring upgrade signal");
                            continue;
                        }
                        // Keep listening while the child starts: a stop aborts it.
                        let upgrade = upgrader.upgrade();
                        tokio::pin!(upgrade);
                        let result = loop {
                            tokio::select! {
                                result = &mut upgrade => break result,
                                signal = signals.recv() => match signal {
                                    Some(ProcessSignal::Stop) => upgrader.stop(),
                                    Some(ProcessSignal::Upgrade) => {
                                        tracing::warn!("Ignoring upgrade signal, upgrade in progress");
                                    }
                                    None => break (&mut upgrade).await,
                                },
                            }
                        };
                        if result.is_ok() || upgrader.state() == UpgradeState::Stopped {
                            break;
                        }
                    }
                    ProcessSignal::Stop => {
                        upgrader.stop();
                        break;
                    }
                }
            }
        }))
    }
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn env_fd(key: &str) -> Option<i32> {
    let value = std::env::var(key).ok()?;
    match value.parse::<i32>() {
        Ok(fd) if fd >= 0 => Some(fd),
        _ => {
            tracing::warn!(key, value = %value, "Ignoring malformed inherited fd");
            None
        }
    }
}

#[cfg(unix)]
fn adopt(fd: i32) -> io::Result<std::net::TcpListener> {
    use std::os::unix::io::FromRawFd;

    set_cloexec(fd, true)?;
    // SAFETY: the parent passed this listening socket for exclusive use.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.local_addr()?;
    Ok(listener)
}

#[cfg(not(unix))]
fn adopt(_fd: i32) -> io::Result<std::net::TcpListener> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "fd inheritance requires unix"))
}

#[cfg(unix)]
fn set_cloexec(fd: i32, on: bool) -> io::Result<()> {
    let flags = if on { libc::FD_CLOEXEC } else { 0 };
    // SAFETY: fcntl on an fd we own; F_SETFD takes an int argument.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_ready_and_binds_fresh() {
        let upgrader = Upgrader::new(Duration::from_secs(1));
        assert_eq!(upgrader.state(), UpgradeState::Ready);
        assert!(!upgrader.has_parent());

        let listener = upgrader.listen("127.0.0.1:0").unwrap();
        assert!(listener.local_addr().is_ok());
        // Without a parent this is a no-op.
        upgrader.ready();
    }

    #[tokio::test]
    async fn stop_is_terminal() {
        let upgrader = Upgrader::new(Duration::from_secs(1));
        upgrader.stop();
        assert_eq!(upgrader.exited().await, UpgradeState::Stopped);
    }

    #[tokio::test]
    async fn upgrade_after_stop_is_rejected() {
        let upgrader = Upgrader::new(Duration::from_secs(1));
        upgrader.stop();
        assert!(matches!(
            upgrader.upgrade().await,
            Err(UpgradeError::InProgress(UpgradeState::Stopped))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn cloexec_toggles() {
        use std::os::unix::io::AsRawFd;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        set_cloexec(fd, false).unwrap();
        // SAFETY: fd is open for the duration of the test.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
        set_cloexec(fd, true).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_aborts_upgrade_while_child_starts() {
        // `sleep` never signals readiness, so the upgrade waits until stopped.
        let upgrader = Arc::new(Upgrader::new(Duration::from_secs(30)).with_command("sleep", ["30"]));
        let _listener = upgrader.listen("127.0.0.1:0").unwrap();

        let pending = tokio::spawn({
            let upgrader = Arc::clone(&upgrader);
            async move { upgrader.upgrade().await }
        });
        let mut states = upgrader.watch();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == UpgradeState::Upgrading))
            .await
            .unwrap()
            .unwrap();

        upgrader.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(UpgradeError::Aborted)));
        assert_eq!(upgrader.state(), UpgradeState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_during_upgrade_stops_the_process() {
        fn raise(signal: libc::c_int) {
            // SAFETY: kill(2) on our own pid with a signal we handle.
            assert_eq!(unsafe { libc::kill(libc::getpid(), signal) }, 0);
        }

        let upgrader = Arc::new(Upgrader::new(Duration::from_secs(30)).with_command("sleep", ["30"]));
        let _listener = upgrader.listen("127.0.0.1:0").unwrap();
        let task = upgrader.watch_signals().unwrap();

        raise(libc::SIGUSR2);
        let mut states = upgrader.watch();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == UpgradeState::Upgrading))
            .await
            .unwrap()
            .unwrap();

        raise(libc::SIGTERM);
        let state = tokio::time::timeout(Duration::from_secs(2), upgrader.exited()).await.unwrap();
        assert_eq!(state, UpgradeState::Stopped);
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
