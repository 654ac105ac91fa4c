//! Shutdown coordination for the process.
//!
//! Two things live here: a cancellation signal that long-running loops
//! subscribe to, and an append-only list of teardown hooks. [`Shutdown::run`]
//! fires the signal, launches every hook concurrently and waits for all of
//! them before returning.
//!
//! Hooks are launched in reverse registration order but run concurrently,
//! so a plain hook must not assume another hook has finished. A hook that
//! releases a shared resource is added with [`Shutdown::add_release_hook`]
//! instead: it is launched with the others but holds off until every hook
//! registered after it has returned, so those hooks can still use the
//! resource (e.g. the connection cache outlives the server drain).
//!
//! A hook that never returns blocks [`Shutdown::run`] forever. There is
//! no timeout.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::watch;

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Registered {
    name: String,
    hook: Hook,
    /// Wait for every later-registered hook before running.
    release: bool,
}

struct Inner {
    hooks: Mutex<Vec<Registered>>,
    signal: watch::Sender<bool>,
    completed: watch::Sender<bool>,
    started: AtomicBool,
}

/// Coordinator for graceful shutdown.
///
/// Cheap to clone; all clones share the same hook list and signal.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        let (completed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                hooks: Mutex::new(Vec::with_capacity(16)),
                signal,
                completed,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.inner.signal.subscribe(),
        }
    }

    /// Fire the cancellation signal without running hooks.
    pub fn trigger(&self) {
        self.inner.signal.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.inner.signal.borrow()
    }

    /// Append a teardown hook. Hooks cannot be removed.
    ///
    /// A hook added after [`Shutdown::run`] started is spawned right away
    /// and is not part of the completion barrier.
    pub fn add_hook<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(name.into(), Box::new(move || hook().boxed()), false);
    }

    /// Append a hook that releases something later hooks may still use.
    ///
    /// It runs only after every hook registered after it has finished.
    pub fn add_release_hook<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(name.into(), Box::new(move || hook().boxed()), true);
    }

    fn register(&self, name: String, hook: Hook, release: bool) {
        if self.inner.started.load(Ordering::SeqCst) {
            tracing::warn!(hook = %name, "Shutdown hook added after shutdown started");
            tokio::spawn(hook());
            return;
        }

        let mut hooks = self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::debug!(hook = %name, position = hooks.len(), release, "Shutdown hook registered");
        hooks.push(Registered { name, hook, release });
    }

    /// Number of hooks waiting to run.
    pub fn hook_count(&self) -> usize {
        self.inner
            .hooks
            .lock()
            .map(|h| h.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    /// Fire the signal, run every hook concurrently and wait for all of them.
    ///
    /// Calling this again (or concurrently) waits for the first run to
    /// finish; hooks never run twice.
    pub async fn run(&self) {
        self.trigger();

        if self.inner.started.swap(true, Ordering::SeqCst) {
            self.completed().await;
            return;
        }

        let hooks = {
            let mut hooks = self
                .inner
                .hooks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *hooks)
        };

        tracing::info!(hooks = hooks.len(), "Running shutdown hooks");

        let finished: Arc<Vec<watch::Sender<bool>>> =
            Arc::new(hooks.iter().map(|_| watch::channel(false).0).collect());

        let running: Vec<_> = hooks
            .into_iter()
            .enumerate()
            .rev()
            .map(|(position, Registered { name, hook, release })| {
                let finished = Arc::clone(&finished);
                let task = tokio::spawn(async move {
                    if release {
                        for later in &finished[position + 1..] {
                            let _ = later.subscribe().wait_for(|done| *done).await;
                        }
                    }
                    let outcome = AssertUnwindSafe(async move { hook().await })
                        .catch_unwind()
                        .await;
                    finished[position].send_replace(true);
                    if let Err(panic) = outcome {
                        std::panic::resume_unwind(panic);
                    }
                });
                (name, task)
            })
            .collect();

        for (name, handle) in running {
            match handle.await {
                Ok(()) => tracing::debug!(hook = %name, "Shutdown hook finished"),
                Err(e) => tracing::error!(hook = %name, error = %e, "Shutdown hook failed"),
            }
        }

        self.inner.completed.send_replace(true);
        tracing::info!("Shutdown hooks complete");
    }

    /// Wait until a [`Shutdown::run`] has finished every hook.
    pub async fn completed(&self) {
        let mut rx = self.inner.completed.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .field("hooks", &self.hook_count())
            .finish()
    }
}

/// Receiving side of the shutdown signal.
///
/// Observes a trigger that happened before it was created.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown has been triggered.
    pub async fn recv(&mut self) {
        // A dropped coordinator counts as shutdown.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_every_hook_before_returning() {
        let shutdown = Shutdown::new();
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..5u64 {
            let done = done.clone();
            shutdown.add_hook(format!("hook-{}", i), move || async move {
                tokio::time::sleep(Duration::from_millis(20 * i)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        shutdown.run().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(shutdown.hook_count(), 0);
    }

    #[tokio::test]
    async fn hooks_run_concurrently() {
        let shutdown = Shutdown::new();
        for _ in 0..4 {
            shutdown.add_hook("sleeper", || tokio::time::sleep(Duration::from_millis(200)));
        }

        let started = std::time::Instant::now();
        shutdown.run().await;
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn second_run_waits_and_does_not_rerun() {
        let shutdown = Shutdown::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        shutdown.add_hook("slow", move || async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            c.fetch_add(1, Ordering::SeqCst);
        });

        let first = shutdown.clone();
        let a = tokio::spawn(async move { first.run().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.run().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        a.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_hook_does_not_break_barrier() {
        let shutdown = Shutdown::new();
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        shutdown.add_hook("panics", || async { panic!("boom") });
        shutdown.add_hook("fine", move || async move {
            d.store(true, Ordering::SeqCst);
        });

        shutdown.run().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn late_subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut signal = shutdown.subscribe();
        assert!(signal.is_triggered());
        tokio::time::timeout(Duration::from_millis(50), signal.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn release_hook_outlives_later_hooks() {
        let shutdown = Shutdown::new();
        let released = Arc::new(AtomicBool::new(false));
        let used_after_release = Arc::new(AtomicBool::new(false));

        let r = released.clone();
        shutdown.add_release_hook("resource", move || async move {
            r.store(true, Ordering::SeqCst);
        });
        for delay in [50u64, 0] {
            let r = released.clone();
            let late = used_after_release.clone();
            shutdown.add_hook("user", move || async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if r.load(Ordering::SeqCst) {
                    late.store(true, Ordering::SeqCst);
                }
            });
        }
        shutdown.add_hook("panics", || async { panic!("boom") });

        shutdown.run().await;
        assert!(released.load(Ordering::SeqCst));
        assert!(!used_after_release.load(Ordering::SeqCst));
    }
}
