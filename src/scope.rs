//! Structured ownership of spawned work.
//!
//! A [`Scope`] counts the work it has started and refuses to be dropped
//! while any of it is outstanding.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::execution::{connect, Receiver, Scheduler};

struct ScopeState {
    pending: Mutex<usize>,
    drained: Condvar,
    empty: Notify,
}

/// Holds one unit of the scope's pending count.
struct PendingGuard {
    state: Arc<ScopeState>,
}

impl PendingGuard {
    fn new(state: &Arc<ScopeState>) -> Self {
        *state.pending.lock() += 1;
        Self {
            state: state.clone(),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.state.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.state.drained.notify_all();
            self.state.empty.notify_waiters();
        }
    }
}

struct SpawnReceiver {
    _guard: PendingGuard,
}

impl Receiver<()> for SpawnReceiver {
    fn set_value(self, _: ()) {}

    fn set_error(self, error: Error) {
        error!("spawned task failed: {}", error);
        std::process::abort();
    }

    fn set_stopped(self) {
        debug!("spawned task stopped");
    }
}

struct FutureReceiver<T> {
    tx: oneshot::Sender<Result<T>>,
    _guard: PendingGuard,
}

impl<T: Send + 'static> Receiver<T> for FutureReceiver<T> {
    fn set_value(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    fn set_error(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }

    fn set_stopped(self) {
        let _ = self.tx.send(Err(Error::UnhandledStop));
    }
}

/// The eventual result of [`Scope::spawn_future`].
///
/// A stopped task resolves to [`Error::UnhandledStop`].
pub struct SpawnedFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for SpawnedFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::UnhandledStop)))
    }
}

pub struct Scope {
    scheduler: Scheduler,
    state: Arc<ScopeState>,
}

impl Scope {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            state: Arc::new(ScopeState {
                pending: Mutex::new(0),
                drained: Condvar::new(),
                empty: Notify::new(),
            }),
        }
    }

    /// Starts `future` on the scope's scheduler, fire and forget.
    ///
    /// A stopped task is ignored. A task that fails terminates the process.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let receiver = SpawnReceiver {
            _guard: PendingGuard::new(&self.state),
        };
        connect(future, receiver).start(&self.scheduler);
    }

    /// Starts `future` and hands back its result.
    pub fn spawn_future<F, T>(&self, future: F) -> SpawnedFuture<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let receiver = FutureReceiver {
            tx,
            _guard: PendingGuard::new(&self.state),
        };
        connect(future, receiver).start(&self.scheduler);
        SpawnedFuture { rx }
    }

    /// Counts `future` as pending work from now until it completes or is dropped.
    pub fn nest<F: Future>(&self, future: F) -> impl Future<Output = F::Output> {
        let guard = PendingGuard::new(&self.state);
        async move {
            let output = future.await;
            drop(guard);
            output
        }
    }

    /// Completes when nothing is pending.
    pub fn on_empty(&self) -> impl Future<Output = ()> + Send + 'static {
        let state = self.state.clone();
        async move {
            loop {
                let notified = state.empty.notified();
                if *state.pending.lock() == 0 {
                    return;
                }
                notified.await;
            }
        }
    }

    /// Blocks the calling thread until nothing is pending.
    pub fn wait_empty(&self) {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.drained.wait(&mut pending);
        }
    }

    pub fn pending_count(&self) -> usize {
        *self.state.pending.lock()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let pending = self.pending_count();
        if pending > 0 && !std::thread::panicking() {
            panic!("scope dropped with {} pending tasks", pending);
        }
    }
}
