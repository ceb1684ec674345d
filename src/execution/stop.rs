use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{select, Either};
use futures::pin_mut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

type StopCallback = Box<dyn FnOnce() + Send>;

struct StopState {
    requested: AtomicBool,
    notify: Notify,
    callbacks: Mutex<Vec<StopCallback>>,
}

/// The owning side of a one-shot stop request.
#[derive(Clone)]
pub struct StopSource {
    state: Arc<StopState>,
}

/// Observes a [`StopSource`].
#[derive(Clone)]
pub struct StopToken {
    state: Arc<StopState>,
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StopState {
                requested: AtomicBool::new(false),
                notify: Notify::new(),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Requests stop. Returns `true` for the first request only.
    pub fn request_stop(&self) -> bool {
        if self.state.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.notify.notify_waiters();
        let callbacks = std::mem::take(&mut *self.state.callbacks.lock());
        for callback in callbacks {
            callback();
        }
        true
    }

    pub fn stop_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            state: self.state.clone(),
        }
    }
}

impl StopToken {
    pub fn stop_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// Completes once stop has been requested.
    pub async fn stopped(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.stop_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Runs `callback` when stop is requested, or now if it already was.
    pub fn on_stop<F: FnOnce() + Send + 'static>(&self, callback: F) {
        {
            let mut callbacks = self.state.callbacks.lock();
            if !self.stop_requested() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Drives `future` until it completes or stop is requested, whichever
    /// comes first. A stop yields [`Error::Stopped`].
    pub async fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.stop_requested() {
            return Err(Error::Stopped);
        }
        let stopped = self.stopped();
        pin_mut!(future, stopped);
        match select(future, stopped).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => Err(Error::Stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;
    use test_log::test;

    #[test]
    fn only_the_first_request_counts() {
        let source = StopSource::new();
        let token = source.token();
        assert!(!token.stop_requested());
        assert!(source.request_stop());
        assert!(!source.request_stop());
        assert!(token.stop_requested());
        block_on(token.stopped());
    }

    #[test]
    fn callbacks_run_once() {
        let source = StopSource::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        source.token().on_stop(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        source.request_stop();
        source.request_stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = count.clone();
        source.token().on_stop(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_interrupts_pending_work() {
        let source = StopSource::new();
        let token = source.token();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            source.request_stop();
        });
        let result: Result<()> = block_on(token.run(futures::future::pending()));
        assert_eq!(result, Err(Error::Stopped));
        let _ = stopper.join();
    }

    #[test]
    fn completed_work_wins() {
        let source = StopSource::new();
        let token = source.token();
        assert_eq!(block_on(token.run(async { Ok(3) })), Ok(3));
        source.request_stop();
        assert_eq!(block_on(token.run(async { Ok(3) })), Err(Error::Stopped));
    }
}
