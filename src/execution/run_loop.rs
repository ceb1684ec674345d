use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};
use futures::FutureExt;
use log::trace;
use parking_lot::{Condvar, Mutex};

struct Queue {
    ready: VecDeque<Arc<Task>>,
    finishing: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn push(&self, task: Arc<Task>) {
        self.queue.lock().ready.push_back(task);
        self.available.notify_one();
    }
}

struct Task {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    shared: Weak<Shared>,
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if let Some(shared) = arc_self.shared.upgrade() {
            shared.push(arc_self.clone());
        }
    }
}

/// A single-threaded executor. Whichever thread calls [`RunLoop::run`]
/// polls every task scheduled on it, one at a time, in wake order.
pub struct RunLoop {
    shared: Arc<Shared>,
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLoop {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    ready: VecDeque::new(),
                    finishing: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            shared: self.shared.clone(),
        }
    }

    /// Runs tasks until [`RunLoop::finish`] has been called and the ready
    /// queue is empty.
    pub fn run(&self) {
        loop {
            let task = {
                let mut queue = self.shared.queue.lock();
                loop {
                    if let Some(task) = queue.ready.pop_front() {
                        break task;
                    }
                    if queue.finishing {
                        trace!("run loop finished");
                        return;
                    }
                    self.shared.available.wait(&mut queue);
                }
            };

            let mut slot = task.future.lock();
            if let Some(mut future) = slot.take() {
                let waker = waker_ref(&task);
                let mut cx = Context::from_waker(&waker);
                if future.as_mut().poll(&mut cx).is_pending() {
                    *slot = Some(future);
                }
            }
        }
    }

    pub fn finish(&self) {
        self.shared.queue.lock().finishing = true;
        self.shared.available.notify_all();
    }
}

/// Schedules work onto a [`RunLoop`].
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(Task {
            future: Mutex::new(Some(future.boxed())),
            shared: Arc::downgrade(&self.shared),
        });
        self.shared.push(task);
    }

    /// Completes after one trip through the run loop's queue.
    pub fn schedule(&self) -> Reschedule {
        Reschedule { yielded: false }
    }
}

pub struct Reschedule {
    yielded: bool,
}

impl Future for Reschedule {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
