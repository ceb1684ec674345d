//! Driving a [`Bus`] from a tokio runtime.
//!
//! [`Connection`] runs a task that alternates between two states:
//! *processing*, where it calls `process` until the bus has nothing left,
//! and *read-wait*, where it waits for the bus descriptor to become ready,
//! for the bus timeout to expire, or for an explicit [`Connection::wake`].

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use log::{debug, trace, warn};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::message::{AppendArgs, Message, ReadArgs};
use crate::sdbus::monotonic_usec;

// Deadlines further out than this are treated as no deadline.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn interest(events: i16) -> Interest {
    let readable = events & libc::POLLIN != 0;
    let writable = events & libc::POLLOUT != 0;
    match (readable, writable) {
        (_, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
    }
}

/// Registers a duplicate of the bus descriptor with the runtime.
fn register(fd: RawFd) -> io::Result<AsyncFd<OwnedFd>> {
    // SAFETY: the bus keeps `fd` open while `get_fd` reports it.
    let owned = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
    AsyncFd::new(owned)
}

fn timer_delay(deadline: u64) -> Option<Duration> {
    if deadline == u64::MAX {
        return None;
    }
    let delay = Duration::from_micros(deadline.saturating_sub(monotonic_usec()));
    (delay <= MAX_TIMER_DELAY).then(|| delay)
}

/// A bus serviced by a task on the current tokio runtime.
///
/// Dropping the connection stops the task.
pub struct Connection {
    bus: Bus,
    wakeup: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Must be called from within a tokio runtime.
    pub fn new(bus: Bus) -> Self {
        let wakeup = Arc::new(Notify::new());
        let task = tokio::spawn(drive(bus.clone(), wakeup.clone()));
        Self { bus, wakeup, task }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Makes the task re-evaluate the bus state, e.g. after queueing
    /// outgoing messages.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Whether the processing task is still alive.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Sends a method call and waits for its reply. An error reply
    /// becomes [`Error::Method`].
    pub async fn async_send(&self, m: &Message, timeout: Option<Duration>) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let slot = m.call_async(
            move |reply| {
                let _ = tx.send(reply);
            },
            timeout,
        )?;
        self.wake();
        let reply = rx.await.map_err(|_| Error::Stopped);
        drop(slot);
        let reply = reply?;
        match reply.get_error() {
            Some(error) => Err(error.into()),
            None => Ok(reply),
        }
    }

    pub async fn async_method_call<A, R>(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: AppendArgs + ?Sized,
        R: ReadArgs,
    {
        let mut m = self.bus.new_method_call(service, path, interface, method)?;
        m.append_args(args)?;
        let mut reply = self.async_send(&m, None).await?;
        reply.unpack()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn drive(bus: Bus, wakeup: Arc<Notify>) {
    let mut registered: Option<(RawFd, AsyncFd<OwnedFd>)> = None;
    loop {
        trace!("processing");
        loop {
            match bus.process_discard() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    warn!("bus processing failed: {}", e);
                    return;
                }
            }
        }

        debug!("read wait");
        let (fd, events) = match (bus.get_fd(), bus.get_events()) {
            (Ok(fd), Ok(events)) if fd >= 0 && events >= 0 => (fd, events),
            _ => return,
        };
        let delay = bus.get_timeout().ok().and_then(timer_delay);
        // The registration covers both directions; `readiness` picks one.
        let async_fd = match registered.take() {
            Some((source, async_fd)) if source == fd => async_fd,
            stale => {
                drop(stale);
                match register(fd) {
                    Ok(async_fd) => async_fd,
                    Err(e) => {
                        warn!("cannot register bus fd {}: {}", fd, e);
                        return;
                    }
                }
            }
        };

        let timer = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            ready = readiness(&async_fd, interest(events)) => {
                if let Err(e) = ready {
                    warn!("waiting on bus fd failed: {}", e);
                    return;
                }
            }
            _ = timer => trace!("bus timeout expired"),
            _ = wakeup.notified() => trace!("woken"),
        }
        registered = Some((fd, async_fd));
    }
}

async fn readiness(async_fd: &AsyncFd<OwnedFd>, interest: Interest) -> io::Result<()> {
    let mut guard = async_fd.ready(interest).await?;
    guard.clear_ready();
    Ok(())
}
