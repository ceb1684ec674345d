//! The async context.
//!
//! A [`Context`] owns a bus and two threads of control. The thread that
//! calls [`Context::run`] becomes the *caller* thread: it is the only one
//! that blocks, waiting on the bus descriptor and on timers. All spawned
//! work runs on a *worker* thread driving a [`RunLoop`], which is also
//! where the bus is processed, so every callback is serialized there.
//!
//! The two meet in a handshake. The worker's wait/process task processes
//! the bus until it runs dry, then stages a request and suspends. The
//! caller picks the request up, waits for the bus, and completes it, which
//! resumes the task on the worker.
//!
//! Shutdown happens in two stages. [`Context::request_stop`] trips the
//! initial stop: new spawns are refused and stop-aware operations end with
//! [`Error::Stopped`]. Once every spawned task has finished, the final stop
//! ends the wait/process loop and the caller thread returns from `run`.

use std::collections::BTreeMap;
use std::io::{Read as _, Write as _};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::bus::Bus;
use crate::config::Config;
use crate::error::{Errno, Error, Result};
use crate::execution::{RunLoop, Scheduler, StopSource, StopToken};
use crate::message::Message;
use crate::scope::Scope;
use crate::sdbus::{monotonic_usec, poll, poll_timeout_ms};
use crate::slot::Slot;

type Completion = oneshot::Sender<Result<()>>;

#[derive(Default)]
struct Handoff {
    /// A wait request posted by the worker, not yet seen by the caller.
    staged: Option<Completion>,
    /// The wait request the caller is servicing.
    pending: Option<Completion>,
    timers: BTreeMap<(u64, u64), Completion>,
    next_timer: u64,
}

struct Inner {
    bus: Bus,
    watchdog: bool,
    run_loop: RunLoop,
    pending_tasks: Scope,
    internal_tasks: Scope,
    initial_stop: StopSource,
    final_stop: StopSource,
    handoff: Mutex<Handoff>,
    caller_wakeup: Condvar,
    wake_tx: UnixStream,
    wake_rx: UnixStream,
    running: AtomicBool,
}

/// Owns a bus plus the worker and caller threads servicing it.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// A context on the default bus.
    pub fn new() -> Result<Self> {
        Self::with_bus(Bus::new_default()?)
    }

    pub fn with_bus(bus: Bus) -> Result<Self> {
        Self::build(bus, true)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::build(Bus::from_config(&config.bus)?, config.context.watchdog)
    }

    fn build(bus: Bus, watchdog: bool) -> Result<Self> {
        let (wake_tx, wake_rx) =
            UnixStream::pair().map_err(|e| Error::sd_bus("context_new", e.into()))?;
        for end in [&wake_tx, &wake_rx] {
            end.set_nonblocking(true)
                .map_err(|e| Error::sd_bus("context_new", e.into()))?;
        }
        let run_loop = RunLoop::new();
        let pending_tasks = Scope::new(run_loop.scheduler());
        let internal_tasks = Scope::new(run_loop.scheduler());
        Ok(Self {
            inner: Arc::new(Inner {
                bus,
                watchdog,
                run_loop,
                pending_tasks,
                internal_tasks,
                initial_stop: StopSource::new(),
                final_stop: StopSource::new(),
                handoff: Mutex::new(Handoff::default()),
                caller_wakeup: Condvar::new(),
                wake_tx,
                wake_rx,
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn scheduler(&self) -> Scheduler {
        self.inner.run_loop.scheduler()
    }

    /// Starts `task` on the worker thread.
    ///
    /// Fails with [`Error::ContextStopped`] once stop has been requested.
    /// A task that completes with an error other than [`Error::Stopped`]
    /// terminates the process.
    pub fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if self.inner.initial_stop.stop_requested() {
            return Err(Error::ContextStopped);
        }
        self.inner.pending_tasks.spawn(task);
        Ok(())
    }

    pub fn request_stop(&self) {
        if self.inner.initial_stop.request_stop() {
            info!("context stop requested");
        }
        self.inner.wake_caller();
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.initial_stop.stop_requested()
    }

    pub fn stop_token(&self) -> StopToken {
        self.inner.initial_stop.token()
    }

    /// Runs the context on the calling thread until stop has been
    /// requested and every spawned task has finished.
    pub fn run(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::sd_bus("context_run", Errno::EALREADY));
        }

        let worker = {
            let inner = self.inner.clone();
            std::thread::Builder::new()
                .name("sdbusplus-worker".to_string())
                .spawn(move || inner.run_loop.run())
                .map_err(|e| Error::sd_bus("context_run", e.into()))?
        };

        self.inner.internal_tasks.spawn(stop_watcher(self.inner.clone()));
        self.inner.internal_tasks.spawn(wait_process(self.inner.clone()));
        if self.inner.watchdog {
            self.inner.internal_tasks.spawn(watchdog_loop(self.clone()));
        }

        self.inner.caller_run();

        debug!("context shutting down");
        self.inner.cancel_waits();
        self.inner.internal_tasks.wait_empty();
        self.inner.run_loop.finish();
        if worker.join().is_err() {
            error!("worker thread panicked");
        }
        info!("context stopped");
        Ok(())
    }

    fn add_timer(&self, deadline: u64) -> Result<oneshot::Receiver<Result<()>>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut handoff = self.inner.handoff.lock();
            if self.inner.final_stop.stop_requested() {
                return Err(Error::Stopped);
            }
            let seq = handoff.next_timer;
            handoff.next_timer += 1;
            handoff.timers.insert((deadline, seq), tx);
        }
        self.inner.wake_caller();
        Ok(rx)
    }
}

impl Inner {
    fn wake_caller(&self) {
        // Serializes with the caller's check-then-wait on the condvar.
        drop(self.handoff.lock());
        self.caller_wakeup.notify_all();
        let mut tx = &self.wake_tx;
        // A full socket already guarantees a wakeup.
        let _ = tx.write(&[1]);
    }

    fn drain_wakeups(&self) {
        let mut rx = &self.wake_rx;
        let mut buf = [0u8; 64];
        while matches!(rx.read(&mut buf), Ok(n) if n > 0) {}
    }

    /// Posts a wait request for the caller thread.
    fn stage_wait(&self) -> Result<oneshot::Receiver<Result<()>>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut handoff = self.handoff.lock();
            if self.final_stop.stop_requested() {
                return Err(Error::Stopped);
            }
            handoff.staged = Some(tx);
        }
        self.wake_caller();
        Ok(rx)
    }

    /// The caller thread's half of the handshake.
    fn caller_run(&self) {
        loop {
            let (waiting, timer_deadline) = {
                let mut handoff = self.handoff.lock();
                while handoff.staged.is_none()
                    && handoff.pending.is_none()
                    && handoff.timers.is_empty()
                    && !self.final_stop.stop_requested()
                {
                    self.caller_wakeup.wait(&mut handoff);
                }
                if self.final_stop.stop_requested() {
                    return;
                }
                if let Some(staged) = handoff.staged.take() {
                    debug!("caller picked up wait request");
                    handoff.pending = Some(staged);
                }
                let timer_deadline = handoff
                    .timers
                    .keys()
                    .next()
                    .map_or(u64::MAX, |(deadline, _)| *deadline);
                (handoff.pending.is_some(), timer_deadline)
            };

            let mut fds = vec![libc::pollfd {
                fd: self.wake_rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            }];
            let mut deadline = timer_deadline;
            let mut bus_deadline = u64::MAX;
            if waiting {
                match self.bus_poll_params() {
                    Ok((fd, events, timeout)) => {
                        fds.push(libc::pollfd {
                            fd,
                            events,
                            revents: 0,
                        });
                        bus_deadline = timeout;
                        deadline = deadline.min(timeout);
                    }
                    Err(e) => {
                        self.complete_pending(Err(e));
                        continue;
                    }
                }
            }

            if let Err(errno) = poll(&mut fds, poll_timeout_ms(deadline, monotonic_usec())) {
                self.complete_pending(Err(Error::sd_bus("bus_wait", errno)));
                continue;
            }
            self.drain_wakeups();

            let now = monotonic_usec();
            if waiting && (fds.get(1).map_or(false, |p| p.revents != 0) || now >= bus_deadline) {
                self.complete_pending(Ok(()));
            }
            let expired = {
                let mut handoff = self.handoff.lock();
                let later = handoff.timers.split_off(&(now.saturating_add(1), 0));
                std::mem::replace(&mut handoff.timers, later)
            };
            for (_, timer) in expired {
                let _ = timer.send(Ok(()));
            }
        }
    }

    fn bus_poll_params(&self) -> Result<(i32, i16, u64)> {
        Ok((
            self.bus.get_fd()?,
            self.bus.get_events()?,
            self.bus.get_timeout()?,
        ))
    }

    fn complete_pending(&self, result: Result<()>) {
        let pending = self.handoff.lock().pending.take();
        if let Some(pending) = pending {
            let _ = pending.send(result);
        }
    }

    /// Ends every outstanding wait and timer with [`Error::Stopped`].
    fn cancel_waits(&self) {
        let mut handoff = self.handoff.lock();
        let waits = handoff.staged.take().into_iter().chain(handoff.pending.take());
        let timers = std::mem::take(&mut handoff.timers).into_values();
        for completion in waits.chain(timers) {
            let _ = completion.send(Err(Error::Stopped));
        }
    }
}

/// Trips the final stop once stop was requested and user work has drained.
async fn stop_watcher(inner: Arc<Inner>) -> Result<()> {
    inner.initial_stop.token().stopped().await;
    debug!("waiting for pending tasks");
    inner.pending_tasks.on_empty().await;
    inner.final_stop.request_stop();
    inner.wake_caller();
    Ok(())
}

/// The worker's half of the handshake.
async fn wait_process(inner: Arc<Inner>) -> Result<()> {
    loop {
        loop {
            match inner.bus.process_discard() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    give_up(&inner, e);
                    return Ok(());
                }
            }
        }
        let rx = match inner.stage_wait() {
            Ok(rx) => rx,
            Err(_) => return Ok(()),
        };
        match rx.await {
            Ok(Ok(())) => debug!("bus ready, processing"),
            Ok(Err(Error::Stopped)) | Err(_) => return Ok(()),
            Ok(Err(e)) => {
                give_up(&inner, e);
                return Ok(());
            }
        }
    }
}

fn give_up(inner: &Inner, e: Error) {
    error!("bus processing failed: {}", e);
    inner.initial_stop.request_stop();
}

async fn watchdog_loop(ctx: Context) -> Result<()> {
    let usec = match ctx.bus().watchdog_enabled() {
        Ok(0) => return Ok(()),
        Ok(usec) => usec,
        Err(e) => {
            warn!("watchdog query failed: {}", e);
            return Ok(());
        }
    };
    let interval = Duration::from_micros(usec / 2);
    debug!("petting watchdog every {:?}", interval);
    loop {
        match sleep_for(&ctx, interval).await {
            Ok(()) => {}
            Err(Error::Stopped) => return Ok(()),
            Err(e) => return Err(e),
        }
        if let Err(e) = ctx.bus().watchdog_pet() {
            warn!("watchdog pet failed: {}", e);
        }
    }
}

/// Completes after `duration`, or with [`Error::Stopped`] once stop is requested.
pub async fn sleep_for(ctx: &Context, duration: Duration) -> Result<()> {
    let usec = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX - 1);
    let rx = ctx.add_timer(monotonic_usec().saturating_add(usec).min(u64::MAX - 1))?;
    ctx.stop_token()
        .run(async move { rx.await.unwrap_or(Err(Error::Stopped)) })
        .await
}

/// Calls a method and resumes with the reply on the worker thread.
///
/// An error reply becomes [`Error::Method`]. Dropping the future cancels
/// the call.
pub async fn call(ctx: &Context, m: &Message, timeout: Option<Duration>) -> Result<Message> {
    let (tx, rx) = oneshot::channel();
    let slot = m.call_async(
        move |reply| {
            let _ = tx.send(reply);
        },
        timeout,
    )?;
    ctx.inner.wake_caller();
    let reply = ctx
        .stop_token()
        .run(async move { rx.await.map_err(|_| Error::Stopped) })
        .await;
    drop(slot);
    let reply = reply?;
    match reply.get_error() {
        Some(error) => Err(error.into()),
        None => Ok(reply),
    }
}

/// A match rule whose messages are received asynchronously.
pub struct Match {
    ctx: Context,
    rx: mpsc::UnboundedReceiver<Message>,
    _slot: Slot,
}

impl Match {
    pub fn new(ctx: &Context, rule: &str) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded();
        let slot = ctx.bus().add_match(rule, move |m| {
            let _ = tx.unbounded_send(m);
        })?;
        ctx.inner.wake_caller();
        Ok(Self {
            ctx: ctx.clone(),
            rx,
            _slot: slot,
        })
    }

    /// The next matching message, or [`Error::Stopped`] after stop.
    pub async fn next(&mut self) -> Result<Message> {
        let token = self.ctx.stop_token();
        let rx = &mut self.rx;
        token
            .run(async move { rx.next().await.ok_or(Error::Stopped) })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdbus::{MessageHandler, SdBusInterface, SlotId};
    use crate::test::{answer_calls, delegate_messages, expect_idle, mocked_bus, SdBusMock};
    use crate::wire::{BasicValue, RawMessage};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use test_log::test;

    fn quiet(mut mock: SdBusMock) -> Result<(Bus, UnixStream)> {
        delegate_messages(&mut mock);
        let peer = expect_idle(&mut mock).map_err(|e| Error::sd_bus("socketpair", e.into()))?;
        Ok((mocked_bus(mock), peer))
    }

    #[test]
    fn run_returns_after_stop() -> Result<()> {
        let processed = Arc::new(AtomicUsize::new(0));
        let mut mock = SdBusMock::new();
        let n = processed.clone();
        mock.expect_bus_process().returning(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
            Ok((false, None))
        });
        let (bus, _peer) = quiet(mock)?;
        let ctx = Context::with_bus(bus)?;
        let task_ctx = ctx.clone();
        ctx.spawn(async move {
            sleep_for(&task_ctx, Duration::from_millis(10)).await?;
            task_ctx.request_stop();
            Ok(())
        })?;

        let start = Instant::now();
        ctx.run()?;
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(ctx.stop_requested());
        assert!(processed.load(Ordering::SeqCst) >= 1);
        Ok(())
    }

    #[test]
    fn spawn_after_stop_is_refused() -> Result<()> {
        let (bus, _peer) = quiet(SdBusMock::new())?;
        let ctx = Context::with_bus(bus)?;
        ctx.request_stop();
        assert_eq!(ctx.spawn(async { Ok(()) }), Err(Error::ContextStopped));
        ctx.run()?;
        assert_eq!(ctx.run(), Err(Error::sd_bus("context_run", Errno::EALREADY)));
        Ok(())
    }

    #[test]
    fn sleepers_are_stopped() -> Result<()> {
        let (bus, _peer) = quiet(SdBusMock::new())?;
        let ctx = Context::with_bus(bus)?;
        let (tx, rx) = std::sync::mpsc::channel();
        let task_ctx = ctx.clone();
        ctx.spawn(async move {
            let _ = tx.send(sleep_for(&task_ctx, Duration::from_secs(3600)).await);
            Ok(())
        })?;
        let stopper = ctx.clone();
        ctx.spawn(async move {
            sleep_for(&stopper, Duration::from_millis(5)).await?;
            stopper.request_stop();
            Ok(())
        })?;
        ctx.run()?;
        assert_eq!(rx.try_recv().ok(), Some(Err(Error::Stopped)));
        Ok(())
    }

    #[test]
    fn calls_resume_with_the_reply() -> Result<()> {
        let mut mock = SdBusMock::new();
        answer_calls(&mut mock, |engine, call| {
            let reply = engine.message_new_method_return(call)?;
            engine.message_append_basic(&reply, &BasicValue::String("pong".into()))?;
            Ok(reply)
        });
        let (bus, _peer) = quiet(mock)?;
        let ctx = Context::with_bus(bus)?;
        let (tx, rx) = std::sync::mpsc::channel();
        let task_ctx = ctx.clone();
        ctx.spawn(async move {
            let m = task_ctx
                .bus()
                .new_method_call("a.b", "/a", "a.b", "Ping")?;
            let mut reply = call(&task_ctx, &m, None).await?;
            let _ = tx.send(reply.read::<String>()?);
            task_ctx.request_stop();
            Ok(())
        })?;
        ctx.run()?;
        assert_eq!(rx.try_recv().ok().as_deref(), Some("pong"));
        Ok(())
    }

    #[test]
    fn matches_yield_signals() -> Result<()> {
        let handler: Arc<Mutex<Option<MessageHandler>>> = Arc::default();
        let mut mock = SdBusMock::new();
        let registered = handler.clone();
        mock.expect_bus_add_match()
            .withf(|rule, _| rule == "type='signal',member='Changed'")
            .times(1)
            .returning(move |_, callback| {
                *registered.lock() = Some(callback);
                Ok(SlotId(1))
            });
        let (delivered, ready) = (handler.clone(), handler.clone());
        mock.expect_bus_process()
            .withf(move |_| ready.lock().is_some())
            .times(1)
            .returning(move |_| {
                let mut signal = RawMessage::new_signal("/a", "a.b", "Changed")?;
                signal.seal(7)?;
                if let Some(callback) = delivered.lock().as_mut() {
                    callback(signal.into_ptr());
                }
                Ok((true, None))
            });
        let (bus, _peer) = quiet(mock)?;
        let ctx = Context::with_bus(bus)?;
        let mut m = Match::new(&ctx, "type='signal',member='Changed'")?;

        let (tx, rx) = std::sync::mpsc::channel();
        let task_ctx = ctx.clone();
        ctx.spawn(async move {
            let got = m.next().await?;
            let _ = tx.send(got.get_member());
            task_ctx.request_stop();
            Ok(())
        })?;
        ctx.run()?;
        assert_eq!(rx.try_recv().ok(), Some(Some("Changed".to_string())));
        Ok(())
    }

    #[test]
    fn watchdog_is_petted_while_running() -> Result<()> {
        let pets = Arc::new(AtomicUsize::new(0));
        let mut mock = SdBusMock::new();
        mock.expect_watchdog_enabled()
            .times(1)
            .returning(|_| Ok(10_000));
        let n = pets.clone();
        mock.expect_notify()
            .withf(|_, state| state == "WATCHDOG=1")
            .returning(move |_, _| {
                n.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let (bus, _peer) = quiet(mock)?;
        let ctx = Context::with_bus(bus)?;
        let task_ctx = ctx.clone();
        ctx.spawn(async move {
            sleep_for(&task_ctx, Duration::from_millis(50)).await?;
            task_ctx.request_stop();
            Ok(())
        })?;
        ctx.run()?;
        assert!(pets.load(Ordering::SeqCst) >= 1);
        Ok(())
    }

    #[test]
    fn watchdog_can_be_disabled() -> Result<()> {
        let queried = Arc::new(AtomicUsize::new(0));
        let mut mock = SdBusMock::new();
        let n = queried.clone();
        mock.expect_watchdog_enabled().returning(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
            Ok(10_000)
        });
        mock.expect_notify().never();
        let (bus, _peer) = quiet(mock)?;
        let ctx = Context::build(bus, false)?;
        let task_ctx = ctx.clone();
        ctx.spawn(async move {
            sleep_for(&task_ctx, Duration::from_millis(30)).await?;
            task_ctx.request_stop();
            Ok(())
        })?;
        ctx.run()?;
        assert_eq!(queried.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
