use std::collections::VecDeque;
use std::io::{self, Read as _};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::bus::Bus;
use crate::error::{BusError, SdResult, ERROR_NO_REPLY};
use crate::sdbus::{
    monotonic_usec, poll, poll_timeout_ms, MessageHandler, SdBusImpl, SdBusInterface, SlotId,
};
use crate::wire::MessagePtr;

/// mockall double of [`SdBusInterface`].
pub use crate::sdbus::MockSdBusInterface as SdBusMock;

macro_rules! forward {
    ($mock:ident, $engine:ident; $($expect:ident => $method:ident($($arg:ident),*);)*) => {
        $(
            let engine = $engine.clone();
            $mock.$expect().returning(move |$($arg),*| engine.$method($($arg),*));
        )*
    };
}

/// Runs every message primitive on a real, unconnected [`SdBusImpl`] so
/// encoding behaves as it does on a live connection. Expectations set
/// earlier take precedence.
pub fn delegate_messages(mock: &mut SdBusMock) {
    let engine = Arc::new(SdBusImpl::new());
    forward! { mock, engine;
        expect_message_new_method_call => message_new_method_call(destination, path, interface, member);
        expect_message_new_signal => message_new_signal(path, interface, member);
        expect_message_new_method_return => message_new_method_return(call);
        expect_message_new_method_error => message_new_method_error(call, error);
        expect_message_new_method_errno => message_new_method_errno(call, errno);
        expect_message_append_basic => message_append_basic(m, value);
        expect_message_append_array => message_append_array(m, code, bytes);
        expect_message_open_container => message_open_container(m, kind, contents);
        expect_message_close_container => message_close_container(m);
        expect_message_read_basic => message_read_basic(m, code);
        expect_message_read_array => message_read_array(m, code);
        expect_message_enter_container => message_enter_container(m, kind, contents);
        expect_message_exit_container => message_exit_container(m);
        expect_message_at_end => message_at_end(m, complete);
        expect_message_verify_type => message_verify_type(m, code, contents);
        expect_message_peek_type => message_peek_type(m);
        expect_message_skip => message_skip(m, types);
        expect_message_rewind => message_rewind(m, complete);
        expect_message_seal => message_seal(m, cookie);
        expect_message_get_type => message_get_type(m);
        expect_message_get_cookie => message_get_cookie(m);
        expect_message_get_reply_cookie => message_get_reply_cookie(m);
        expect_message_get_path => message_get_path(m);
        expect_message_get_interface => message_get_interface(m);
        expect_message_get_member => message_get_member(m);
        expect_message_get_sender => message_get_sender(m);
        expect_message_get_destination => message_get_destination(m);
        expect_message_get_signature => message_get_signature(m);
        expect_message_get_error => message_get_error(m);
        expect_message_get_errno => message_get_errno(m);
        expect_message_is_method_call => message_is_method_call(m, interface, member);
        expect_message_is_signal => message_is_signal(m, interface, member);
        expect_message_is_method_error => message_is_method_error(m, name);
    }
}

/// Reads `fd` until it would block.
pub fn drain(mut fd: &UnixStream) {
    let mut buf = [0u8; 64];
    while matches!(fd.read(&mut buf), Ok(n) if n > 0) {}
}

/// Scripts the bus primitives of a connected bus with nothing to do.
/// Expectations set earlier take precedence.
///
/// Returns the far end of the descriptor `bus_get_fd` reports. Writing to
/// it makes the bus readable until the next `bus_process`.
pub fn expect_idle(mock: &mut SdBusMock) -> io::Result<UnixStream> {
    let (fd, peer) = UnixStream::pair()?;
    fd.set_nonblocking(true)?;
    let fd = Arc::new(fd);

    let raw = fd.as_raw_fd();
    mock.expect_bus_get_fd().returning(move || Ok(raw));
    mock.expect_bus_get_events().returning(|| Ok(libc::POLLIN));
    mock.expect_bus_get_timeout().returning(|| Ok(u64::MAX));
    let readable = fd.clone();
    mock.expect_bus_process().returning(move |_| {
        drain(&readable);
        Ok((false, None))
    });
    mock.expect_bus_wait().returning(move |timeout_usec| {
        let now = monotonic_usec();
        let mut fds = [libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        Ok(poll(&mut fds, poll_timeout_ms(now.saturating_add(timeout_usec), now))? > 0)
    });
    mock.expect_bus_flush().returning(|| Ok(()));
    mock.expect_bus_is_open().returning(|| true);
    mock.expect_bus_close().returning(|| ());
    mock.expect_slot_unref().returning(|_| ());
    mock.expect_watchdog_enabled().returning(|_| Ok(0));
    Ok(peer)
}

/// Answers method calls with `respond`: `bus_call` synchronously,
/// `bus_call_async` from a later `bus_process`. The bus timeout is due
/// while async replies are queued.
pub fn answer_calls<F>(mock: &mut SdBusMock, respond: F)
where
    F: Fn(&SdBusImpl, &MessagePtr) -> SdResult<MessagePtr> + Send + Sync + 'static,
{
    let engine = SdBusImpl::new();
    let serial = AtomicU32::new(1);
    let pending: Arc<Mutex<VecDeque<(MessageHandler, MessagePtr)>>> = Arc::default();

    let answer = Arc::new(move |call: &MessagePtr| -> SdResult<MessagePtr> {
        if !call.lock().is_sealed() {
            call.lock().seal(serial.fetch_add(1, Ordering::Relaxed))?;
        }
        let reply = respond(&engine, call)?;
        if !reply.lock().is_sealed() {
            reply.lock().seal(serial.fetch_add(1, Ordering::Relaxed))?;
        }
        trace!("mock answered serial {}", call.lock().serial());
        Ok(reply)
    });

    let sync = answer.clone();
    mock.expect_bus_call().returning(move |call, _| {
        let reply = (*sync)(call).map_err(|errno| BusError::new(ERROR_NO_REPLY, errno.to_string()))?;
        let error = reply.lock().error();
        match error {
            Some(error) => Err(error),
            None => Ok(reply),
        }
    });

    let queue = pending.clone();
    mock.expect_bus_call_async()
        .returning(move |call, callback, _| {
            let reply = (*answer)(call)?;
            queue.lock().push_back((callback, reply));
            Ok(SlotId(u64::from(call.lock().serial())))
        });

    let due = pending.clone();
    mock.expect_bus_get_timeout().returning(move || {
        Ok(if due.lock().is_empty() { u64::MAX } else { 0 })
    });

    let waiting = pending.clone();
    mock.expect_bus_process()
        .withf(move |_| !waiting.lock().is_empty())
        .returning(move |_| {
            let next = pending.lock().pop_front();
            if let Some((mut callback, reply)) = next {
                callback(reply);
            }
            Ok((true, None))
        });
}

/// A [`Bus`] over `mock`.
pub fn mocked_bus(mock: SdBusMock) -> Bus {
    Bus::new(Arc::new(mock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Errno, Error, Result};
    use crate::wire::BasicValue;
    use std::io::Write;
    use std::time::Duration;
    use test_log::test;

    fn socket_error(e: io::Error) -> Error {
        Error::sd_bus("socket", e.into())
    }

    #[test]
    fn scripted_failures_are_reported() -> Result<()> {
        let mut mock = SdBusMock::new();
        mock.expect_bus_flush()
            .times(1)
            .returning(|| Err(Errno::EIO));
        expect_idle(&mut mock).map_err(socket_error)?;
        let bus = mocked_bus(mock);
        assert_eq!(bus.flush(), Err(Error::sd_bus("bus_flush", Errno::EIO)));
        bus.flush()?;
        Ok(())
    }

    #[test]
    fn peer_writes_are_drained_by_process() -> Result<()> {
        let mut mock = SdBusMock::new();
        let mut peer = expect_idle(&mut mock).map_err(socket_error)?;
        let bus = mocked_bus(mock);
        peer.write_all(b"x").map_err(socket_error)?;
        assert!(bus.wait(Some(Duration::from_millis(100)))?);
        assert!(!bus.process_discard()?);
        assert!(!bus.wait(Some(Duration::ZERO))?);
        Ok(())
    }

    #[test]
    fn message_primitives_reach_the_engine() -> Result<()> {
        let mut mock = SdBusMock::new();
        mock.expect_message_seal()
            .withf(|_, cookie| *cookie == 9)
            .times(1)
            .returning(|_, _| Err(Errno::EPERM));
        delegate_messages(&mut mock);
        let bus = mocked_bus(mock);

        let mut m = bus.new_signal("/a", "a.b", "C")?;
        m.append_args(&(3u32,))?;
        assert_eq!(m.seal(9), Err(Error::sd_bus("message_seal", Errno::EPERM)));
        m.seal(1)?;
        assert_eq!(m.get_signature(), "u");
        assert_eq!(m.get_cookie()?, 1);
        Ok(())
    }

    #[test]
    fn async_answers_wait_for_process() -> Result<()> {
        let mut mock = SdBusMock::new();
        delegate_messages(&mut mock);
        answer_calls(&mut mock, |engine, call| {
            let reply = engine.message_new_method_return(call)?;
            engine.message_append_basic(&reply, &BasicValue::Boolean(true))?;
            Ok(reply)
        });
        let _peer = expect_idle(&mut mock).map_err(socket_error)?;
        let bus = mocked_bus(mock);
        assert_eq!(bus.get_timeout()?, u64::MAX);

        let m = bus.new_method_call("a.b", "/a", "a.b", "Get")?;
        let (tx, rx) = std::sync::mpsc::channel();
        let slot = m.call_async(
            move |mut reply| {
                let _ = tx.send(reply.read::<bool>());
            },
            None,
        )?;
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.get_timeout()?, 0);
        assert!(bus.process_discard()?);
        assert_eq!(rx.try_recv().ok(), Some(Ok(true)));
        assert!(!bus.process_discard()?);
        drop(slot);
        Ok(())
    }
}
