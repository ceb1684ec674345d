//! The seam between this crate and the bus.
//!
//! Every raw primitive the message and bus layers need goes through
//! [`SdBusInterface`]. [`native::SdBusImpl`] implements it on a zbus
//! connection; tests use the mockall double re-exported from
//! [`crate::test`].

pub mod native;
mod transport;

use std::os::unix::io::RawFd;

use crate::error::{BusError, Errno, SdResult};
use crate::types::ContainerKind;
use crate::wire::{BasicValue, MessagePtr, MessageType};

pub use native::SdBusImpl;

/// Callback for async call replies and match rules.
pub type MessageHandler = Box<dyn FnMut(MessagePtr) + Send>;

/// Identifies a pending call or match registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u64);

pub const NAME_FLAG_ALLOW_REPLACEMENT: u64 = 0x1;
pub const NAME_FLAG_REPLACE_EXISTING: u64 = 0x2;
pub const NAME_FLAG_QUEUE: u64 = 0x4;

/// Current `CLOCK_MONOTONIC` time in microseconds, the clock bus timeouts use.
pub fn monotonic_usec() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime only writes the provided timespec.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}

#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait SdBusInterface: Send + Sync {
    fn message_new_method_call<'a>(
        &self,
        destination: Option<&'a str>,
        path: &str,
        interface: Option<&'a str>,
        member: &str,
    ) -> SdResult<MessagePtr>;
    fn message_new_signal(&self, path: &str, interface: &str, member: &str)
        -> SdResult<MessagePtr>;
    fn message_new_method_return(&self, call: &MessagePtr) -> SdResult<MessagePtr>;
    fn message_new_method_error(&self, call: &MessagePtr, error: &BusError)
        -> SdResult<MessagePtr>;
    fn message_new_method_errno(&self, call: &MessagePtr, errno: Errno) -> SdResult<MessagePtr>;

    fn message_append_basic<'a>(&self, m: &MessagePtr, value: &BasicValue<'a>) -> SdResult<()>;
    fn message_append_array(&self, m: &MessagePtr, code: u8, bytes: &[u8]) -> SdResult<()>;
    fn message_open_container(
        &self,
        m: &MessagePtr,
        kind: ContainerKind,
        contents: &str,
    ) -> SdResult<()>;
    fn message_close_container(&self, m: &MessagePtr) -> SdResult<()>;

    fn message_read_basic(&self, m: &MessagePtr, code: u8) -> SdResult<BasicValue<'static>>;
    fn message_read_array(&self, m: &MessagePtr, code: u8) -> SdResult<Vec<u8>>;
    fn message_enter_container<'a>(
        &self,
        m: &MessagePtr,
        kind: ContainerKind,
        contents: Option<&'a str>,
    ) -> SdResult<()>;
    fn message_exit_container(&self, m: &MessagePtr) -> SdResult<()>;
    fn message_at_end(&self, m: &MessagePtr, complete: bool) -> SdResult<bool>;
    fn message_verify_type<'a>(
        &self,
        m: &MessagePtr,
        code: u8,
        contents: Option<&'a str>,
    ) -> SdResult<bool>;
    fn message_peek_type(&self, m: &MessagePtr) -> SdResult<Option<(u8, Option<String>)>>;
    fn message_skip(&self, m: &MessagePtr, types: &str) -> SdResult<()>;
    fn message_rewind(&self, m: &MessagePtr, complete: bool) -> SdResult<()>;
    fn message_seal(&self, m: &MessagePtr, cookie: u64) -> SdResult<()>;

    fn message_get_type(&self, m: &MessagePtr) -> MessageType;
    fn message_get_cookie(&self, m: &MessagePtr) -> SdResult<u64>;
    fn message_get_reply_cookie(&self, m: &MessagePtr) -> SdResult<u64>;
    fn message_get_path(&self, m: &MessagePtr) -> Option<String>;
    fn message_get_interface(&self, m: &MessagePtr) -> Option<String>;
    fn message_get_member(&self, m: &MessagePtr) -> Option<String>;
    fn message_get_sender(&self, m: &MessagePtr) -> Option<String>;
    fn message_get_destination(&self, m: &MessagePtr) -> Option<String>;
    fn message_get_signature(&self, m: &MessagePtr) -> String;
    fn message_get_error(&self, m: &MessagePtr) -> Option<BusError>;
    /// Errno of an error reply, `0` for any other message.
    fn message_get_errno(&self, m: &MessagePtr) -> i32;
    fn message_is_method_call<'a>(
        &self,
        m: &MessagePtr,
        interface: Option<&'a str>,
        member: Option<&'a str>,
    ) -> bool;
    fn message_is_signal<'a>(
        &self,
        m: &MessagePtr,
        interface: Option<&'a str>,
        member: Option<&'a str>,
    ) -> bool;
    fn message_is_method_error<'a>(&self, m: &MessagePtr, name: Option<&'a str>) -> bool;

    fn bus_get_fd(&self) -> SdResult<RawFd>;
    /// Poll events the bus wants to wait for.
    fn bus_get_events(&self) -> SdResult<i16>;
    /// Absolute `CLOCK_MONOTONIC` deadline in microseconds; `u64::MAX` waits forever.
    fn bus_get_timeout(&self) -> SdResult<u64>;
    /// Processes one pending item. Returns whether progress was made and,
    /// when `take_unhandled` is set, a message no handler consumed.
    fn bus_process(&self, take_unhandled: bool) -> SdResult<(bool, Option<MessagePtr>)>;
    fn bus_wait(&self, timeout_usec: u64) -> SdResult<bool>;
    fn bus_flush(&self) -> SdResult<()>;
    fn bus_send(&self, m: &MessagePtr) -> SdResult<u64>;
    fn bus_call(&self, m: &MessagePtr, timeout_usec: u64) -> Result<MessagePtr, BusError>;
    fn bus_call_async(
        &self,
        m: &MessagePtr,
        callback: MessageHandler,
        timeout_usec: u64,
    ) -> SdResult<SlotId>;
    fn bus_add_match(&self, rule: &str, callback: MessageHandler) -> SdResult<SlotId>;
    fn slot_unref(&self, slot: SlotId);
    fn bus_request_name(&self, name: &str, flags: u64) -> SdResult<()>;
    fn bus_release_name(&self, name: &str) -> SdResult<()>;
    fn bus_get_unique_name(&self) -> SdResult<String>;
    fn bus_list_names(&self) -> SdResult<Vec<String>>;
    fn bus_close(&self);
    fn bus_is_open(&self) -> bool;

    /// Watchdog interval in microseconds requested by the service manager, `0` if none.
    fn watchdog_enabled(&self, unset_environment: bool) -> SdResult<u64>;
    fn notify(&self, unset_environment: bool, state: &str) -> SdResult<()>;
}

/// Milliseconds from `now` until the absolute `deadline`, rounded up; `-1` for no deadline.
pub(crate) fn poll_timeout_ms(deadline: u64, now: u64) -> i32 {
    if deadline == u64::MAX {
        return -1;
    }
    let ms = deadline.saturating_sub(now).saturating_add(999) / 1000;
    ms.min(i32::MAX as u64) as i32
}

/// `poll(2)`, retried on `EINTR`. Returns the number of ready descriptors.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> SdResult<usize> {
    loop {
        // SAFETY: `fds` is a valid, exclusively borrowed array of pollfd.
        let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if r >= 0 {
            return Ok(r as usize);
        }
        let errno = Errno::last_os_error();
        if errno.0 != libc::EINTR {
            return Err(errno);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn poll_timeouts_round_up() {
        assert_eq!(poll_timeout_ms(u64::MAX, 0), -1);
        assert_eq!(poll_timeout_ms(1_500, 0), 2);
        assert_eq!(poll_timeout_ms(10, 20), 0);
        assert_eq!(poll_timeout_ms(u64::MAX - 1, 0), i32::MAX);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_usec();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(monotonic_usec() >= a + 1_000);
    }
}
