//! Typed access to one wire message.
//!
//! A [`Message`] is a cheap, cloneable handle: clones alias the same wire
//! buffer and share its read cursor. Values go in through [`Append`] and
//! come out through [`Read`]; both walk the message through the
//! [`SdBusInterface`] primitives, so they run unchanged against the
//! mock double.
//!
//! ```
//! use sdbusplus::message::Message;
//! use sdbusplus::sdbus::SdBusImpl;
//! use std::sync::Arc;
//!
//! # fn main() -> sdbusplus::error::Result<()> {
//! let mut m = Message::new_method_call(
//!     Arc::new(SdBusImpl::new()),
//!     None,
//!     "/xyz/openbmc_project/test",
//!     None,
//!     "Method",
//! )?;
//! m.append_args(&(3i32, "hi", false))?;
//! m.seal(1)?;
//! let (a, b, c): (i32, String, bool) = m.unpack()?;
//! assert_eq!((a, b.as_str(), c), (3, "hi", false));
//! # Ok(())
//! # }
//! ```

pub mod append;
pub mod read;
pub mod variant;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::bus::timeout_usec;
use crate::error::{BusError, Errno, Error, Result};
use crate::sdbus::{MessageHandler, SdBusInterface};
use crate::slot::Slot;
use crate::types::ContainerKind;
use crate::wire::{BasicValue, MessagePtr, MessageType};

pub use append::{Append, AppendArgs};
pub use read::{Read, ReadArgs};
pub use variant::Holds;

#[derive(Clone)]
pub struct Message {
    intf: Arc<dyn SdBusInterface>,
    msg: MessagePtr,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.get_type())
            .field("path", &self.get_path())
            .field("member", &self.get_member())
            .field("signature", &self.get_signature())
            .finish()
    }
}

impl Message {
    pub fn new(intf: Arc<dyn SdBusInterface>, msg: MessagePtr) -> Self {
        Self { intf, msg }
    }

    pub fn new_method_call(
        intf: Arc<dyn SdBusInterface>,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Result<Self> {
        let msg = intf
            .message_new_method_call(destination, path, interface, member)
            .map_err(|e| Error::sd_bus("message_new_method_call", e))?;
        Ok(Self::new(intf, msg))
    }

    pub fn new_signal(
        intf: Arc<dyn SdBusInterface>,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Self> {
        let msg = intf
            .message_new_signal(path, interface, member)
            .map_err(|e| Error::sd_bus("message_new_signal", e))?;
        Ok(Self::new(intf, msg))
    }

    /// The underlying wire message.
    pub fn get(&self) -> &MessagePtr {
        &self.msg
    }

    pub fn sdbus(&self) -> &Arc<dyn SdBusInterface> {
        &self.intf
    }

    pub fn append<T: Append + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.append_to(&mut MessageWriter { msg: self })
    }

    /// Appends each element of `args` as its own top-level argument.
    pub fn append_args<A: AppendArgs + ?Sized>(&mut self, args: &A) -> Result<()> {
        args.append_args(&mut MessageWriter { msg: self })
    }

    pub fn read<T: Read>(&mut self) -> Result<T> {
        T::read_from(&mut MessageReader { msg: self })
    }

    pub fn read_into<T: Read>(&mut self, out: &mut T) -> Result<()> {
        *out = self.read()?;
        Ok(())
    }

    /// Reads a tuple of top-level arguments, or nothing for `()`.
    pub fn unpack<A: ReadArgs>(&mut self) -> Result<A> {
        A::read_args(&mut MessageReader { msg: self })
    }

    pub fn seal(&self, cookie: u64) -> Result<()> {
        self.intf
            .message_seal(&self.msg, cookie)
            .map_err(|e| Error::sd_bus("message_seal", e))
    }

    /// Moves the read cursor back to the start of the current container,
    /// or of the whole body when `complete` is set.
    pub fn rewind(&self, complete: bool) -> Result<()> {
        self.intf
            .message_rewind(&self.msg, complete)
            .map_err(|e| Error::sd_bus("message_rewind", e))
    }

    pub fn get_type(&self) -> MessageType {
        self.intf.message_get_type(&self.msg)
    }

    pub fn get_cookie(&self) -> Result<u64> {
        self.intf
            .message_get_cookie(&self.msg)
            .map_err(|e| Error::sd_bus("message_get_cookie", e))
    }

    pub fn get_reply_cookie(&self) -> Result<u64> {
        self.intf
            .message_get_reply_cookie(&self.msg)
            .map_err(|e| Error::sd_bus("message_get_reply_cookie", e))
    }

    pub fn get_path(&self) -> Option<String> {
        self.intf.message_get_path(&self.msg)
    }

    pub fn get_interface(&self) -> Option<String> {
        self.intf.message_get_interface(&self.msg)
    }

    pub fn get_member(&self) -> Option<String> {
        self.intf.message_get_member(&self.msg)
    }

    pub fn get_sender(&self) -> Option<String> {
        self.intf.message_get_sender(&self.msg)
    }

    pub fn get_destination(&self) -> Option<String> {
        self.intf.message_get_destination(&self.msg)
    }

    pub fn get_signature(&self) -> String {
        self.intf.message_get_signature(&self.msg)
    }

    pub fn get_error(&self) -> Option<BusError> {
        self.intf.message_get_error(&self.msg)
    }

    pub fn get_errno(&self) -> i32 {
        self.intf.message_get_errno(&self.msg)
    }

    pub fn is_method_call(&self, interface: &str, member: &str) -> bool {
        self.intf
            .message_is_method_call(&self.msg, Some(interface), Some(member))
    }

    pub fn is_signal(&self, interface: &str, member: &str) -> bool {
        self.intf
            .message_is_signal(&self.msg, Some(interface), Some(member))
    }

    /// Whether this is an error reply, of any name.
    pub fn is_method_error(&self) -> bool {
        self.intf.message_is_method_error(&self.msg, None)
    }

    pub fn new_method_return(&self) -> Result<Message> {
        let reply = self
            .intf
            .message_new_method_return(&self.msg)
            .map_err(|e| Error::sd_bus("message_new_method_return", e))?;
        Ok(Message::new(self.intf.clone(), reply))
    }

    pub fn new_method_error(&self, error: &BusError) -> Result<Message> {
        let reply = self
            .intf
            .message_new_method_error(&self.msg, error)
            .map_err(|e| Error::sd_bus("message_new_method_error", e))?;
        Ok(Message::new(self.intf.clone(), reply))
    }

    pub fn new_method_errno(&self, errno: Errno) -> Result<Message> {
        let reply = self
            .intf
            .message_new_method_errno(&self.msg, errno)
            .map_err(|e| Error::sd_bus("message_new_method_errno", e))?;
        Ok(Message::new(self.intf.clone(), reply))
    }

    /// Sends this message, which should be a method return, without waiting.
    pub fn method_return(&self) -> Result<()> {
        self.send()
    }

    /// Sends this message, which should be a signal, without waiting.
    pub fn signal_send(&self) -> Result<()> {
        self.send()
    }

    fn send(&self) -> Result<()> {
        let cookie = self
            .intf
            .bus_send(&self.msg)
            .map_err(|e| Error::sd_bus("bus_send", e))?;
        debug!("sent {:?} with cookie {}", self.get_type(), cookie);
        Ok(())
    }

    /// Sends this method call and blocks until the reply arrives. Error
    /// replies become [`Error::Method`].
    pub fn call(&self, timeout: Option<Duration>) -> Result<Message> {
        let reply = self.intf.bus_call(&self.msg, timeout_usec(timeout))?;
        Ok(Message::new(self.intf.clone(), reply))
    }

    /// Sends this method call; `callback` receives the reply, or the
    /// synthesized error if the call times out. Dropping the returned
    /// slot before then cancels the call.
    pub fn call_async<F>(&self, callback: F, timeout: Option<Duration>) -> Result<Slot>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        let weak = Arc::downgrade(&self.intf);
        let mut callback = Some(callback);
        let handler: MessageHandler = Box::new(move |reply| {
            if let (Some(callback), Some(intf)) = (callback.take(), weak.upgrade()) {
                callback(Message::new(intf, reply));
            }
        });
        let id = self
            .intf
            .bus_call_async(&self.msg, handler, timeout_usec(timeout))
            .map_err(|e| Error::sd_bus("bus_call_async", e))?;
        Ok(Slot::new(&self.intf, id))
    }
}

/// Write cursor handed to [`Append`] implementations.
pub struct MessageWriter<'a> {
    msg: &'a Message,
}

impl MessageWriter<'_> {
    pub fn append_basic(&mut self, value: &BasicValue<'_>) -> Result<()> {
        self.msg
            .intf
            .message_append_basic(&self.msg.msg, value)
            .map_err(|e| Error::sd_bus("message_append_basic", e))
    }

    /// Bulk-appends an array of fixed-width elements given as little-endian bytes.
    pub fn append_array(&mut self, code: u8, bytes: &[u8]) -> Result<()> {
        self.msg
            .intf
            .message_append_array(&self.msg.msg, code, bytes)
            .map_err(|e| Error::sd_bus("message_append_array", e))
    }

    pub fn open_container(&mut self, kind: ContainerKind, contents: &str) -> Result<()> {
        self.msg
            .intf
            .message_open_container(&self.msg.msg, kind, contents)
            .map_err(|e| Error::sd_bus("message_open_container", e))
    }

    pub fn close_container(&mut self) -> Result<()> {
        self.msg
            .intf
            .message_close_container(&self.msg.msg)
            .map_err(|e| Error::sd_bus("message_close_container", e))
    }
}

/// Read cursor handed to [`Read`] implementations.
pub struct MessageReader<'a> {
    msg: &'a Message,
}

impl MessageReader<'_> {
    pub fn read_basic(&mut self, code: u8) -> Result<BasicValue<'static>> {
        self.msg
            .intf
            .message_read_basic(&self.msg.msg, code)
            .map_err(|e| Error::sd_bus("message_read_basic", e))
    }

    pub fn read_array(&mut self, code: u8) -> Result<Vec<u8>> {
        self.msg
            .intf
            .message_read_array(&self.msg.msg, code)
            .map_err(|e| Error::sd_bus("message_read_array", e))
    }

    pub fn enter_container(&mut self, kind: ContainerKind, contents: Option<&str>) -> Result<()> {
        self.msg
            .intf
            .message_enter_container(&self.msg.msg, kind, contents)
            .map_err(|e| Error::sd_bus("message_enter_container", e))
    }

    pub fn exit_container(&mut self) -> Result<()> {
        self.msg
            .intf
            .message_exit_container(&self.msg.msg)
            .map_err(|e| Error::sd_bus("message_exit_container", e))
    }

    pub fn at_end(&mut self, complete: bool) -> Result<bool> {
        self.msg
            .intf
            .message_at_end(&self.msg.msg, complete)
            .map_err(|e| Error::sd_bus("message_at_end", e))
    }

    pub fn verify_type(&mut self, code: u8, contents: Option<&str>) -> Result<bool> {
        self.msg
            .intf
            .message_verify_type(&self.msg.msg, code, contents)
            .map_err(|e| Error::sd_bus("message_verify_type", e))
    }

    pub fn peek_type(&mut self) -> Result<Option<(u8, Option<String>)>> {
        self.msg
            .intf
            .message_peek_type(&self.msg.msg)
            .map_err(|e| Error::sd_bus("message_peek_type", e))
    }

    pub fn skip(&mut self, types: &str) -> Result<()> {
        self.msg
            .intf
            .message_skip(&self.msg.msg, types)
            .map_err(|e| Error::sd_bus("message_skip", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdbus::SdBusImpl;
    use crate::wire::RawMessage;
    use test_log::test;

    fn call() -> Result<Message> {
        Message::new_method_call(
            Arc::new(SdBusImpl::new()),
            Some("xyz.openbmc_project.Test"),
            "/xyz/openbmc_project/test",
            Some("xyz.openbmc_project.Test"),
            "Method",
        )
    }

    #[test]
    fn header_accessors() -> Result<()> {
        let m = call()?;
        assert_eq!(m.get_type(), MessageType::MethodCall);
        assert_eq!(m.get_path().as_deref(), Some("/xyz/openbmc_project/test"));
        assert_eq!(m.get_member().as_deref(), Some("Method"));
        assert_eq!(m.get_destination().as_deref(), Some("xyz.openbmc_project.Test"));
        assert!(m.is_method_call("xyz.openbmc_project.Test", "Method"));
        assert!(!m.is_signal("xyz.openbmc_project.Test", "Method"));
        assert!(m.get_cookie().is_err());
        m.seal(4)?;
        assert_eq!(m.get_cookie()?, 4);
        Ok(())
    }

    #[test]
    fn reads_before_seal_fail_with_primitive_name() -> Result<()> {
        let mut m = call()?;
        m.append(&7u32)?;
        assert_eq!(
            m.read::<u32>(),
            Err(Error::sd_bus("message_read_basic", Errno::EPERM))
        );
        Ok(())
    }

    #[test]
    fn errno_reply_round_trip() -> Result<()> {
        let m = call()?;
        m.seal(1)?;
        let reply = m.new_method_errno(Errno::ENOENT)?;
        reply.seal(2)?;
        assert!(reply.is_method_error());
        assert_eq!(reply.get_errno(), libc::ENOENT);
        assert_eq!(reply.get_reply_cookie()?, 1);
        assert_eq!(
            reply.get_error().map(|e| e.name),
            Some("org.freedesktop.DBus.Error.FileNotFound".to_string())
        );
        Ok(())
    }

    #[test]
    fn clones_share_the_cursor() -> Result<()> {
        let mut raw = RawMessage::new_signal("/a", "a.b", "C").map_err(|e| Error::sd_bus("new", e))?;
        raw.append_basic(&BasicValue::Int32(1)).map_err(|e| Error::sd_bus("append", e))?;
        raw.append_basic(&BasicValue::Int32(2)).map_err(|e| Error::sd_bus("append", e))?;
        raw.seal(1).map_err(|e| Error::sd_bus("seal", e))?;
        let mut a = Message::new(Arc::new(SdBusImpl::new()), raw.into_ptr());
        let mut b = a.clone();
        assert_eq!(a.read::<i32>()?, 1);
        assert_eq!(b.read::<i32>()?, 2);
        b.rewind(true)?;
        assert_eq!(a.read::<i32>()?, 1);
        Ok(())
    }
}
