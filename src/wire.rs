//! Byte-exact D-Bus message encoding.
//!
//! [`RawMessage`] is the in-process message object behind the bus primitives:
//! it is built through a signature-checked [`writer`], sealed with a serial,
//! and then walked by a [`reader`] cursor.

pub mod basic;
pub(crate) mod header;
pub(crate) mod reader;
pub(crate) mod writer;

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::error::{BusError, Errno, SdResult};
use crate::types::ContainerKind;

pub use basic::BasicValue;
pub use header::MessageType;

use basic::Endian;
use header::Header;
use reader::BodyReader;
use writer::BodyWriter;

/// Shared handle to one wire message.
pub type MessagePtr = Arc<Mutex<RawMessage>>;

#[derive(Debug)]
enum Body {
    Building(BodyWriter),
    Sealed { data: Vec<u8>, reader: BodyReader },
}

#[derive(Debug)]
pub struct RawMessage {
    header: Header,
    body: Body,
    fds: Vec<OwnedFd>,
}

fn dup_fd(fd: RawFd) -> SdResult<OwnedFd> {
    if fd < 0 {
        return Err(Errno::EBADF);
    }
    // SAFETY: F_DUPFD_CLOEXEC does not touch memory; the result is a fresh descriptor we own.
    let new = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) };
    if new < 0 {
        return Err(Errno::last_os_error());
    }
    // SAFETY: `new` was just returned by fcntl and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

impl RawMessage {
    pub(crate) fn new(header: Header) -> Self {
        Self {
            header,
            body: Body::Building(BodyWriter::new()),
            fds: Vec::new(),
        }
    }

    pub fn new_method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> SdResult<Self> {
        let mut header = Header::new(MessageType::MethodCall);
        header.destination = destination.map(str::to_string);
        header.path = Some(path.to_string());
        header.interface = interface.map(str::to_string);
        header.member = Some(member.to_string());
        if !BasicValue::ObjectPath(path.into()).validate() {
            return Err(Errno::EINVAL);
        }
        Ok(Self::new(header))
    }

    pub fn new_signal(path: &str, interface: &str, member: &str) -> SdResult<Self> {
        if !BasicValue::ObjectPath(path.into()).validate() {
            return Err(Errno::EINVAL);
        }
        let mut header = Header::new(MessageType::Signal);
        header.path = Some(path.to_string());
        header.interface = Some(interface.to_string());
        header.member = Some(member.to_string());
        Ok(Self::new(header))
    }

    fn reply_header(&self, msg_type: MessageType) -> SdResult<Header> {
        if self.header.msg_type != MessageType::MethodCall || !self.is_sealed() {
            return Err(Errno::EPERM);
        }
        let mut header = Header::new(msg_type);
        header.reply_serial = Some(self.header.serial);
        header.destination = self.header.sender.clone();
        Ok(header)
    }

    pub fn new_method_return(&self) -> SdResult<Self> {
        Ok(Self::new(self.reply_header(MessageType::MethodReturn)?))
    }

    pub fn new_method_error(&self, error: &BusError) -> SdResult<Self> {
        let mut header = self.reply_header(MessageType::Error)?;
        header.error_name = Some(error.name.clone());
        let mut reply = Self::new(header);
        reply.append_basic(&BasicValue::String(error.message.as_str().into()))?;
        Ok(reply)
    }

    /// An error reply synthesized locally, e.g. for a call that timed out.
    pub(crate) fn new_local_error(reply_serial: u32, error: &BusError) -> SdResult<Self> {
        let mut header = Header::new(MessageType::Error);
        header.reply_serial = Some(reply_serial);
        header.error_name = Some(error.name.clone());
        let mut reply = Self::new(header);
        reply.append_basic(&BasicValue::String(error.message.as_str().into()))?;
        reply.seal(u32::MAX)?;
        Ok(reply)
    }

    /// Parses a complete message received from a peer.
    pub fn from_bytes(buf: &[u8]) -> SdResult<Self> {
        let (header, body, endian) = Header::parse(buf)?;
        let data = buf[body].to_vec();
        let reader = BodyReader::new(&header.signature, data.len(), endian);
        Ok(Self {
            header,
            body: Body::Sealed { data, reader },
            fds: Vec::new(),
        })
    }

    /// Attaches the descriptors that arrived alongside the bytes.
    pub(crate) fn with_fds(mut self, fds: Vec<OwnedFd>) -> Self {
        self.fds = fds;
        self
    }

    /// Fresh copies of the attached descriptors, in index order.
    pub(crate) fn dup_fds(&self) -> SdResult<Vec<OwnedFd>> {
        self.fds.iter().map(|fd| dup_fd(fd.as_raw_fd())).collect()
    }

    /// Serializes a sealed message for the wire.
    pub fn to_bytes(&self) -> SdResult<Vec<u8>> {
        match &self.body {
            Body::Sealed { data, .. } => {
                let mut out = self.header.encode(data.len())?;
                out.extend_from_slice(data);
                Ok(out)
            }
            Body::Building(_) => Err(Errno::EPERM),
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.body, Body::Sealed { .. })
    }

    pub fn seal(&mut self, serial: u32) -> SdResult<()> {
        if serial == 0 {
            return Err(Errno::EINVAL);
        }
        let writer = match std::mem::replace(&mut self.body, Body::Building(BodyWriter::new())) {
            Body::Building(writer) if writer.depth() > 0 => {
                self.body = Body::Building(writer);
                return Err(Errno::EBUSY);
            }
            Body::Building(writer) => writer,
            sealed => {
                self.body = sealed;
                return Err(Errno::EPERM);
            }
        };
        let (data, signature) = writer.complete()?;
        trace!("seal serial {} signature {:?}", serial, signature);
        self.header.signature = signature;
        self.header.serial = serial;
        self.header.unix_fds = self.fds.len() as u32;
        let reader = BodyReader::new(&self.header.signature, data.len(), Endian::Little);
        self.body = Body::Sealed { data, reader };
        Ok(())
    }

    fn writer(&mut self) -> SdResult<&mut BodyWriter> {
        match &mut self.body {
            Body::Building(writer) => Ok(writer),
            Body::Sealed { .. } => Err(Errno::EPERM),
        }
    }

    fn reader(&mut self) -> SdResult<(&[u8], &mut BodyReader)> {
        match &mut self.body {
            Body::Sealed { data, reader } => Ok((data.as_slice(), reader)),
            Body::Building(_) => Err(Errno::EPERM),
        }
    }

    pub fn append_basic(&mut self, value: &BasicValue<'_>) -> SdResult<()> {
        if let BasicValue::UnixFd(fd) = value {
            self.writer()?;
            let owned = dup_fd(*fd)?;
            let index = self.fds.len() as i32;
            self.writer()?.append_basic(&BasicValue::UnixFd(index))?;
            self.fds.push(owned);
            return Ok(());
        }
        self.writer()?.append_basic(value)
    }

    pub fn append_array(&mut self, code: u8, bytes: &[u8]) -> SdResult<()> {
        self.writer()?.append_array(code, bytes)
    }

    pub fn open_container(&mut self, kind: ContainerKind, contents: &str) -> SdResult<()> {
        self.writer()?.open_container(kind, contents)
    }

    pub fn close_container(&mut self) -> SdResult<()> {
        self.writer()?.close_container()
    }

    pub fn read_basic(&mut self, code: u8) -> SdResult<BasicValue<'static>> {
        let (data, reader) = self.reader()?;
        let value = reader.read_basic(data, code)?;
        match value {
            BasicValue::UnixFd(index) => self
                .fds
                .get(index as usize)
                .map(|fd| BasicValue::UnixFd(fd.as_raw_fd()))
                .ok_or(Errno::EBADMSG),
            value => Ok(value),
        }
    }

    pub fn read_array(&mut self, code: u8) -> SdResult<Vec<u8>> {
        let (data, reader) = self.reader()?;
        reader.read_array(data, code)
    }

    pub fn enter_container(&mut self, kind: ContainerKind, contents: Option<&str>) -> SdResult<()> {
        let (data, reader) = self.reader()?;
        reader.enter_container(data, kind, contents)
    }

    pub fn exit_container(&mut self) -> SdResult<()> {
        let (_, reader) = self.reader()?;
        reader.exit_container()
    }

    pub fn at_end(&mut self, complete: bool) -> SdResult<bool> {
        let (_, reader) = self.reader()?;
        Ok(reader.at_end(complete))
    }

    pub fn verify_type(&mut self, code: u8, contents: Option<&str>) -> SdResult<bool> {
        let (data, reader) = self.reader()?;
        reader.verify_type(data, code, contents)
    }

    pub fn peek_type(&mut self) -> SdResult<Option<(u8, Option<String>)>> {
        let (data, reader) = self.reader()?;
        reader.peek_type(data)
    }

    pub fn skip(&mut self, types: &str) -> SdResult<()> {
        let (data, reader) = self.reader()?;
        reader.skip(data, types)
    }

    pub fn rewind(&mut self, complete: bool) -> SdResult<()> {
        let (_, reader) = self.reader()?;
        reader.rewind(complete);
        Ok(())
    }

    pub fn msg_type(&self) -> MessageType {
        self.header.msg_type
    }

    pub fn serial(&self) -> u32 {
        self.header.serial
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.header.reply_serial
    }

    pub fn path(&self) -> Option<&str> {
        self.header.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.header.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.header.member.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.header.sender.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.header.destination.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.header.error_name.as_deref()
    }

    pub fn no_reply_expected(&self) -> bool {
        self.header.flags & header::FLAG_NO_REPLY_EXPECTED != 0
    }

    pub fn set_no_reply_expected(&mut self, value: bool) {
        if value {
            self.header.flags |= header::FLAG_NO_REPLY_EXPECTED;
        } else {
            self.header.flags &= !header::FLAG_NO_REPLY_EXPECTED;
        }
    }

    pub(crate) fn set_sender(&mut self, sender: Option<String>) {
        self.header.sender = sender;
    }

    pub fn has_fds(&self) -> bool {
        !self.fds.is_empty()
    }

    /// Signature of the body; while building, the part written so far.
    pub fn signature(&self) -> String {
        match &self.body {
            Body::Sealed { .. } => self.header.signature.clone(),
            Body::Building(writer) => String::from_utf8_lossy(writer.signature()).into_owned(),
        }
    }

    /// The error carried by an error reply: its name and first string argument.
    pub fn error(&self) -> Option<BusError> {
        if self.header.msg_type != MessageType::Error {
            return None;
        }
        let name = self.header.error_name.clone()?;
        let message = match &self.body {
            Body::Sealed { data, reader } if self.header.signature.starts_with('s') => {
                let mut reader = reader.clone();
                reader.rewind(true);
                match reader.read_basic(data, b's') {
                    Ok(BasicValue::String(s)) => s.into_owned(),
                    _ => String::new(),
                }
            }
            _ => String::new(),
        };
        Some(BusError::new(name, message))
    }

    pub fn into_ptr(self) -> MessagePtr {
        Arc::new(Mutex::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn seal_and_reparse() -> SdResult<()> {
        let mut m = RawMessage::new_method_call(
            Some("xyz.openbmc_project.Test"),
            "/xyz/openbmc_project/test",
            Some("xyz.openbmc_project.Test"),
            "Method",
        )?;
        m.append_basic(&BasicValue::Int32(3))?;
        m.append_basic(&BasicValue::String("hi".into()))?;
        assert_eq!(m.read_basic(b'i'), Err(Errno::EPERM));
        m.seal(5)?;
        assert_eq!(
            m.append_basic(&BasicValue::Int32(1)),
            Err(Errno::EPERM)
        );

        let mut parsed = RawMessage::from_bytes(&m.to_bytes()?)?;
        assert_eq!(parsed.signature(), "is");
        assert_eq!(parsed.serial(), 5);
        assert_eq!(parsed.member(), Some("Method"));
        assert_eq!(parsed.read_basic(b'i')?, BasicValue::Int32(3));
        assert_eq!(parsed.read_basic(b's')?, BasicValue::String("hi".into()));
        assert!(parsed.at_end(true)?);
        Ok(())
    }

    #[test]
    fn seal_with_open_container_is_busy() -> SdResult<()> {
        let mut m = RawMessage::new_signal("/a", "a.b", "C")?;
        m.open_container(ContainerKind::Array, "i")?;
        assert_eq!(m.seal(1), Err(Errno::EBUSY));
        m.close_container()?;
        m.seal(1)?;
        assert_eq!(m.seal(2), Err(Errno::EPERM));
        Ok(())
    }

    #[test]
    fn error_reply_carries_message() -> SdResult<()> {
        let mut call = RawMessage::new_method_call(None, "/", None, "Ping")?;
        call.set_sender(Some(":1.5".to_string()));
        call.seal(9)?;
        let mut reply = call.new_method_error(&BusError::new("a.b.Error", "went wrong"))?;
        reply.seal(10)?;
        assert_eq!(reply.reply_serial(), Some(9));
        assert_eq!(reply.destination(), Some(":1.5"));
        assert_eq!(
            reply.error(),
            Some(BusError::new("a.b.Error", "went wrong"))
        );
        Ok(())
    }

    #[test]
    fn unix_fds_are_duplicated() -> SdResult<()> {
        let (a, _b) = std::os::unix::net::UnixStream::pair().map_err(Errno::from)?;
        let mut m = RawMessage::new_signal("/a", "a.b", "C")?;
        m.append_basic(&BasicValue::UnixFd(a.as_raw_fd()))?;
        m.seal(1)?;
        match m.read_basic(b'h')? {
            BasicValue::UnixFd(fd) => {
                assert!(fd >= 0);
                assert_ne!(fd, a.as_raw_fd());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(m.has_fds());
        Ok(())
    }
}
