//! The connection under [`SdBusImpl`](super::SdBusImpl).
//!
//! zbus parses the address, authenticates, says `Hello` to a bus and moves
//! bytes and descriptors over the socket. A receiver thread turns every
//! incoming zbus message back into a [`RawMessage`] and queues it, writing
//! a byte to a socket pair so the bus still has a descriptor to poll.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use zbus::blocking::{connection, Connection, MessageIterator};
use zbus::message::{PrimaryHeader, Type as ZbusType};
use zbus::zvariant::serialized::{Context, Data};
use zbus::zvariant::Endian;

use crate::error::{Errno, SdResult};
use crate::wire::RawMessage;

/// Maps a zbus failure onto the errno the bus primitives report.
pub(crate) fn errno_of(err: &zbus::Error) -> Errno {
    match err {
        zbus::Error::InputOutput(io) => io.raw_os_error().map_or(Errno::EIO, Errno),
        zbus::Error::Address(_) => Errno::EINVAL,
        zbus::Error::Handshake(_) => Errno(libc::EACCES),
        zbus::Error::Unsupported => Errno::EOPNOTSUPP,
        _ => Errno::EIO,
    }
}

fn io_errno(err: io::Error) -> Errno {
    Errno::from(err)
}

#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<RawMessage>>,
    closed: AtomicBool,
}

/// An authenticated connection plus the queue its receiver thread fills.
pub(crate) struct Transport {
    conn: Connection,
    inbox: Arc<Inbox>,
    wake: UnixStream,
}

impl Transport {
    /// Connects to a bus daemon, or to a peer when `bus_client` is unset.
    pub(crate) fn connect(address: &str, bus_client: bool) -> SdResult<Self> {
        let mut builder = connection::Builder::address(address).map_err(|e| errno_of(&e))?;
        if !bus_client {
            builder = builder.p2p();
        }
        let conn = builder.build().map_err(|e| {
            warn!("connecting to {} failed: {}", address, e);
            errno_of(&e)
        })?;
        debug!("connected to {}", address);
        Self::from_connection(conn)
    }

    /// Starts receiving on an already established zbus connection.
    pub(crate) fn from_connection(conn: Connection) -> SdResult<Self> {
        let (wake, notify) = UnixStream::pair().map_err(io_errno)?;
        wake.set_nonblocking(true).map_err(io_errno)?;
        notify.set_nonblocking(true).map_err(io_errno)?;

        let inbox = Arc::new(Inbox::default());
        let messages = MessageIterator::from(&conn);
        let receiver = inbox.clone();
        std::thread::Builder::new()
            .name("sdbusplus-recv".to_string())
            .spawn(move || receive(messages, &receiver, notify))
            .map_err(io_errno)?;
        Ok(Self { conn, inbox, wake })
    }

    /// Descriptor that turns readable when messages are queued or the
    /// connection is lost.
    pub(crate) fn fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }

    pub(crate) fn unique_name(&self) -> Option<String> {
        self.conn.unique_name().map(|name| name.to_string())
    }

    /// A serial no other message on this connection uses. zbus numbers its
    /// own messages from the same counter.
    pub(crate) fn next_serial(&self) -> u32 {
        PrimaryHeader::new(ZbusType::Signal, 0).serial_num().get()
    }

    pub(crate) fn send(&self, m: &RawMessage) -> SdResult<()> {
        let bytes = m.to_bytes()?;
        let fds = m.dup_fds()?;
        let data = Data::new_fds(bytes, Context::new_dbus(Endian::Little, 0), fds);
        // SAFETY: the bytes were produced by the signature-checked writer and header encoder.
        let msg = unsafe { zbus::Message::from_bytes(data) }.map_err(|e| errno_of(&e))?;
        trace!("sending serial {}", m.serial());
        self.conn.send(&msg).map_err(|e| errno_of(&e))
    }

    /// Takes every queued message. Fails with `ECONNRESET` once the
    /// connection is gone and the queue is empty.
    pub(crate) fn drain(&self) -> SdResult<Vec<RawMessage>> {
        let mut wake = &self.wake;
        let mut buf = [0u8; 64];
        while matches!(wake.read(&mut buf), Ok(n) if n > 0) {}

        let messages: Vec<RawMessage> = self.inbox.queue.lock().drain(..).collect();
        if messages.is_empty() && self.inbox.closed.load(Ordering::Acquire) {
            return Err(Errno::ECONNRESET);
        }
        Ok(messages)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Err(e) = self.conn.clone().close() {
            debug!("closing connection: {}", e);
        }
    }
}

fn convert(msg: &zbus::Message) -> SdResult<RawMessage> {
    let data = msg.data();
    let fds = data
        .fds()
        .iter()
        .map(|fd| fd.as_fd().try_clone_to_owned())
        .collect::<io::Result<Vec<OwnedFd>>>()
        .map_err(io_errno)?;
    Ok(RawMessage::from_bytes(data.bytes())?.with_fds(fds))
}

fn receive(messages: MessageIterator, inbox: &Inbox, mut notify: UnixStream) {
    for msg in messages {
        let msg = match msg {
            Ok(msg) => msg,
            Err(zbus::Error::InputOutput(e)) => {
                debug!("connection read failed: {}", e);
                break;
            }
            Err(e) => {
                warn!("dropping undecodable message: {}", e);
                continue;
            }
        };
        match convert(&msg) {
            Ok(m) => {
                trace!("received {:?} serial {} member {:?}", m.msg_type(), m.serial(), m.member());
                inbox.queue.lock().push_back(m);
            }
            Err(errno) => warn!("dropping malformed message: {}", errno),
        }
        // A full socket already guarantees a wakeup.
        let _ = notify.write(&[1]);
    }
    debug!("connection closed");
    inbox.closed.store(true, Ordering::Release);
    let _ = notify.write(&[1]);
}

/// Two authenticated peer-to-peer connections talking to each other.
#[cfg(test)]
pub(crate) fn connected_pair() -> SdResult<(Connection, Connection)> {
    let (client, server) = UnixStream::pair().map_err(io_errno)?;
    let guid = zbus::Guid::generate();
    let server = std::thread::spawn(move || {
        connection::Builder::unix_stream(server)
            .server(guid)?
            .p2p()
            .build()
    });
    let client = connection::Builder::unix_stream(client)
        .p2p()
        .build()
        .map_err(|e| errno_of(&e))?;
    let server = server.join().map_err(|_| Errno::EIO)?;
    Ok((client, server.map_err(|e| errno_of(&e))?))
}
