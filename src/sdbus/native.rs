//! [`SdBusInterface`] on a zbus connection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use sd_notify::NotifyState;

use super::transport::Transport;
use super::{poll, poll_timeout_ms, MessageHandler, SdBusInterface, SlotId};
use crate::error::{BusError, Errno, SdResult, ERROR_NO_REPLY, ERROR_UNKNOWN_METHOD};
use crate::sdbus::monotonic_usec;
use crate::types::{ContainerKind, Type};
use crate::wire::{BasicValue, MessagePtr, MessageType, RawMessage};

const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Used when a call passes a timeout of zero.
pub const DEFAULT_METHOD_TIMEOUT_USEC: u64 = 25_000_000;

/// A parsed match rule. Only the keys that filter on message contents are
/// understood; anything else is rejected.
#[derive(Clone, Debug, Default, PartialEq)]
struct MatchRule {
    msg_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    path_namespace: Option<String>,
    destination: Option<String>,
    args: Vec<(usize, String)>,
}

impl MatchRule {
    fn parse(rule: &str) -> SdResult<Self> {
        let mut parsed = MatchRule::default();
        let mut rest = rule.trim();
        while !rest.is_empty() {
            let (key, after_key) = rest.split_once('=').ok_or(Errno::EINVAL)?;
            let key = key.trim();
            let (value, after_value) = match after_key.strip_prefix('\'') {
                Some(quoted) => {
                    let end = quoted.find('\'').ok_or(Errno::EINVAL)?;
                    (&quoted[..end], &quoted[end + 1..])
                }
                None => match after_key.find(',') {
                    Some(end) => (&after_key[..end], &after_key[end..]),
                    None => (after_key, ""),
                },
            };
            parsed.set(key, value)?;
            rest = after_value.trim_start();
            if let Some(next) = rest.strip_prefix(',') {
                rest = next.trim_start();
            } else if !rest.is_empty() {
                return Err(Errno::EINVAL);
            }
        }
        Ok(parsed)
    }

    fn set(&mut self, key: &str, value: &str) -> SdResult<()> {
        let value = value.to_string();
        match key {
            "type" => {
                self.msg_type = Some(match value.as_str() {
                    "signal" => MessageType::Signal,
                    "method_call" => MessageType::MethodCall,
                    "method_return" => MessageType::MethodReturn,
                    "error" => MessageType::Error,
                    _ => return Err(Errno::EINVAL),
                })
            }
            "sender" => self.sender = Some(value),
            "interface" => self.interface = Some(value),
            "member" => self.member = Some(value),
            "path" => self.path = Some(value),
            "path_namespace" => self.path_namespace = Some(value),
            "destination" => self.destination = Some(value),
            "eavesdrop" => (),
            _ => {
                let index = key
                    .strip_prefix("arg")
                    .and_then(|n| n.parse::<usize>().ok())
                    .filter(|n| *n < 64)
                    .ok_or(Errno::EINVAL)?;
                self.args.push((index, value));
            }
        }
        Ok(())
    }

    /// Whether `m` passes every filter. Argument filters only match string arguments.
    fn matches(&self, m: &mut RawMessage) -> bool {
        fn field(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().map_or(true, |w| have == Some(w))
        }

        if self.msg_type.map_or(false, |t| t != m.msg_type()) {
            return false;
        }
        if !field(&self.sender, m.sender())
            || !field(&self.interface, m.interface())
            || !field(&self.member, m.member())
            || !field(&self.path, m.path())
            || !field(&self.destination, m.destination())
        {
            return false;
        }
        if let Some(ns) = &self.path_namespace {
            let ok = match m.path() {
                Some(path) => {
                    ns == "/"
                        || path == ns
                        || path.strip_prefix(ns.as_str()).map_or(false, |r| r.starts_with('/'))
                }
                None => false,
            };
            if !ok {
                return false;
            }
        }
        if self.args.is_empty() {
            return true;
        }
        let ok = self.args_match(m).unwrap_or(false);
        if let Err(errno) = m.rewind(true) {
            trace!("rewind after match failed: {}", errno);
        }
        ok
    }

    fn args_match(&self, m: &mut RawMessage) -> SdResult<bool> {
        let types = Type::parse(&m.signature()).map_err(|_| Errno::EBADMSG)?;
        let last = self.args.iter().map(|(ix, _)| *ix).max().unwrap_or(0);
        let mut strings = HashMap::new();
        m.rewind(true)?;
        for (ix, t) in types.iter().enumerate().take(last + 1) {
            if *t == Type::String {
                if let BasicValue::String(s) = m.read_basic(b's')? {
                    strings.insert(ix, s.into_owned());
                }
            } else {
                m.skip(&t.to_string())?;
            }
        }
        Ok(self
            .args
            .iter()
            .all(|(ix, want)| strings.get(ix).map_or(false, |have| have == want)))
    }
}

struct PendingCall {
    slot: SlotId,
    deadline: u64,
    callback: MessageHandler,
}

struct MatchEntry {
    rule: MatchRule,
    text: String,
    callback: Arc<Mutex<MessageHandler>>,
}

enum Work {
    Message(MessagePtr),
    Expired(u32, PendingCall),
    Idle,
}

struct BusState {
    transport: Option<Transport>,
    bus_client: bool,
    method_timeout_usec: u64,
    rqueue: VecDeque<MessagePtr>,
    replies: HashMap<u32, PendingCall>,
    matches: BTreeMap<SlotId, MatchEntry>,
}

impl BusState {
    fn transport(&self) -> SdResult<&Transport> {
        self.transport.as_ref().ok_or(Errno::ENOTCONN)
    }

    fn timeout_for(&self, timeout_usec: u64) -> u64 {
        if timeout_usec == 0 {
            self.method_timeout_usec
        } else {
            timeout_usec
        }
    }

    fn disconnect(&mut self, errno: Errno) -> Errno {
        warn!("bus connection lost: {}", errno);
        self.transport = None;
        errno
    }

    /// Moves every message the connection has received to the read queue.
    fn fill(&mut self) -> SdResult<()> {
        let messages = match self.transport()?.drain() {
            Ok(messages) => messages,
            Err(errno) => return Err(self.disconnect(errno)),
        };
        for m in messages {
            self.rqueue.push_back(m.into_ptr());
        }
        Ok(())
    }

    fn enqueue(&mut self, m: &MessagePtr) -> SdResult<u32> {
        let transport = self.transport()?;
        let mut m = m.lock();
        if !m.is_sealed() {
            m.seal(transport.next_serial())?;
        }
        transport.send(&m)?;
        trace!("sent {:?} serial {}", m.msg_type(), m.serial());
        Ok(m.serial())
    }

    fn next_work(&mut self, now: u64) -> Work {
        if let Some(m) = self.rqueue.pop_front() {
            return Work::Message(m);
        }
        let expired = self
            .replies
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .min_by_key(|(_, pending)| pending.deadline)
            .map(|(serial, _)| *serial);
        match expired.and_then(|serial| self.replies.remove(&serial).map(|p| (serial, p))) {
            Some((serial, pending)) => Work::Expired(serial, pending),
            None => Work::Idle,
        }
    }

    fn take_reply(&mut self, serial: u32) -> Option<MessagePtr> {
        let ix = self.rqueue.iter().position(|m| {
            let m = m.lock();
            m.reply_serial() == Some(serial)
                && matches!(m.msg_type(), MessageType::MethodReturn | MessageType::Error)
        })?;
        self.rqueue.remove(ix)
    }
}

pub struct SdBusImpl {
    state: Mutex<BusState>,
    next_slot: AtomicU64,
}

impl Default for SdBusImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl SdBusImpl {
    /// An instance with no connection; only the message primitives work.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                transport: None,
                bus_client: false,
                method_timeout_usec: DEFAULT_METHOD_TIMEOUT_USEC,
                rqueue: VecDeque::new(),
                replies: HashMap::new(),
                matches: BTreeMap::new(),
            }),
            next_slot: AtomicU64::new(1),
        }
    }

    /// Connects to `address`. A bus client registers with the daemon and
    /// learns its unique name; otherwise the peer is talked to directly.
    pub fn open(address: &str, bus_client: bool) -> SdResult<Self> {
        let transport = Transport::connect(address, bus_client)?;
        if let Some(name) = transport.unique_name() {
            debug!("connected to bus as {}", name);
        }
        Ok(Self::with_transport(transport, bus_client))
    }

    fn with_transport(transport: Transport, bus_client: bool) -> Self {
        let bus = Self::new();
        {
            let mut state = bus.state.lock();
            state.transport = Some(transport);
            state.bus_client = bus_client;
        }
        bus
    }

    pub fn set_method_timeout(&self, timeout_usec: u64) {
        self.state.lock().method_timeout_usec = if timeout_usec == 0 {
            DEFAULT_METHOD_TIMEOUT_USEC
        } else {
            timeout_usec
        };
    }

    fn next_slot(&self) -> SlotId {
        SlotId(self.next_slot.fetch_add(1, Ordering::Relaxed))
    }

    fn driver_message(&self, member: &str, args: &[BasicValue<'_>]) -> SdResult<RawMessage> {
        let mut m = RawMessage::new_method_call(
            Some(DBUS_SERVICE),
            DBUS_PATH,
            Some(DBUS_INTERFACE),
            member,
        )?;
        for arg in args {
            m.append_basic(arg)?;
        }
        Ok(m)
    }

    fn driver_call(&self, member: &str, args: &[BasicValue<'_>]) -> SdResult<MessagePtr> {
        let m = self.driver_message(member, args)?.into_ptr();
        self.bus_call(&m, 0).map_err(|err| {
            debug!("{} failed: {}", member, err);
            err.errno()
        })
    }

    fn read_u32_reply(reply: &MessagePtr) -> SdResult<u32> {
        match reply.lock().read_basic(b'u')? {
            BasicValue::Uint32(v) => Ok(v),
            _ => Err(Errno::EBADMSG),
        }
    }

    fn dispatch(&self, m: MessagePtr, take_unhandled: bool) -> SdResult<(bool, Option<MessagePtr>)> {
        let (msg_type, reply_serial) = {
            let g = m.lock();
            (g.msg_type(), g.reply_serial())
        };

        if matches!(msg_type, MessageType::MethodReturn | MessageType::Error) {
            if let Some(serial) = reply_serial {
                let pending = self.state.lock().replies.remove(&serial);
                if let Some(mut pending) = pending {
                    (pending.callback)(m);
                    return Ok((true, None));
                }
            }
        }

        let handlers: Vec<Arc<Mutex<MessageHandler>>> = {
            let state = self.state.lock();
            let mut g = m.lock();
            state
                .matches
                .values()
                .filter(|entry| entry.rule.matches(&mut g))
                .map(|entry| entry.callback.clone())
                .collect()
        };
        let handled = !handlers.is_empty();
        for handler in handlers {
            m.lock().rewind(true)?;
            match handler.try_lock() {
                Some(mut callback) => (callback)(m.clone()),
                None => warn!("match handler re-entered, skipping"),
            }
        }

        if msg_type == MessageType::MethodCall {
            m.lock().rewind(true)?;
            if take_unhandled {
                return Ok((true, Some(m)));
            }
            let reply = {
                let g = m.lock();
                if g.no_reply_expected() {
                    None
                } else {
                    let text = format!(
                        "Unknown method {} or interface {}.",
                        g.member().unwrap_or_default(),
                        g.interface().unwrap_or_default()
                    );
                    Some(g.new_method_error(&BusError::new(ERROR_UNKNOWN_METHOD, text))?)
                }
            };
            if let Some(reply) = reply {
                self.bus_send(&reply.into_ptr())?;
            }
            return Ok((true, None));
        }

        if take_unhandled && !handled {
            m.lock().rewind(true)?;
            return Ok((true, Some(m)));
        }
        Ok((true, None))
    }
}

impl SdBusInterface for SdBusImpl {
    fn message_new_method_call(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> SdResult<MessagePtr> {
        Ok(RawMessage::new_method_call(destination, path, interface, member)?.into_ptr())
    }

    fn message_new_signal(&self, path: &str, interface: &str, member: &str) -> SdResult<MessagePtr> {
        Ok(RawMessage::new_signal(path, interface, member)?.into_ptr())
    }

    fn message_new_method_return(&self, call: &MessagePtr) -> SdResult<MessagePtr> {
        Ok(call.lock().new_method_return()?.into_ptr())
    }

    fn message_new_method_error(&self, call: &MessagePtr, error: &BusError) -> SdResult<MessagePtr> {
        Ok(call.lock().new_method_error(error)?.into_ptr())
    }

    fn message_new_method_errno(&self, call: &MessagePtr, errno: Errno) -> SdResult<MessagePtr> {
        self.message_new_method_error(call, &BusError::from_errno(errno, None))
    }

    fn message_append_basic(&self, m: &MessagePtr, value: &BasicValue<'_>) -> SdResult<()> {
        m.lock().append_basic(value)
    }

    fn message_append_array(&self, m: &MessagePtr, code: u8, bytes: &[u8]) -> SdResult<()> {
        m.lock().append_array(code, bytes)
    }

    fn message_open_container(
        &self,
        m: &MessagePtr,
        kind: ContainerKind,
        contents: &str,
    ) -> SdResult<()> {
        m.lock().open_container(kind, contents)
    }

    fn message_close_container(&self, m: &MessagePtr) -> SdResult<()> {
        m.lock().close_container()
    }

    fn message_read_basic(&self, m: &MessagePtr, code: u8) -> SdResult<BasicValue<'static>> {
        m.lock().read_basic(code)
    }

    fn message_read_array(&self, m: &MessagePtr, code: u8) -> SdResult<Vec<u8>> {
        m.lock().read_array(code)
    }

    fn message_enter_container(
        &self,
        m: &MessagePtr,
        kind: ContainerKind,
        contents: Option<&str>,
    ) -> SdResult<()> {
        m.lock().enter_container(kind, contents)
    }

    fn message_exit_container(&self, m: &MessagePtr) -> SdResult<()> {
        m.lock().exit_container()
    }

    fn message_at_end(&self, m: &MessagePtr, complete: bool) -> SdResult<bool> {
        m.lock().at_end(complete)
    }

    fn message_verify_type(&self, m: &MessagePtr, code: u8, contents: Option<&str>) -> SdResult<bool> {
        m.lock().verify_type(code, contents)
    }

    fn message_peek_type(&self, m: &MessagePtr) -> SdResult<Option<(u8, Option<String>)>> {
        m.lock().peek_type()
    }

    fn message_skip(&self, m: &MessagePtr, types: &str) -> SdResult<()> {
        m.lock().skip(types)
    }

    fn message_rewind(&self, m: &MessagePtr, complete: bool) -> SdResult<()> {
        m.lock().rewind(complete)
    }

    fn message_seal(&self, m: &MessagePtr, cookie: u64) -> SdResult<()> {
        let serial = u32::try_from(cookie).map_err(|_| Errno::EINVAL)?;
        m.lock().seal(serial)
    }

    fn message_get_type(&self, m: &MessagePtr) -> MessageType {
        m.lock().msg_type()
    }

    fn message_get_cookie(&self, m: &MessagePtr) -> SdResult<u64> {
        let m = m.lock();
        if m.is_sealed() {
            Ok(u64::from(m.serial()))
        } else {
            Err(Errno(libc::ENODATA))
        }
    }

    fn message_get_reply_cookie(&self, m: &MessagePtr) -> SdResult<u64> {
        m.lock()
            .reply_serial()
            .map(u64::from)
            .ok_or(Errno(libc::ENODATA))
    }

    fn message_get_path(&self, m: &MessagePtr) -> Option<String> {
        m.lock().path().map(str::to_string)
    }

    fn message_get_interface(&self, m: &MessagePtr) -> Option<String> {
        m.lock().interface().map(str::to_string)
    }

    fn message_get_member(&self, m: &MessagePtr) -> Option<String> {
        m.lock().member().map(str::to_string)
    }

    fn message_get_sender(&self, m: &MessagePtr) -> Option<String> {
        m.lock().sender().map(str::to_string)
    }

    fn message_get_destination(&self, m: &MessagePtr) -> Option<String> {
        m.lock().destination().map(str::to_string)
    }

    fn message_get_signature(&self, m: &MessagePtr) -> String {
        m.lock().signature()
    }

    fn message_get_error(&self, m: &MessagePtr) -> Option<BusError> {
        m.lock().error()
    }

    fn message_get_errno(&self, m: &MessagePtr) -> i32 {
        m.lock().error().map_or(0, |err| err.errno().0)
    }

    fn message_is_method_call(
        &self,
        m: &MessagePtr,
        interface: Option<&str>,
        member: Option<&str>,
    ) -> bool {
        let m = m.lock();
        m.msg_type() == MessageType::MethodCall
            && interface.map_or(true, |i| m.interface() == Some(i))
            && member.map_or(true, |n| m.member() == Some(n))
    }

    fn message_is_signal(&self, m: &MessagePtr, interface: Option<&str>, member: Option<&str>) -> bool {
        let m = m.lock();
        m.msg_type() == MessageType::Signal
            && interface.map_or(true, |i| m.interface() == Some(i))
            && member.map_or(true, |n| m.member() == Some(n))
    }

    fn message_is_method_error(&self, m: &MessagePtr, name: Option<&str>) -> bool {
        let m = m.lock();
        m.msg_type() == MessageType::Error && name.map_or(true, |n| m.error_name() == Some(n))
    }

    fn bus_get_fd(&self) -> SdResult<RawFd> {
        Ok(self.state.lock().transport()?.fd())
    }

    fn bus_get_events(&self) -> SdResult<i16> {
        // Writes complete inside `bus_send`, so only input is waited for.
        self.state.lock().transport()?;
        Ok(libc::POLLIN)
    }

    fn bus_get_timeout(&self) -> SdResult<u64> {
        let state = self.state.lock();
        state.transport()?;
        if !state.rqueue.is_empty() {
            return Ok(0);
        }
        Ok(state
            .replies
            .values()
            .map(|pending| pending.deadline)
            .min()
            .unwrap_or(u64::MAX))
    }

    fn bus_process(&self, take_unhandled: bool) -> SdResult<(bool, Option<MessagePtr>)> {
        let work = {
            let mut state = self.state.lock();
            state.fill()?;
            state.next_work(monotonic_usec())
        };
        match work {
            Work::Idle => Ok((false, None)),
            Work::Expired(serial, mut pending) => {
                debug!("call with serial {} timed out", serial);
                let reply = RawMessage::new_local_error(
                    serial,
                    &BusError::new(ERROR_NO_REPLY, "Method call timed out"),
                )?;
                (pending.callback)(reply.into_ptr());
                Ok((true, None))
            }
            Work::Message(m) => self.dispatch(m, take_unhandled),
        }
    }

    fn bus_wait(&self, timeout_usec: u64) -> SdResult<bool> {
        let (fd, events, deadline) = {
            let mut state = self.state.lock();
            if !state.rqueue.is_empty() {
                return Ok(true);
            }
            let deadline = state
                .replies
                .values()
                .map(|pending| pending.deadline)
                .min()
                .unwrap_or(u64::MAX);
            (state.transport()?.fd(), libc::POLLIN, deadline)
        };
        let now = monotonic_usec();
        let deadline = if timeout_usec == u64::MAX {
            deadline
        } else {
            deadline.min(now.saturating_add(timeout_usec))
        };
        let mut fds = [libc::pollfd {
            fd,
            events,
            revents: 0,
        }];
        Ok(poll(&mut fds, poll_timeout_ms(deadline, now))? > 0)
    }

    fn bus_flush(&self) -> SdResult<()> {
        self.state.lock().transport()?;
        Ok(())
    }

    fn bus_send(&self, m: &MessagePtr) -> SdResult<u64> {
        self.state.lock().enqueue(m).map(u64::from)
    }

    fn bus_call(&self, m: &MessagePtr, timeout_usec: u64) -> Result<MessagePtr, BusError> {
        let fail = |errno: Errno| BusError::from_errno(errno, None);
        let mut state = self.state.lock();
        let serial = state.enqueue(m).map_err(fail)?;
        let deadline = monotonic_usec().saturating_add(state.timeout_for(timeout_usec));
        loop {
            if let Some(reply) = state.take_reply(serial) {
                let error = reply.lock().error();
                return match error {
                    Some(error) => Err(error),
                    None => Ok(reply),
                };
            }
            let now = monotonic_usec();
            if now >= deadline {
                return Err(fail(Errno::ETIMEDOUT));
            }
            let mut fds = [libc::pollfd {
                fd: state.transport().map_err(fail)?.fd(),
                events: libc::POLLIN,
                revents: 0,
            }];
            poll(&mut fds, poll_timeout_ms(deadline, now)).map_err(fail)?;
            state.fill().map_err(fail)?;
        }
    }

    fn bus_call_async(
        &self,
        m: &MessagePtr,
        callback: MessageHandler,
        timeout_usec: u64,
    ) -> SdResult<SlotId> {
        let slot = self.next_slot();
        let mut state = self.state.lock();
        let serial = state.enqueue(m)?;
        let deadline = monotonic_usec().saturating_add(state.timeout_for(timeout_usec));
        state.replies.insert(
            serial,
            PendingCall {
                slot,
                deadline,
                callback,
            },
        );
        Ok(slot)
    }

    fn bus_add_match(&self, rule: &str, callback: MessageHandler) -> SdResult<SlotId> {
        let parsed = MatchRule::parse(rule)?;
        let register = {
            let state = self.state.lock();
            state.bus_client && state.transport.is_some()
        };
        if register {
            self.driver_call("AddMatch", &[BasicValue::String(rule.into())])?;
        }
        let slot = self.next_slot();
        self.state.lock().matches.insert(
            slot,
            MatchEntry {
                rule: parsed,
                text: rule.to_string(),
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        Ok(slot)
    }

    fn slot_unref(&self, slot: SlotId) {
        let unregister = {
            let mut state = self.state.lock();
            state.replies.retain(|_, pending| pending.slot != slot);
            let removed = state.matches.remove(&slot);
            removed.filter(|_| state.bus_client && state.transport.is_some())
        };
        if let Some(entry) = unregister {
            let sent = self
                .driver_message("RemoveMatch", &[BasicValue::String(entry.text.into())])
                .and_then(|mut m| {
                    m.set_no_reply_expected(true);
                    self.bus_send(&m.into_ptr())
                });
            if let Err(errno) = sent {
                debug!("RemoveMatch failed: {}", errno);
            }
        }
    }

    fn bus_request_name(&self, name: &str, flags: u64) -> SdResult<()> {
        let flags = u32::try_from(flags).map_err(|_| Errno::EINVAL)?;
        let reply = self.driver_call(
            "RequestName",
            &[BasicValue::String(name.into()), BasicValue::Uint32(flags)],
        )?;
        match Self::read_u32_reply(&reply)? {
            1 | 2 => Ok(()),
            3 => Err(Errno::EEXIST),
            4 => Err(Errno::EALREADY),
            _ => Err(Errno::EIO),
        }
    }

    fn bus_release_name(&self, name: &str) -> SdResult<()> {
        let reply = self.driver_call("ReleaseName", &[BasicValue::String(name.into())])?;
        match Self::read_u32_reply(&reply)? {
            1 => Ok(()),
            2 => Err(Errno(libc::ESRCH)),
            3 => Err(Errno(libc::EADDRINUSE)),
            _ => Err(Errno::EIO),
        }
    }

    fn bus_get_unique_name(&self) -> SdResult<String> {
        self.state
            .lock()
            .transport()?
            .unique_name()
            .ok_or(Errno(libc::ENODATA))
    }

    fn bus_list_names(&self) -> SdResult<Vec<String>> {
        let reply = self.driver_call("ListNames", &[])?;
        let mut m = reply.lock();
        m.enter_container(ContainerKind::Array, Some("s"))?;
        let mut names = Vec::new();
        while !m.at_end(false)? {
            if let BasicValue::String(name) = m.read_basic(b's')? {
                names.push(name.into_owned());
            }
        }
        m.exit_container()?;
        Ok(names)
    }

    fn bus_close(&self) {
        let mut state = self.state.lock();
        if state.transport.take().is_some() {
            debug!("closing bus connection");
        }
        state.rqueue.clear();
    }

    fn bus_is_open(&self) -> bool {
        self.state.lock().transport.is_some()
    }

    fn watchdog_enabled(&self, unset_environment: bool) -> SdResult<u64> {
        let mut usec = 0;
        if !sd_notify::watchdog_enabled(unset_environment, &mut usec) {
            return Ok(0);
        }
        if usec == 0 || usec == u64::MAX {
            return Err(Errno::EINVAL);
        }
        Ok(usec)
    }

    fn notify(&self, unset_environment: bool, state: &str) -> SdResult<()> {
        sd_notify::notify(unset_environment, &[NotifyState::Custom(state)])?;
        trace!("notified service manager: {}", state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn signal(path: &str, member: &str, args: &[&str]) -> SdResult<RawMessage> {
        let mut m = RawMessage::new_signal(path, "xyz.openbmc_project.Test", member)?;
        for arg in args {
            m.append_basic(&BasicValue::String((*arg).into()))?;
        }
        m.seal(1)?;
        Ok(m)
    }

    #[test]
    fn parses_match_rules() -> SdResult<()> {
        let rule = MatchRule::parse(
            "type='signal',interface='xyz.openbmc_project.Test',path_namespace='/xyz',arg0='a,b'",
        )?;
        assert_eq!(rule.msg_type, Some(MessageType::Signal));
        assert_eq!(rule.interface.as_deref(), Some("xyz.openbmc_project.Test"));
        assert_eq!(rule.path_namespace.as_deref(), Some("/xyz"));
        assert_eq!(rule.args, vec![(0, "a,b".to_string())]);

        assert_eq!(MatchRule::parse(""), Ok(MatchRule::default()));
        assert_eq!(MatchRule::parse("type='bogus'"), Err(Errno::EINVAL));
        assert_eq!(MatchRule::parse("nonsense='x'"), Err(Errno::EINVAL));
        assert_eq!(MatchRule::parse("member='open"), Err(Errno::EINVAL));
        Ok(())
    }

    #[test]
    fn match_rules_filter_messages() -> SdResult<()> {
        let mut m = signal("/xyz/openbmc_project/sensors", "Changed", &["temp", "high"])?;
        let hit = |rule: &str, m: &mut RawMessage| MatchRule::parse(rule).map(|r| r.matches(m));

        assert!(hit("type='signal',member='Changed'", &mut m)?);
        assert!(!hit("type='method_call'", &mut m)?);
        assert!(hit("path_namespace='/xyz/openbmc_project'", &mut m)?);
        assert!(!hit("path_namespace='/xyz/openbmc'", &mut m)?);
        assert!(hit("arg1='high'", &mut m)?);
        assert!(!hit("arg0='high'", &mut m)?);
        assert!(!hit("arg2='x'", &mut m)?);

        // The cursor is left at the start for handlers.
        assert_eq!(m.read_basic(b's')?, BasicValue::String("temp".into()));
        Ok(())
    }

    #[test]
    fn unconnected_bus_reports_not_connected() -> SdResult<()> {
        let bus = SdBusImpl::new();
        assert!(!bus.bus_is_open());
        assert_eq!(bus.bus_get_fd(), Err(Errno::ENOTCONN));
        assert_eq!(bus.bus_get_timeout(), Err(Errno::ENOTCONN));
        assert_eq!(bus.bus_process(false).map(|(r, _)| r), Err(Errno::ENOTCONN));

        let m = bus.message_new_method_call(Some("a.b"), "/a", None, "Ping")?;
        bus.message_append_basic(&m, &BasicValue::Uint32(7))?;
        assert_eq!(bus.bus_send(&m), Err(Errno::ENOTCONN));
        bus.message_seal(&m, 3)?;
        assert_eq!(bus.message_get_cookie(&m), Ok(3));
        assert_eq!(bus.message_get_signature(&m), "u");
        assert!(bus.message_is_method_call(&m, None, Some("Ping")));
        assert!(!bus.message_is_signal(&m, None, None));
        Ok(())
    }

    fn peers() -> SdResult<(SdBusImpl, SdBusImpl)> {
        let (a, b) = super::super::transport::connected_pair()?;
        Ok((
            SdBusImpl::with_transport(Transport::from_connection(a)?, false),
            SdBusImpl::with_transport(Transport::from_connection(b)?, false),
        ))
    }

    /// Processes `bus` until it hands out an unhandled message.
    fn next_unhandled(bus: &SdBusImpl) -> SdResult<MessagePtr> {
        for _ in 0..100 {
            if let (_, Some(m)) = bus.bus_process(true)? {
                return Ok(m);
            }
            bus.bus_wait(20_000)?;
        }
        Err(Errno::ETIMEDOUT)
    }

    #[test]
    fn calls_are_answered_by_the_peer() -> SdResult<()> {
        let (client, server) = peers()?;
        let responder = std::thread::spawn(move || -> SdResult<()> {
            let call = next_unhandled(&server)?;
            assert!(server.message_is_method_call(&call, Some("a.b"), Some("Get")));
            let reply = server.message_new_method_return(&call)?;
            server.message_append_basic(&reply, &BasicValue::Uint32(42))?;
            server.bus_send(&reply)?;
            Ok(())
        });

        let call = client.message_new_method_call(None, "/a", Some("a.b"), "Get")?;
        let reply = client.bus_call(&call, 2_000_000).map_err(|e| e.errno())?;
        assert_eq!(client.message_read_basic(&reply, b'u')?, BasicValue::Uint32(42));
        responder.join().map_err(|_| Errno::EIO)??;
        Ok(())
    }

    #[test]
    fn matches_and_async_calls_run_during_process() -> SdResult<()> {
        let (client, server) = peers()?;
        let (tx, rx) = std::sync::mpsc::channel();
        let signals = tx.clone();
        let slot = client.bus_add_match(
            "type='signal',member='Changed'",
            Box::new(move |m| {
                let _ = signals.send(m.lock().member().map(str::to_string));
            }),
        )?;

        let signal = server.message_new_signal("/a", "a.b", "Changed")?;
        server.bus_send(&signal)?;
        let call = client.message_new_method_call(None, "/a", Some("a.b"), "Get")?;
        client.bus_call_async(
            &call,
            Box::new(move |reply| {
                let _ = tx.send(reply.lock().error().map(|e| e.name));
            }),
            2_000_000,
        )?;
        let incoming = next_unhandled(&server)?;
        let error = server.message_new_method_errno(&incoming, Errno::EINVAL)?;
        server.bus_send(&error)?;

        let mut seen = Vec::new();
        for _ in 0..100 {
            while client.bus_process(false)?.0 {}
            seen.extend(rx.try_iter());
            if seen.len() == 2 {
                break;
            }
            client.bus_wait(20_000)?;
        }
        assert!(seen.contains(&Some("Changed".to_string())));
        assert!(seen.contains(&Some("org.freedesktop.DBus.Error.InvalidArgs".to_string())));
        client.slot_unref(slot);
        Ok(())
    }

    #[test]
    fn errno_replies_name_the_error() -> SdResult<()> {
        let bus = SdBusImpl::new();
        let call = bus.message_new_method_call(None, "/", None, "Get")?;
        bus.message_seal(&call, 1)?;
        let reply = bus.message_new_method_errno(&call, Errno::EINVAL)?;
        bus.message_seal(&reply, 2)?;
        assert!(bus.message_is_method_error(
            &reply,
            Some("org.freedesktop.DBus.Error.InvalidArgs")
        ));
        assert_eq!(bus.message_get_errno(&reply), libc::EINVAL);
        assert_eq!(bus.message_get_reply_cookie(&reply), Ok(1));
        Ok(())
    }
}
