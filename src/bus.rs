//! The connection handle.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::config::{BusConfig, BusKind};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::sdbus::{MessageHandler, SdBusImpl, SdBusInterface};
use crate::slot::Slot;

/// Microseconds for a bus primitive; `None` selects the bus default.
pub(crate) fn timeout_usec(timeout: Option<Duration>) -> u64 {
    timeout.map_or(0, |t| u64::try_from(t.as_micros()).unwrap_or(u64::MAX - 1))
}

/// A bus connection. Clones share the connection.
#[derive(Clone)]
pub struct Bus {
    intf: Arc<dyn SdBusInterface>,
}

impl Bus {
    pub fn new(intf: Arc<dyn SdBusInterface>) -> Self {
        Self { intf }
    }

    /// The user bus if a session address is set, otherwise the system bus.
    pub fn new_default() -> Result<Self> {
        Self::from_config(&BusConfig::default())
    }

    pub fn new_user() -> Result<Self> {
        Self::from_config(&BusConfig {
            kind: BusKind::User,
            ..BusConfig::default()
        })
    }

    pub fn new_system() -> Result<Self> {
        Self::from_config(&BusConfig {
            kind: BusKind::System,
            ..BusConfig::default()
        })
    }

    /// Connects to an explicit address as a bus client.
    pub fn open(address: &str) -> Result<Self> {
        Self::from_config(&BusConfig {
            address: Some(address.to_string()),
            ..BusConfig::default()
        })
    }

    pub fn from_config(config: &BusConfig) -> Result<Self> {
        let address = config.resolve_address()?;
        info!("connecting to {}", address);
        let bus = SdBusImpl::open(&address, config.bus_client)
            .map_err(|e| Error::sd_bus("bus_open", e))?;
        bus.set_method_timeout(config.method_timeout_usec);
        Ok(Self::new(Arc::new(bus)))
    }

    pub fn sdbus(&self) -> &Arc<dyn SdBusInterface> {
        &self.intf
    }

    pub fn new_method_call(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
    ) -> Result<Message> {
        Message::new_method_call(
            self.intf.clone(),
            Some(service),
            path,
            Some(interface),
            method,
        )
    }

    pub fn new_signal(&self, path: &str, interface: &str, member: &str) -> Result<Message> {
        Message::new_signal(self.intf.clone(), path, interface, member)
    }

    pub fn call(&self, m: &Message, timeout: Option<Duration>) -> Result<Message> {
        m.call(timeout)
    }

    /// Calls and waits for the reply, discarding it.
    pub fn call_noreply(&self, m: &Message, timeout: Option<Duration>) -> Result<()> {
        m.call(timeout).map(|_| ())
    }

    /// Sends without waiting; returns the cookie assigned to the message.
    pub fn send(&self, m: &Message) -> Result<u64> {
        self.intf
            .bus_send(m.get())
            .map_err(|e| Error::sd_bus("bus_send", e))
    }

    pub fn call_async<F>(&self, m: &Message, callback: F, timeout: Option<Duration>) -> Result<Slot>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        m.call_async(callback, timeout)
    }

    /// Registers `callback` for every message matching `rule` until the
    /// returned slot is dropped.
    pub fn add_match<F>(&self, rule: &str, mut callback: F) -> Result<Slot>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let weak = Arc::downgrade(&self.intf);
        let handler: MessageHandler = Box::new(move |m| {
            if let Some(intf) = weak.upgrade() {
                callback(Message::new(intf, m));
            }
        });
        let id = self
            .intf
            .bus_add_match(rule, handler)
            .map_err(|e| Error::sd_bus("bus_add_match", e))?;
        debug!("added match {:?}: {}", id, rule);
        Ok(Slot::new(&self.intf, id))
    }

    pub fn request_name(&self, name: &str) -> Result<()> {
        self.request_name_with_flags(name, 0)
    }

    pub fn request_name_with_flags(&self, name: &str, flags: u64) -> Result<()> {
        self.intf
            .bus_request_name(name, flags)
            .map_err(|e| Error::sd_bus("bus_request_name", e))
    }

    pub fn release_name(&self, name: &str) -> Result<()> {
        self.intf
            .bus_release_name(name)
            .map_err(|e| Error::sd_bus("bus_release_name", e))
    }

    pub fn get_unique_name(&self) -> Result<String> {
        self.intf
            .bus_get_unique_name()
            .map_err(|e| Error::sd_bus("bus_get_unique_name", e))
    }

    pub fn list_names_acquired(&self) -> Result<Vec<String>> {
        self.intf
            .bus_list_names()
            .map_err(|e| Error::sd_bus("bus_list_names", e))
    }

    pub fn get_fd(&self) -> Result<RawFd> {
        self.intf
            .bus_get_fd()
            .map_err(|e| Error::sd_bus("bus_get_fd", e))
    }

    pub fn get_events(&self) -> Result<i16> {
        self.intf
            .bus_get_events()
            .map_err(|e| Error::sd_bus("bus_get_events", e))
    }

    /// Absolute `CLOCK_MONOTONIC` deadline in microseconds, `u64::MAX` for none.
    pub fn get_timeout(&self) -> Result<u64> {
        self.intf
            .bus_get_timeout()
            .map_err(|e| Error::sd_bus("bus_get_timeout", e))
    }

    /// Processes one item, returning a message no handler consumed.
    pub fn process(&self) -> Result<Option<Message>> {
        let (_, unhandled) = self
            .intf
            .bus_process(true)
            .map_err(|e| Error::sd_bus("bus_process", e))?;
        Ok(unhandled.map(|m| Message::new(self.intf.clone(), m)))
    }

    /// Processes one item; returns whether there was anything to do.
    pub fn process_discard(&self) -> Result<bool> {
        self.intf
            .bus_process(false)
            .map(|(progress, _)| progress)
            .map_err(|e| Error::sd_bus("bus_process", e))
    }

    /// Blocks until the bus has work or `timeout` passes; `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let usec = timeout.map_or(u64::MAX, |t| {
            u64::try_from(t.as_micros()).unwrap_or(u64::MAX - 1)
        });
        self.intf
            .bus_wait(usec)
            .map_err(|e| Error::sd_bus("bus_wait", e))
    }

    pub fn flush(&self) -> Result<()> {
        self.intf
            .bus_flush()
            .map_err(|e| Error::sd_bus("bus_flush", e))
    }

    pub fn close(&self) {
        self.intf.bus_close();
    }

    pub fn is_open(&self) -> bool {
        self.intf.bus_is_open()
    }

    /// Watchdog interval requested by the service manager, zero if none.
    pub fn watchdog_enabled(&self) -> Result<u64> {
        self.intf
            .watchdog_enabled(false)
            .map_err(|e| Error::sd_bus("watchdog_enabled", e))
    }

    pub fn watchdog_pet(&self) -> Result<()> {
        self.intf
            .notify(false, "WATCHDOG=1")
            .map_err(|e| Error::sd_bus("notify", e))
    }

    pub fn watchdog_trigger(&self) -> Result<()> {
        self.intf
            .notify(false, "WATCHDOG=trigger")
            .map_err(|e| Error::sd_bus("notify", e))
    }
}
