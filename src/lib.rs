//! D-Bus for services: message marshaling, bus plumbing and async scheduling.
//!
//! The crate is layered:
//!
//! * [`types`] derives D-Bus signatures from Rust types at compile time.
//! * [`message`] marshals Rust values into a [`Message`] and back, through
//!   the [`Append`] and [`Read`] traits. Tuples become structs, sequences
//!   become arrays, maps become dictionaries, and
//!   [`dbus_variant!`](crate::dbus_variant) declares variant types.
//! * [`sdbus`] is the narrow seam every bus primitive goes through.
//!   [`sdbus::SdBusImpl`] implements it on a zbus connection. With the
//!   `mock` feature, `test::SdBusMock` is a mockall double of it.
//! * [`bus`] wraps a connection; [`reactor`] drives one from a tokio
//!   runtime.
//! * [`execution`], [`scope`] and [`context`] provide a sender/receiver
//!   model with a dedicated worker thread for structured async services.
//!
//! ```
//! use std::sync::Arc;
//! use sdbusplus::message::Message;
//! use sdbusplus::sdbus::SdBusImpl;
//!
//! let mut m = Message::new_signal(
//!     Arc::new(SdBusImpl::new()),
//!     "/xyz/openbmc_project/sensors",
//!     "xyz.openbmc_project.Sensor.Value",
//!     "Changed",
//! )?;
//! m.append_args(&("fan0", 1200u32))?;
//! m.seal(1)?;
//! let (name, rpm): (String, u32) = m.unpack()?;
//! assert_eq!((name.as_str(), rpm), ("fan0", 1200));
//! # Ok::<(), sdbusplus::error::Error>(())
//! ```
//!
//! Wire format reference: the [D-Bus specification].
//!
//! [D-Bus specification]: https://dbus.freedesktop.org/doc/dbus-specification.html

mod align;
pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod message;
pub mod reactor;
pub mod scope;
pub mod sdbus;
pub mod slot;
pub mod types;
pub mod unpack_properties;
pub mod wire;

pub use bus::Bus;
pub use context::Context;
pub use error::{Error, Result};
pub use message::{Append, Message, Read};
pub use slot::Slot;
