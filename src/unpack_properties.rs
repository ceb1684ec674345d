//! Extracting typed values from a property map such as the reply of
//! `org.freedesktop.DBus.Properties.GetAll`.
//!
//! ```
//! use sdbusplus::types::DictEntry;
//! use sdbusplus::unpack_properties::unpack_properties;
//!
//! sdbusplus::dbus_variant! {
//!     #[derive(Clone, Debug, PartialEq)]
//!     pub enum Value {
//!         Str(String),
//!         Num(u32),
//!     }
//! }
//!
//! let data = vec![
//!     DictEntry("Name".to_string(), Value::Str("fan0".to_string())),
//!     DictEntry("Speed".to_string(), Value::Num(1200)),
//! ];
//! let mut name = String::new();
//! let mut speed = 0u32;
//! let mut target: Option<u32> = None;
//! unpack_properties(&data)
//!     .property("Name", &mut name)
//!     .property("Speed", &mut speed)
//!     .optional("Target", &mut target)
//!     .finish()?;
//! assert_eq!((name.as_str(), speed, target), ("fan0", 1200, None));
//! # Ok::<(), sdbusplus::error::UnpackPropertyError>(())
//! ```

use log::debug;

use crate::error::{UnpackPropertyError, UnpackReason};
use crate::message::Holds;
use crate::types::DictEntry;

pub fn unpack_properties<V>(data: &[DictEntry<String, V>]) -> Unpacker<'_, V> {
    Unpacker {
        data,
        failure: None,
    }
}

/// Collects properties one at a time, remembering the first failure.
pub struct Unpacker<'a, V> {
    data: &'a [DictEntry<String, V>],
    failure: Option<UnpackPropertyError>,
}

impl<'a, V> Unpacker<'a, V> {
    /// Extracts a required property into `out`.
    pub fn property<T: Clone>(mut self, name: &str, out: &mut T) -> Self
    where
        V: Holds<T>,
    {
        match self.lookup(name) {
            Lookup::Found(value) => *out = value,
            Lookup::Failed(reason) => self.fail(name, reason),
            Lookup::Absent => self.fail(name, UnpackReason::MissingProperty),
        }
        self
    }

    /// Extracts a property into `out` if present. `out` is left untouched
    /// when the property is absent.
    pub fn optional<T: Clone>(mut self, name: &str, out: &mut Option<T>) -> Self
    where
        V: Holds<T>,
    {
        match self.lookup(name) {
            Lookup::Found(value) => *out = Some(value),
            Lookup::Failed(reason) => self.fail(name, reason),
            Lookup::Absent => {}
        }
        self
    }

    pub fn finish(self) -> Result<(), UnpackPropertyError> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Reports the first failure to `on_error` instead of returning it.
    /// Returns whether every property unpacked.
    pub fn finish_with<F: FnOnce(UnpackReason, &str)>(self, on_error: F) -> bool {
        match self.failure {
            Some(failure) => {
                on_error(failure.reason, &failure.property);
                false
            }
            None => true,
        }
    }

    fn fail(&mut self, name: &str, reason: UnpackReason) {
        debug!("unpacking property {}: {}", name, reason);
        if self.failure.is_none() {
            self.failure = Some(UnpackPropertyError::new(name, reason));
        }
    }

    fn lookup<T: Clone>(&self, name: &str) -> Lookup<T>
    where
        V: Holds<T>,
    {
        let mut present = false;
        let mut found: Option<T> = None;
        let mut matched = 0usize;
        for DictEntry(key, value) in self.data {
            if key != name {
                continue;
            }
            present = true;
            if let Some(v) = value.get_if() {
                matched += 1;
                found = Some(v.clone());
            }
        }
        match (matched, found) {
            (1, Some(value)) => Lookup::Found(value),
            (0, _) if !present => Lookup::Absent,
            (0, _) => Lookup::Failed(UnpackReason::WrongType),
            _ => Lookup::Failed(UnpackReason::AppearsMoreThanOnce),
        }
    }
}

enum Lookup<T> {
    Found(T),
    Absent,
    Failed(UnpackReason),
}
