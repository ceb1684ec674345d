//! Variants and enums.
//!
//! A variant is written with the signature of the alternative it holds. On
//! read, alternatives are tried in declaration order and the first one
//! whose signature equals the wire signature wins. Strings are special:
//! when the winning alternative travels as `s`, the string is read once and
//! offered to that alternative. If it is an enum that does not recognize the
//! value, every later enum gets the string before any later `String` does.
//! A variant that matches none of the alternatives is skipped and reads as
//! the default.
//!
//! [`dbus_variant!`](crate::dbus_variant) and [`dbus_enum!`](crate::dbus_enum)
//! generate the trait implementations.

use log::{debug, trace};

use super::{Append, MessageReader, MessageWriter, Read};
use crate::error::{Errno, Error, Result};
use crate::types::{signature, ContainerKind};

/// Extracts the alternative of type `T`, if that is the one held.
pub trait Holds<T> {
    fn get_if(&self) -> Option<&T>;
}

/// Writes `value` wrapped in a variant.
pub fn append_alternative<T: Append + ?Sized>(w: &mut MessageWriter<'_>, value: &T) -> Result<()> {
    w.open_container(ContainerKind::Variant, &signature::<T>())?;
    value.append_to(w)?;
    w.close_container()
}

enum State<V> {
    Searching,
    /// A string refused by the first matching alternative, with the first
    /// later `String` alternative holding it.
    Text(String, Option<V>),
    Done(V),
}

/// Resolves one wire variant against a list of alternatives.
pub struct VariantDecoder<'r, 'm, V> {
    reader: &'r mut MessageReader<'m>,
    contents: String,
    state: State<V>,
}

impl<'r, 'm, V: Default> VariantDecoder<'r, 'm, V> {
    pub fn new(reader: &'r mut MessageReader<'m>) -> Result<Self> {
        let contents = match reader.peek_type()? {
            Some((b'v', Some(contents))) => contents,
            _ => return Err(Error::sd_bus("message_enter_container", Errno::ENXIO)),
        };
        Ok(Self {
            reader,
            contents,
            state: State::Searching,
        })
    }

    pub fn alternative<T: Read, F: FnOnce(T) -> V>(mut self, wrap: F) -> Result<Self> {
        self.state = match std::mem::replace(&mut self.state, State::Searching) {
            State::Searching if self.contents == signature::<T>() => {
                self.reader
                    .enter_container(ContainerKind::Variant, Some(&self.contents))?;
                if T::STRING_LIKE {
                    let text = String::read_from(self.reader)?;
                    self.reader.exit_container()?;
                    match T::from_string_value(&text) {
                        Some(value) => State::Done(wrap(value)),
                        None => {
                            trace!("'{}' rejected by first matching alternative", text);
                            State::Text(text, None)
                        }
                    }
                } else {
                    let value = T::read_from(self.reader)?;
                    self.reader.exit_container()?;
                    State::Done(wrap(value))
                }
            }
            State::Text(text, fallback) if T::STRING_ENUM => match T::from_string_value(&text) {
                Some(value) => State::Done(wrap(value)),
                None => State::Text(text, fallback),
            },
            State::Text(text, None) if T::STRING_LIKE => {
                let fallback = T::from_string_value(&text).map(wrap);
                State::Text(text, fallback)
            }
            state => state,
        };
        Ok(self)
    }

    pub fn finish(self) -> Result<V> {
        match self.state {
            State::Done(value) => Ok(value),
            State::Text(_, Some(value)) => Ok(value),
            State::Text(_, None) => Err(Error::InvalidEnumString),
            State::Searching => {
                debug!("no alternative for variant of '{}', skipping", self.contents);
                self.reader.skip("v")?;
                Ok(V::default())
            }
        }
    }
}

/// Declares an enum of alternatives that travels as a D-Bus variant.
///
/// The first alternative provides `Default`. Alternatives must have
/// distinct types.
///
/// ```
/// sdbusplus::dbus_variant! {
///     #[derive(Clone, Debug, PartialEq)]
///     pub enum Value {
///         Str(String),
///         Int(i64),
///     }
/// }
///
/// assert_eq!(Value::default(), Value::Str(String::new()));
/// ```
#[macro_export]
macro_rules! dbus_variant {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($alt:ident($ty:ty)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $($alt($ty)),+
        }

        impl ::std::default::Default for $name {
            fn default() -> Self {
                $crate::dbus_variant!(@first $name $($alt($ty)),+)
            }
        }

        impl $crate::types::DbusType for $name {
            fn dbus_type() -> $crate::types::Type {
                $crate::types::Type::Variant
            }
        }

        impl $crate::message::Append for $name {
            fn append_to(
                &self,
                w: &mut $crate::message::MessageWriter<'_>,
            ) -> $crate::error::Result<()> {
                match self {
                    $($name::$alt(value) => $crate::message::variant::append_alternative(w, value),)+
                }
            }
        }

        impl $crate::message::Read for $name {
            fn read_from(
                r: &mut $crate::message::MessageReader<'_>,
            ) -> $crate::error::Result<Self> {
                $crate::message::variant::VariantDecoder::new(r)?
                    $(.alternative::<$ty, _>($name::$alt)?)+
                    .finish()
            }
        }

        $(
            impl $crate::message::Holds<$ty> for $name {
                fn get_if(&self) -> ::std::option::Option<&$ty> {
                    match self {
                        $name::$alt(value) => ::std::option::Option::Some(value),
                        #[allow(unreachable_patterns)]
                        _ => ::std::option::Option::None,
                    }
                }
            }
        )+
    };
    (@first $name:ident $alt:ident($ty:ty) $(, $rest:ident($rty:ty))*) => {
        $name::$alt(<$ty as ::std::default::Default>::default())
    };
}

/// Declares an enum that travels as its fully qualified string name,
/// `"<prefix>.<Variant>"`. The first variant provides `Default`.
///
/// ```
/// sdbusplus::dbus_enum! {
///     pub enum Level as "xyz.openbmc_project.Logging.Entry.Level" {
///         Error,
///         Info,
///     }
/// }
///
/// assert_eq!(
///     Level::Info.to_dbus_string(),
///     "xyz.openbmc_project.Logging.Entry.Level.Info"
/// );
/// assert_eq!(Level::from_dbus_string("Info"), None);
/// ```
#[macro_export]
macro_rules! dbus_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident as $prefix:literal {
            $first:ident $(, $variant:ident)* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        $vis enum $name {
            $first,
            $($variant),*
        }

        impl $name {
            pub fn to_dbus_string(self) -> &'static str {
                match self {
                    $name::$first => concat!($prefix, ".", stringify!($first)),
                    $($name::$variant => concat!($prefix, ".", stringify!($variant)),)*
                }
            }

            pub fn from_dbus_string(value: &str) -> ::std::option::Option<Self> {
                match value {
                    concat!($prefix, ".", stringify!($first)) => ::std::option::Option::Some($name::$first),
                    $(concat!($prefix, ".", stringify!($variant)) => ::std::option::Option::Some($name::$variant),)*
                    _ => ::std::option::Option::None,
                }
            }
        }

        impl ::std::default::Default for $name {
            fn default() -> Self {
                $name::$first
            }
        }

        impl $crate::types::DbusType for $name {
            fn dbus_type() -> $crate::types::Type {
                $crate::types::Type::String
            }
        }

        impl $crate::message::Append for $name {
            fn append_to(
                &self,
                w: &mut $crate::message::MessageWriter<'_>,
            ) -> $crate::error::Result<()> {
                $crate::message::Append::append_to(self.to_dbus_string(), w)
            }
        }

        impl $crate::message::Read for $name {
            fn read_from(
                r: &mut $crate::message::MessageReader<'_>,
            ) -> $crate::error::Result<Self> {
                let text = <::std::string::String as $crate::message::Read>::read_from(r)?;
                $name::from_dbus_string(&text).ok_or($crate::error::Error::InvalidEnumString)
            }

            const STRING_LIKE: bool = true;

            const STRING_ENUM: bool = true;

            fn from_string_value(value: &str) -> ::std::option::Option<Self> {
                $name::from_dbus_string(value)
            }
        }
    };
}
