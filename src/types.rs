//! Mapping from Rust types to D-Bus type signatures.
//!
//! Every marshalable type implements [`DbusType`], which yields a [`Type`]
//! tag without touching any message. The tag's `Display` is the signature
//! string the value is written and read against.

pub mod native;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use crate::error::{Error, Result};

pub use native::{DictEntry, ObjectPath, Signature, UnixFd};

/// The closed set of wire value shapes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Array(Box<Type>),
    Struct(Vec<Type>),
    DictEntry(Box<Type>, Box<Type>),
    Variant,
}

/// Container frames as the bus primitives name them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Array,
    Struct,
    DictEntry,
    Variant,
}

impl ContainerKind {
    /// The sd-bus type code used when opening a frame of this kind.
    pub fn code(self) -> u8 {
        match self {
            ContainerKind::Array => b'a',
            ContainerKind::Struct => b'r',
            ContainerKind::DictEntry => b'e',
            ContainerKind::Variant => b'v',
        }
    }

    /// The signature text this container occupies in its parent, given its contents.
    pub(crate) fn wrap(self, contents: &str) -> String {
        match self {
            ContainerKind::Array => format!("a{}", contents),
            ContainerKind::Struct => format!("({})", contents),
            ContainerKind::DictEntry => format!("{{{}}}", contents),
            ContainerKind::Variant => "v".to_string(),
        }
    }

    pub(crate) fn alignment(self) -> usize {
        match self {
            ContainerKind::Array => 4,
            ContainerKind::Struct | ContainerKind::DictEntry => 8,
            ContainerKind::Variant => 1,
        }
    }
}

impl Type {
    /// First signature character of this type.
    pub fn code(&self) -> u8 {
        match self {
            Type::Byte => b'y',
            Type::Boolean => b'b',
            Type::Int16 => b'n',
            Type::Uint16 => b'q',
            Type::Int32 => b'i',
            Type::Uint32 => b'u',
            Type::Int64 => b'x',
            Type::Uint64 => b't',
            Type::Double => b'd',
            Type::String => b's',
            Type::ObjectPath => b'o',
            Type::Signature => b'g',
            Type::UnixFd => b'h',
            Type::Array(_) => b'a',
            Type::Struct(_) => b'(',
            Type::DictEntry(_, _) => b'{',
            Type::Variant => b'v',
        }
    }

    pub fn from_basic_code(code: u8) -> Option<Type> {
        Some(match code {
            b'y' => Type::Byte,
            b'b' => Type::Boolean,
            b'n' => Type::Int16,
            b'q' => Type::Uint16,
            b'i' => Type::Int32,
            b'u' => Type::Uint32,
            b'x' => Type::Int64,
            b't' => Type::Uint64,
            b'd' => Type::Double,
            b's' => Type::String,
            b'o' => Type::ObjectPath,
            b'g' => Type::Signature,
            b'h' => Type::UnixFd,
            _ => return None,
        })
    }

    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::Uint16 => 2,
            Type::Boolean
            | Type::Int32
            | Type::Uint32
            | Type::String
            | Type::ObjectPath
            | Type::UnixFd
            | Type::Array(_) => 4,
            Type::Int64
            | Type::Uint64
            | Type::Double
            | Type::Struct(_)
            | Type::DictEntry(_, _) => 8,
        }
    }

    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Array(_) | Type::Struct(_) | Type::DictEntry(_, _) | Type::Variant
        )
    }

    /// Wire size of fixed-width types, usable with the bulk array primitives.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Type::Byte => Some(1),
            Type::Int16 | Type::Uint16 => Some(2),
            Type::Boolean | Type::Int32 | Type::Uint32 | Type::UnixFd => Some(4),
            Type::Int64 | Type::Uint64 | Type::Double => Some(8),
            _ => None,
        }
    }

    /// Parses a signature into its sequence of complete types.
    pub fn parse(signature: &str) -> Result<Vec<Type>> {
        let bytes = signature.as_bytes();
        if bytes.len() > 255 {
            return Err(Error::InvalidSignature(signature.to_string()));
        }
        let mut ix = 0;
        let mut types = Vec::new();
        while ix < bytes.len() {
            types.push(parse_one(bytes, &mut ix, 0, 0).ok_or_else(|| {
                Error::InvalidSignature(signature.to_string())
            })?);
        }
        Ok(types)
    }

    /// Parses a signature that must hold exactly one complete type.
    pub fn parse_single(signature: &str) -> Result<Type> {
        let mut types = Type::parse(signature)?;
        if types.len() != 1 {
            return Err(Error::InvalidSignature(signature.to_string()));
        }
        Ok(types.remove(0))
    }
}

const MAX_DEPTH: usize = 32;

fn parse_one(sig: &[u8], ix: &mut usize, arrays: usize, structs: usize) -> Option<Type> {
    let code = *sig.get(*ix)?;
    *ix += 1;
    if let Some(basic) = Type::from_basic_code(code) {
        return Some(basic);
    }
    match code {
        b'v' => Some(Type::Variant),
        b'a' => {
            if arrays >= MAX_DEPTH {
                return None;
            }
            if sig.get(*ix) == Some(&b'{') {
                *ix += 1;
                let key = parse_one(sig, ix, arrays + 1, structs + 1)?;
                if !key.is_basic() {
                    return None;
                }
                let value = parse_one(sig, ix, arrays + 1, structs + 1)?;
                if sig.get(*ix) != Some(&b'}') {
                    return None;
                }
                *ix += 1;
                Some(Type::Array(Box::new(Type::DictEntry(
                    Box::new(key),
                    Box::new(value),
                ))))
            } else {
                Some(Type::Array(Box::new(parse_one(
                    sig,
                    ix,
                    arrays + 1,
                    structs,
                )?)))
            }
        }
        b'(' => {
            if structs >= MAX_DEPTH {
                return None;
            }
            let mut fields = Vec::new();
            while sig.get(*ix) != Some(&b')') {
                fields.push(parse_one(sig, ix, arrays, structs + 1)?);
            }
            *ix += 1;
            if fields.is_empty() {
                return None;
            }
            Some(Type::Struct(fields))
        }
        _ => None,
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Array(elem) => write!(f, "a{}", elem),
            Type::Struct(fields) => {
                write!(f, "(")?;
                for field in fields {
                    write!(f, "{}", field)?;
                }
                write!(f, ")")
            }
            Type::DictEntry(key, value) => write!(f, "{{{}{}}}", key, value),
            basic => write!(f, "{}", basic.code() as char),
        }
    }
}

/// Concatenated signature of a sequence of types.
pub fn signature_of(types: &[Type]) -> String {
    types.iter().map(|t| t.to_string()).collect()
}

/// A Rust type with a fixed D-Bus representation.
pub trait DbusType {
    fn dbus_type() -> Type;
}

/// Signature string of `T`.
pub fn signature<T: DbusType + ?Sized>() -> String {
    T::dbus_type().to_string()
}

macro_rules! basic_type {
    ($type:ty, $tag:expr) => {
        impl DbusType for $type {
            fn dbus_type() -> Type {
                $tag
            }
        }
    };
}

basic_type!(u8, Type::Byte);
basic_type!(bool, Type::Boolean);
basic_type!(i16, Type::Int16);
basic_type!(u16, Type::Uint16);
basic_type!(i32, Type::Int32);
basic_type!(u32, Type::Uint32);
basic_type!(i64, Type::Int64);
basic_type!(u64, Type::Uint64);
basic_type!(f64, Type::Double);
basic_type!(str, Type::String);
basic_type!(String, Type::String);
basic_type!(ObjectPath, Type::ObjectPath);
basic_type!(Signature, Type::Signature);
basic_type!(UnixFd, Type::UnixFd);

impl<T: DbusType + ?Sized> DbusType for &T {
    fn dbus_type() -> Type {
        T::dbus_type()
    }
}

macro_rules! sequence_type {
    ($($type:ident),+) => {
        $(
            impl<T: DbusType> DbusType for $type<T> {
                fn dbus_type() -> Type {
                    Type::Array(Box::new(T::dbus_type()))
                }
            }
        )+
    };
}

sequence_type!(Vec, VecDeque, BTreeSet, HashSet);

impl<T: DbusType> DbusType for [T] {
    fn dbus_type() -> Type {
        Type::Array(Box::new(T::dbus_type()))
    }
}

impl<T: DbusType, const N: usize> DbusType for [T; N] {
    fn dbus_type() -> Type {
        Type::Array(Box::new(T::dbus_type()))
    }
}

impl<K: DbusType, V: DbusType> DbusType for DictEntry<K, V> {
    fn dbus_type() -> Type {
        Type::DictEntry(Box::new(K::dbus_type()), Box::new(V::dbus_type()))
    }
}

impl<K: DbusType, V: DbusType> DbusType for BTreeMap<K, V> {
    fn dbus_type() -> Type {
        Type::Array(Box::new(DictEntry::<K, V>::dbus_type()))
    }
}

impl<K: DbusType, V: DbusType, S> DbusType for HashMap<K, V, S> {
    fn dbus_type() -> Type {
        Type::Array(Box::new(DictEntry::<K, V>::dbus_type()))
    }
}

macro_rules! tuple_type {
    ($($name:ident)+) => {
        impl<$($name: DbusType),+> DbusType for ($($name,)+) {
            fn dbus_type() -> Type {
                Type::Struct(vec![$($name::dbus_type()),+])
            }
        }
    };
}

tuple_type!(A);
tuple_type!(A B);
tuple_type!(A B C);
tuple_type!(A B C D);
tuple_type!(A B C D E);
tuple_type!(A B C D E F);
tuple_type!(A B C D E F G);
tuple_type!(A B C D E F G H);
tuple_type!(A B C D E F G H I);
tuple_type!(A B C D E F G H I J);
tuple_type!(A B C D E F G H I J K);
tuple_type!(A B C D E F G H I J K L);
