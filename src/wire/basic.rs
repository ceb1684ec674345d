use std::borrow::Cow;
use std::mem::size_of;
use std::os::unix::io::RawFd;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::types::Type;

/// One basic (non-container) value as handed to or returned from the bus primitives.
#[derive(Clone, Debug, PartialEq)]
pub enum BasicValue<'a> {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(Cow<'a, str>),
    ObjectPath(Cow<'a, str>),
    Signature(Cow<'a, str>),
    UnixFd(RawFd),
}

impl<'a> BasicValue<'a> {
    pub fn type_code(&self) -> u8 {
        match self {
            BasicValue::Byte(_) => b'y',
            BasicValue::Boolean(_) => b'b',
            BasicValue::Int16(_) => b'n',
            BasicValue::Uint16(_) => b'q',
            BasicValue::Int32(_) => b'i',
            BasicValue::Uint32(_) => b'u',
            BasicValue::Int64(_) => b'x',
            BasicValue::Uint64(_) => b't',
            BasicValue::Double(_) => b'd',
            BasicValue::String(_) => b's',
            BasicValue::ObjectPath(_) => b'o',
            BasicValue::Signature(_) => b'g',
            BasicValue::UnixFd(_) => b'h',
        }
    }

    pub fn into_owned(self) -> BasicValue<'static> {
        match self {
            BasicValue::Byte(v) => BasicValue::Byte(v),
            BasicValue::Boolean(v) => BasicValue::Boolean(v),
            BasicValue::Int16(v) => BasicValue::Int16(v),
            BasicValue::Uint16(v) => BasicValue::Uint16(v),
            BasicValue::Int32(v) => BasicValue::Int32(v),
            BasicValue::Uint32(v) => BasicValue::Uint32(v),
            BasicValue::Int64(v) => BasicValue::Int64(v),
            BasicValue::Uint64(v) => BasicValue::Uint64(v),
            BasicValue::Double(v) => BasicValue::Double(v),
            BasicValue::String(v) => BasicValue::String(Cow::Owned(v.into_owned())),
            BasicValue::ObjectPath(v) => BasicValue::ObjectPath(Cow::Owned(v.into_owned())),
            BasicValue::Signature(v) => BasicValue::Signature(Cow::Owned(v.into_owned())),
            BasicValue::UnixFd(v) => BasicValue::UnixFd(v),
        }
    }

    /// Appends the value in little-endian wire form. The caller has already aligned `out`.
    pub(crate) fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            BasicValue::Byte(v) => out.push(*v),
            BasicValue::Boolean(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
            BasicValue::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            BasicValue::Uint16(v) => out.extend_from_slice(&v.to_le_bytes()),
            BasicValue::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            BasicValue::Uint32(v) => out.extend_from_slice(&v.to_le_bytes()),
            BasicValue::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            BasicValue::Uint64(v) => out.extend_from_slice(&v.to_le_bytes()),
            BasicValue::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            BasicValue::UnixFd(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
            BasicValue::String(s) | BasicValue::ObjectPath(s) => {
                let bytes = s.as_bytes();
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
                out.push(0u8);
            }
            BasicValue::Signature(s) => {
                let bytes = s.as_bytes();
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
                out.push(0u8);
            }
        }
    }

    /// Checks the value can be put on the wire as its type.
    pub(crate) fn validate(&self) -> bool {
        match self {
            BasicValue::String(s) => !s.contains('\0'),
            BasicValue::ObjectPath(s) => crate::types::ObjectPath::new(s.as_ref()).is_ok(),
            BasicValue::Signature(s) => s.len() <= 255 && Type::parse(s).is_ok(),
            _ => true,
        }
    }
}

/// Fixed-width numeric types, which may use the bulk array primitives.
pub trait FixedPrimitive: Copy + Sized {
    const CODE: u8;
    const SIZE: usize;

    fn into_basic(self) -> BasicValue<'static>;
    fn from_basic(value: &BasicValue<'_>) -> Option<Self>;
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! fixed_primitive {
    ($type:ident, $sig:expr, $variant:ident, $read:expr) => {
        impl FixedPrimitive for $type {
            const CODE: u8 = $sig as u8;
            const SIZE: usize = size_of::<$type>();

            fn into_basic(self) -> BasicValue<'static> {
                BasicValue::$variant(self)
            }

            fn from_basic(value: &BasicValue<'_>) -> Option<Self> {
                match value {
                    BasicValue::$variant(v) => Some(*v),
                    _ => None,
                }
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                $read(bytes)
            }
        }
    };
}

fixed_primitive!(u8, 'y', Byte, |b: &[u8]| b[0]);
fixed_primitive!(i16, 'n', Int16, LittleEndian::read_i16);
fixed_primitive!(u16, 'q', Uint16, LittleEndian::read_u16);
fixed_primitive!(i32, 'i', Int32, LittleEndian::read_i32);
fixed_primitive!(u32, 'u', Uint32, LittleEndian::read_u32);
fixed_primitive!(i64, 'x', Int64, LittleEndian::read_i64);
fixed_primitive!(u64, 't', Uint64, LittleEndian::read_u64);
fixed_primitive!(f64, 'd', Double, LittleEndian::read_f64);

/// Byte order of a received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Endian {
    Little,
    Big,
}

impl Endian {
    pub(crate) fn from_marker(marker: u8) -> Option<Endian> {
        match marker {
            b'l' => Some(Endian::Little),
            b'B' => Some(Endian::Big),
            _ => None,
        }
    }

    pub(crate) fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(buf),
            Endian::Big => BigEndian::read_u16(buf),
        }
    }

    pub(crate) fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }

    pub(crate) fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(buf),
            Endian::Big => BigEndian::read_u64(buf),
        }
    }

    /// Rewrites a packed array of `size`-wide elements into little-endian order.
    pub(crate) fn to_little(self, bytes: &mut [u8], size: usize) {
        if self == Endian::Big && size > 1 {
            for chunk in bytes.chunks_mut(size) {
                chunk.reverse();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn serialize_basic_values() {
        let mut out = Vec::new();
        BasicValue::Boolean(true).serialize(&mut out);
        assert_eq!(out, vec![1, 0, 0, 0]);

        let mut out = Vec::new();
        BasicValue::String(Cow::Borrowed("Hi")).serialize(&mut out);
        assert_eq!(out, vec![2, 0, 0, 0, 72, 105, 0]);

        let mut out = Vec::new();
        BasicValue::Signature(Cow::Borrowed("as")).serialize(&mut out);
        assert_eq!(out, vec![2, b'a', b's', 0]);
    }

    #[test]
    fn validates_strings() {
        assert!(!BasicValue::String(Cow::Borrowed("a\0b")).validate());
        assert!(!BasicValue::ObjectPath(Cow::Borrowed("relative")).validate());
        assert!(BasicValue::Signature(Cow::Borrowed("a{sv}")).validate());
    }

    #[test]
    fn big_endian_arrays_are_swapped() {
        let mut data = vec![0, 0, 0, 7, 0, 0, 1, 0];
        Endian::Big.to_little(&mut data, 4);
        assert_eq!(u32::read_le(&data[0..4]), 7);
        assert_eq!(u32::read_le(&data[4..8]), 256);
    }
}
