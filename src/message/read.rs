//! The unmarshaler, the mirror image of [`super::append`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{BuildHasher, Hash};

use super::MessageReader;
use crate::error::{Errno, Error, Result};
use crate::types::{signature, ContainerKind, DbusType, DictEntry, ObjectPath, Signature, UnixFd};
use crate::wire::basic::FixedPrimitive;
use crate::wire::BasicValue;

pub trait Read: DbusType + Sized {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self>;

    /// Reads one array of `Self`.
    fn read_vec(r: &mut MessageReader<'_>) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        read_sequence(r, |item| out.push(item))?;
        Ok(out)
    }

    /// Whether this type travels as a string that a variant may need to
    /// convert, i.e. `String` itself and enums.
    const STRING_LIKE: bool = false;

    /// Whether this type is an enum carried by its string name.
    const STRING_ENUM: bool = false;

    /// Conversion from the string form of a string-like type.
    fn from_string_value(_value: &str) -> Option<Self> {
        None
    }
}

fn read_sequence<T: Read>(r: &mut MessageReader<'_>, mut push: impl FnMut(T)) -> Result<()> {
    r.enter_container(ContainerKind::Array, Some(&signature::<T>()))?;
    while !r.at_end(false)? {
        push(T::read_from(r)?);
    }
    r.exit_container()
}

fn mismatch() -> Error {
    Error::sd_bus("message_read_basic", Errno::ENXIO)
}

macro_rules! read_fixed {
    ($($type:ty),+) => {
        $(
            impl Read for $type {
                fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
                    let value = r.read_basic(<$type as FixedPrimitive>::CODE)?;
                    <$type as FixedPrimitive>::from_basic(&value).ok_or_else(mismatch)
                }

                fn read_vec(r: &mut MessageReader<'_>) -> Result<Vec<Self>> {
                    let bytes = r.read_array(<$type as FixedPrimitive>::CODE)?;
                    Ok(bytes
                        .chunks_exact(<$type as FixedPrimitive>::SIZE)
                        .map(<$type as FixedPrimitive>::read_le)
                        .collect())
                }
            }
        )+
    };
}

read_fixed!(u8, i16, u16, i32, u32, i64, u64, f64);

impl Read for bool {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        match r.read_basic(b'b')? {
            BasicValue::Boolean(v) => Ok(v),
            _ => Err(mismatch()),
        }
    }
}

impl Read for String {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        match r.read_basic(b's')? {
            BasicValue::String(s) => Ok(s.into_owned()),
            _ => Err(mismatch()),
        }
    }

    const STRING_LIKE: bool = true;

    fn from_string_value(value: &str) -> Option<Self> {
        Some(value.to_string())
    }
}

impl Read for ObjectPath {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        match r.read_basic(b'o')? {
            BasicValue::ObjectPath(s) => Ok(ObjectPath::from_wire(s.into_owned())),
            _ => Err(mismatch()),
        }
    }
}

impl Read for Signature {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        match r.read_basic(b'g')? {
            BasicValue::Signature(s) => Ok(Signature::from_wire(s.into_owned())),
            _ => Err(mismatch()),
        }
    }
}

/// The descriptor stays owned by the message; duplicate it to keep it
/// past the message's lifetime.
impl Read for UnixFd {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        match r.read_basic(b'h')? {
            BasicValue::UnixFd(fd) => Ok(UnixFd(fd)),
            _ => Err(mismatch()),
        }
    }
}

impl<T: Read> Read for Vec<T> {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        T::read_vec(r)
    }
}

impl<T: Read, const N: usize> Read for [T; N] {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        let items = T::read_vec(r)?;
        <[T; N]>::try_from(items).map_err(|_| Error::sd_bus("message_read_array", Errno::EBADMSG))
    }
}

impl<T: Read> Read for VecDeque<T> {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(T::read_vec(r)?.into())
    }
}

impl<T: Read + Ord> Read for BTreeSet<T> {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut out = BTreeSet::new();
        read_sequence(r, |item| {
            out.insert(item);
        })?;
        Ok(out)
    }
}

impl<T: Read + Eq + Hash> Read for HashSet<T> {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut out = HashSet::new();
        read_sequence(r, |item| {
            out.insert(item);
        })?;
        Ok(out)
    }
}

impl<K: Read, V: Read> Read for DictEntry<K, V> {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        let contents = format!("{}{}", signature::<K>(), signature::<V>());
        r.enter_container(ContainerKind::DictEntry, Some(&contents))?;
        let key = K::read_from(r)?;
        let value = V::read_from(r)?;
        r.exit_container()?;
        Ok(DictEntry(key, value))
    }
}

impl<K: Read + Ord, V: Read> Read for BTreeMap<K, V> {
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut out = BTreeMap::new();
        read_sequence(r, |DictEntry(k, v): DictEntry<K, V>| {
            out.insert(k, v);
        })?;
        Ok(out)
    }
}

impl<K, V, S> Read for HashMap<K, V, S>
where
    K: Read + Eq + Hash,
    V: Read,
    S: BuildHasher + Default,
{
    fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut out = HashMap::with_hasher(S::default());
        read_sequence(r, |DictEntry(k, v): DictEntry<K, V>| {
            out.insert(k, v);
        })?;
        Ok(out)
    }
}

/// A list of top-level arguments.
pub trait ReadArgs: Sized {
    fn read_args(r: &mut MessageReader<'_>) -> Result<Self>;
}

impl ReadArgs for () {
    fn read_args(_r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! read_tuple {
    ($($name:ident)+) => {
        impl<$($name: Read),+> Read for ($($name,)+) {
            fn read_from(r: &mut MessageReader<'_>) -> Result<Self> {
                let contents = [$(signature::<$name>()),+].concat();
                r.enter_container(ContainerKind::Struct, Some(&contents))?;
                let value = ($($name::read_from(r)?,)+);
                r.exit_container()?;
                Ok(value)
            }
        }

        impl<$($name: Read),+> ReadArgs for ($($name,)+) {
            fn read_args(r: &mut MessageReader<'_>) -> Result<Self> {
                Ok(($($name::read_from(r)?,)+))
            }
        }
    };
}

read_tuple!(A);
read_tuple!(A B);
read_tuple!(A B C);
read_tuple!(A B C D);
read_tuple!(A B C D E);
read_tuple!(A B C D E F);
read_tuple!(A B C D E F G);
read_tuple!(A B C D E F G H);
read_tuple!(A B C D E F G H I);
read_tuple!(A B C D E F G H I J);
read_tuple!(A B C D E F G H I J K);
read_tuple!(A B C D E F G H I J K L);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::sdbus::{SdBusImpl, SdBusInterface};
    use crate::test::{delegate_messages, SdBusMock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use test_log::test;

    fn sealed<A: crate::message::AppendArgs>(args: &A) -> Result<Message> {
        let mut m = Message::new_signal(
            Arc::new(SdBusImpl::new()),
            "/xyz/openbmc_project/test",
            "xyz.openbmc_project.Test",
            "Changed",
        )?;
        m.append_args(args)?;
        m.seal(1)?;
        Ok(m)
    }

    #[test]
    fn tuple_example_round_trips() -> Result<()> {
        let mut m = sealed(&((3i32, "hi".to_string(), false),))?;
        assert_eq!(m.get_signature(), "(isb)");
        assert_eq!(m.read::<(i32, String, bool)>()?, (3, "hi".to_string(), false));
        Ok(())
    }

    #[test]
    fn containers_round_trip() -> Result<()> {
        let mut map = BTreeMap::new();
        map.insert("one".to_string(), vec![1.5f64, -2.0]);
        map.insert("two".to_string(), vec![]);
        let mut hashed = HashMap::new();
        hashed.insert(7u16, ObjectPath::new("/a/b")?);
        let set: BTreeSet<i64> = [3, -1, 9].into_iter().collect();
        let bytes = [1u8, 2, 3, 4];
        let entries = vec![DictEntry("k".to_string(), true)];

        let mut m = sealed(&(map.clone(), hashed.clone(), set.clone(), bytes, entries.clone()))?;
        assert_eq!(m.get_signature(), "a{sad}a{qo}axaya{sb}");
        let (m1, m2, m3, m4, m5): (
            BTreeMap<String, Vec<f64>>,
            HashMap<u16, ObjectPath>,
            BTreeSet<i64>,
            [u8; 4],
            Vec<DictEntry<String, bool>>,
        ) = m.unpack()?;
        assert_eq!(m1, map);
        assert_eq!(m2, hashed);
        assert_eq!(m3, set);
        assert_eq!(m4, bytes);
        assert_eq!(m5, entries);
        Ok(())
    }

    #[test]
    fn type_mismatch_is_an_error() -> Result<()> {
        let mut m = sealed(&(1u32, "s"))?;
        assert_eq!(
            m.read::<String>(),
            Err(Error::sd_bus("message_read_basic", Errno::ENXIO))
        );
        m.rewind(true)?;
        assert!(matches!(
            m.read::<Vec<u32>>(),
            Err(Error::SdBus {
                primitive: "message_read_array",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn fixed_array_length_is_checked() -> Result<()> {
        let mut m = sealed(&(vec![1u32, 2, 3],))?;
        assert!(m.read::<[u32; 2]>().is_err());
        Ok(())
    }

    #[test]
    fn numeric_vectors_use_bulk_read() -> Result<()> {
        let engine = Arc::new(SdBusImpl::new());
        let basics = Arc::new(AtomicUsize::new(0));
        let mut mock = SdBusMock::new();
        let e = engine.clone();
        mock.expect_message_read_array()
            .withf(|_, code| *code == b't')
            .times(1)
            .returning(move |m, code| e.message_read_array(m, code));
        let (e, n) = (engine.clone(), basics.clone());
        mock.expect_message_read_basic().returning(move |m, code| {
            n.fetch_add(1, Ordering::SeqCst);
            e.message_read_basic(m, code)
        });
        delegate_messages(&mut mock);

        let mut m = Message::new_signal(Arc::new(mock), "/a", "a.b", "C")?;
        m.append(&vec![5u64, 6, 7])?;
        m.append(&vec!["x".to_string()])?;
        m.seal(1)?;
        let (numbers, strings): (Vec<u64>, Vec<String>) = m.unpack()?;
        assert_eq!(numbers, vec![5, 6, 7]);
        assert_eq!(strings, vec!["x".to_string()]);
        assert_eq!(basics.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn empty_unpack_reads_nothing() -> Result<()> {
        let mut m = sealed(&())?;
        m.unpack::<()>()?;
        assert_eq!(m.get_signature(), "");
        Ok(())
    }
}
