//! The marshaler.
//!
//! Each type writes itself through a [`MessageWriter`]: basic values with
//! one `append_basic`, containers as an open/close frame around their
//! elements. Sequences of fixed-width numbers take the bulk
//! `append_array` path instead of one call per element.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use super::MessageWriter;
use crate::error::Result;
use crate::types::{signature, ContainerKind, DbusType, DictEntry, ObjectPath, Signature, UnixFd};
use crate::wire::basic::FixedPrimitive;
use crate::wire::BasicValue;

pub trait Append: DbusType {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()>;

    /// Appends `items` as one array.
    fn append_slice(items: &[Self], w: &mut MessageWriter<'_>) -> Result<()>
    where
        Self: Sized,
    {
        append_sequence(items, w)
    }
}

fn append_sequence<'i, T, I>(items: I, w: &mut MessageWriter<'_>) -> Result<()>
where
    T: Append + 'i,
    I: IntoIterator<Item = &'i T>,
{
    w.open_container(ContainerKind::Array, &signature::<T>())?;
    for item in items {
        item.append_to(w)?;
    }
    w.close_container()
}

fn append_bulk<T: FixedPrimitive>(items: &[T], w: &mut MessageWriter<'_>) -> Result<()> {
    let mut bytes = Vec::with_capacity(items.len() * T::SIZE);
    for item in items {
        item.write_le(&mut bytes);
    }
    w.append_array(T::CODE, &bytes)
}

macro_rules! append_fixed {
    ($($type:ty),+) => {
        $(
            impl Append for $type {
                fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
                    w.append_basic(&(*self).into_basic())
                }

                fn append_slice(items: &[Self], w: &mut MessageWriter<'_>) -> Result<()> {
                    append_bulk(items, w)
                }
            }
        )+
    };
}

append_fixed!(u8, i16, u16, i32, u32, i64, u64, f64);

impl Append for bool {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        w.append_basic(&BasicValue::Boolean(*self))
    }
}

impl Append for str {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        w.append_basic(&BasicValue::String(self.into()))
    }
}

impl Append for String {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        self.as_str().append_to(w)
    }
}

impl Append for ObjectPath {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        w.append_basic(&BasicValue::ObjectPath(self.as_str().into()))
    }
}

impl Append for Signature {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        w.append_basic(&BasicValue::Signature(self.as_str().into()))
    }
}

impl Append for UnixFd {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        w.append_basic(&BasicValue::UnixFd(self.0))
    }
}

impl<T: Append + ?Sized> Append for &T {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        (**self).append_to(w)
    }
}

impl<T: Append> Append for [T] {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        T::append_slice(self, w)
    }
}

impl<T: Append, const N: usize> Append for [T; N] {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        T::append_slice(self, w)
    }
}

impl<T: Append> Append for Vec<T> {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        T::append_slice(self, w)
    }
}

impl<T: Append> Append for VecDeque<T> {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        match self.as_slices() {
            (front, []) => T::append_slice(front, w),
            _ => append_sequence(self, w),
        }
    }
}

impl<T: Append> Append for BTreeSet<T> {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        append_sequence(self, w)
    }
}

impl<T: Append> Append for HashSet<T> {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        append_sequence(self, w)
    }
}

fn append_entry<K: Append, V: Append>(key: &K, value: &V, w: &mut MessageWriter<'_>) -> Result<()> {
    let contents = format!("{}{}", signature::<K>(), signature::<V>());
    w.open_container(ContainerKind::DictEntry, &contents)?;
    key.append_to(w)?;
    value.append_to(w)?;
    w.close_container()
}

fn append_map<'i, K, V, I>(entries: I, w: &mut MessageWriter<'_>) -> Result<()>
where
    K: Append + 'i,
    V: Append + 'i,
    I: IntoIterator<Item = (&'i K, &'i V)>,
{
    w.open_container(ContainerKind::Array, &signature::<DictEntry<K, V>>())?;
    for (key, value) in entries {
        append_entry(key, value, w)?;
    }
    w.close_container()
}

impl<K: Append, V: Append> Append for DictEntry<K, V> {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        append_entry(&self.0, &self.1, w)
    }
}

impl<K: Append, V: Append> Append for BTreeMap<K, V> {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        append_map(self, w)
    }
}

impl<K: Append, V: Append, S> Append for HashMap<K, V, S> {
    fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        append_map(self, w)
    }
}

/// A list of top-level arguments.
pub trait AppendArgs {
    fn append_args(&self, w: &mut MessageWriter<'_>) -> Result<()>;
}

impl AppendArgs for () {
    fn append_args(&self, _w: &mut MessageWriter<'_>) -> Result<()> {
        Ok(())
    }
}

macro_rules! append_tuple {
    ($($name:ident)+) => {
        impl<$($name: Append),+> Append for ($($name,)+) {
            #[allow(non_snake_case)]
            fn append_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
                let contents = [$(signature::<$name>()),+].concat();
                w.open_container(ContainerKind::Struct, &contents)?;
                let ($($name,)+) = self;
                $($name.append_to(w)?;)+
                w.close_container()
            }
        }

        impl<$($name: Append),+> AppendArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn append_args(&self, w: &mut MessageWriter<'_>) -> Result<()> {
                let ($($name,)+) = self;
                $($name.append_to(w)?;)+
                Ok(())
            }
        }
    };
}

append_tuple!(A);
append_tuple!(A B);
append_tuple!(A B C);
append_tuple!(A B C D);
append_tuple!(A B C D E);
append_tuple!(A B C D E F);
append_tuple!(A B C D E F G);
append_tuple!(A B C D E F G H);
append_tuple!(A B C D E F G H I);
append_tuple!(A B C D E F G H I J);
append_tuple!(A B C D E F G H I J K);
append_tuple!(A B C D E F G H I J K L);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::message::Message;
    use crate::sdbus::{SdBusImpl, SdBusInterface};
    use crate::test::{delegate_messages, SdBusMock};
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use test_log::test;

    fn signal(mock: SdBusMock) -> Result<Message> {
        Message::new_signal(Arc::new(mock), "/xyz/openbmc_project/test", "a.b", "C")
    }

    #[test]
    fn tuple_opens_one_struct_frame() -> Result<()> {
        let engine = Arc::new(SdBusImpl::new());
        let mut mock = SdBusMock::new();
        let mut seq = Sequence::new();
        let e = engine.clone();
        mock.expect_message_open_container()
            .withf(|_, kind, contents| *kind == ContainerKind::Struct && contents == "isb")
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |m, kind, contents| e.message_open_container(m, kind, contents));
        for code in [b'i', b's', b'b'] {
            let e = engine.clone();
            mock.expect_message_append_basic()
                .withf(move |_, value| value.type_code() == code)
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |m, value| e.message_append_basic(m, value));
        }
        let e = engine.clone();
        mock.expect_message_close_container()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |m| e.message_close_container(m));
        delegate_messages(&mut mock);

        let mut m = signal(mock)?;
        m.append(&(3i32, "hi", false))?;
        assert_eq!(m.get_signature(), "(isb)");
        Ok(())
    }

    #[test]
    fn numeric_sequences_use_bulk_append() -> Result<()> {
        let engine = Arc::new(SdBusImpl::new());
        let arrays = Arc::new(AtomicUsize::new(0));
        let basics = Arc::new(AtomicUsize::new(0));
        let mut mock = SdBusMock::new();
        let (e, n) = (engine.clone(), arrays.clone());
        mock.expect_message_append_array().returning(move |m, code, bytes| {
            n.fetch_add(1, Ordering::SeqCst);
            e.message_append_array(m, code, bytes)
        });
        let (e, n) = (engine.clone(), basics.clone());
        mock.expect_message_append_basic().returning(move |m, value| {
            n.fetch_add(1, Ordering::SeqCst);
            e.message_append_basic(m, value)
        });
        delegate_messages(&mut mock);

        let mut m = signal(mock)?;
        m.append(&vec![1u32, 2, 3])?;
        m.append(&[true, false][..])?;
        assert_eq!(m.get_signature(), "auab");
        assert_eq!(arrays.load(Ordering::SeqCst), 1);
        assert_eq!(basics.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn nested_frames_balance() -> Result<()> {
        let engine = Arc::new(SdBusImpl::new());
        let depth = Arc::new(AtomicUsize::new(0));
        let opened = Arc::new(AtomicUsize::new(0));
        let mut mock = SdBusMock::new();
        let (e, d, o) = (engine.clone(), depth.clone(), opened.clone());
        mock.expect_message_open_container().returning(move |m, kind, contents| {
            d.fetch_add(1, Ordering::SeqCst);
            o.fetch_add(1, Ordering::SeqCst);
            e.message_open_container(m, kind, contents)
        });
        let (e, d) = (engine.clone(), depth.clone());
        mock.expect_message_close_container().returning(move |m| {
            d.fetch_sub(1, Ordering::SeqCst);
            e.message_close_container(m)
        });
        delegate_messages(&mut mock);

        let mut m = signal(mock)?;
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), vec![(1u8, "x".to_string())]);
        map.insert("b".to_string(), vec![]);
        m.append(&map)?;
        m.append_args(&(1u16, ObjectPath::new("/a")?))?;
        assert_eq!(m.get_signature(), "a{sa(ys)}qo");
        assert_eq!(depth.load(Ordering::SeqCst), 0);
        assert!(opened.load(Ordering::SeqCst) >= 5);
        Ok(())
    }

    #[test]
    fn append_failures_name_the_primitive() -> Result<()> {
        let mut mock = SdBusMock::new();
        delegate_messages(&mut mock);
        let mut m = signal(mock)?;
        m.seal(1)?;
        assert!(matches!(
            m.append(&vec!["x"]),
            Err(Error::SdBus {
                primitive: "message_open_container",
                ..
            })
        ));
        Ok(())
    }
}
