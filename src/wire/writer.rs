use log::trace;

use crate::align::pad_to;
use crate::error::{Errno, SdResult};
use crate::types::{ContainerKind, Type};
use crate::wire::basic::BasicValue;

const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug)]
struct WriteFrame {
    kind: ContainerKind,
    // Signature the frame's contents must follow, one complete type for
    // arrays and variants.
    contents: Vec<u8>,
    index: usize,
    // Arrays only: offset of the length word and of the first element.
    length_at: usize,
    begin: usize,
}

/// Builds a message body, checking every write against the signature of the
/// enclosing container frame.
///
/// Alignment is relative to the start of `data`; the header guarantees the
/// body begins on an 8 byte boundary.
#[derive(Debug, Default)]
pub(crate) struct BodyWriter {
    data: Vec<u8>,
    signature: Vec<u8>,
    frames: Vec<WriteFrame>,
}

impl BodyWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn signature(&self) -> &[u8] {
        &self.signature
    }

    // Consumes `sig` (one complete type) from the current frame.
    fn expect(&mut self, sig: &[u8]) -> SdResult<()> {
        match self.frames.last_mut() {
            None => {
                if self.signature.len() + sig.len() > 255 {
                    return Err(Errno::EINVAL);
                }
                self.signature.extend_from_slice(sig);
                Ok(())
            }
            Some(frame) => {
                let rest = &frame.contents[frame.index..];
                if !rest.starts_with(sig) {
                    trace!(
                        "type {:?} does not fit container contents {:?}",
                        String::from_utf8_lossy(sig),
                        String::from_utf8_lossy(rest)
                    );
                    return Err(Errno::ENXIO);
                }
                frame.index += sig.len();
                if frame.kind == ContainerKind::Array && frame.index == frame.contents.len() {
                    frame.index = 0;
                }
                Ok(())
            }
        }
    }

    pub(crate) fn append_basic(&mut self, value: &BasicValue<'_>) -> SdResult<()> {
        if !value.validate() {
            return Err(Errno::EINVAL);
        }
        let code = value.type_code();
        self.expect(&[code])?;
        let alignment = Type::from_basic_code(code).map_or(1, |t| t.alignment());
        pad_to(&mut self.data, alignment);
        trace!(
            "append '{}' at {}",
            code as char,
            self.data.len()
        );
        value.serialize(&mut self.data);
        Ok(())
    }

    /// Appends a packed array of fixed-width elements given as little-endian bytes.
    pub(crate) fn append_array(&mut self, code: u8, bytes: &[u8]) -> SdResult<()> {
        let elem = Type::from_basic_code(code).ok_or(Errno::EINVAL)?;
        let size = elem.fixed_size().ok_or(Errno::EINVAL)?;
        if code == b'h' || bytes.len() % size != 0 || bytes.len() > MAX_ARRAY_LEN {
            return Err(Errno::EINVAL);
        }
        self.expect(&[b'a', code])?;
        pad_to(&mut self.data, 4);
        self.data
            .extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        pad_to(&mut self.data, elem.alignment());
        trace!("append array of {} bytes at {}", bytes.len(), self.data.len());
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn open_container(&mut self, kind: ContainerKind, contents: &str) -> SdResult<()> {
        let mut element_alignment = 1;
        match kind {
            ContainerKind::Array => {
                // Dict entries are only complete types as array elements.
                match Type::parse_single(&format!("a{}", contents)) {
                    Ok(Type::Array(element)) => element_alignment = element.alignment(),
                    _ => return Err(Errno::EINVAL),
                }
            }
            ContainerKind::Variant => {
                Type::parse_single(contents).map_err(|_| Errno::EINVAL)?;
            }
            ContainerKind::Struct => {
                if Type::parse(contents).map_err(|_| Errno::EINVAL)?.is_empty() {
                    return Err(Errno::EINVAL);
                }
            }
            ContainerKind::DictEntry => {
                let types = Type::parse(contents).map_err(|_| Errno::EINVAL)?;
                if types.len() != 2 || !types[0].is_basic() {
                    return Err(Errno::EINVAL);
                }
                if self.frames.last().map(|f| f.kind) != Some(ContainerKind::Array) {
                    return Err(Errno::ENXIO);
                }
            }
        }

        self.expect(kind.wrap(contents).as_bytes())?;
        pad_to(&mut self.data, kind.alignment());

        let mut length_at = 0;
        let mut begin = 0;
        match kind {
            ContainerKind::Array => {
                length_at = self.data.len();
                self.data.extend_from_slice(&[0u8, 0u8, 0u8, 0u8]);
                pad_to(&mut self.data, element_alignment);
                begin = self.data.len();
            }
            ContainerKind::Variant => {
                BasicValue::Signature(contents.into()).serialize(&mut self.data);
            }
            ContainerKind::Struct | ContainerKind::DictEntry => (),
        }

        trace!("open '{}' ({}) at {}", kind.code() as char, contents, self.data.len());
        self.frames.push(WriteFrame {
            kind,
            contents: contents.as_bytes().to_vec(),
            index: 0,
            length_at,
            begin,
        });
        Ok(())
    }

    pub(crate) fn close_container(&mut self) -> SdResult<()> {
        let frame = self.frames.last().ok_or(Errno::EINVAL)?;
        let complete = match frame.kind {
            ContainerKind::Array => frame.index == 0,
            _ => frame.index == frame.contents.len(),
        };
        if !complete {
            return Err(Errno::ENXIO);
        }

        let frame = self.frames.pop().ok_or(Errno::EINVAL)?;
        if frame.kind == ContainerKind::Array {
            let length = self.data.len() - frame.begin;
            if length > MAX_ARRAY_LEN {
                return Err(Errno::EINVAL);
            }
            self.data[frame.length_at..frame.length_at + 4]
                .copy_from_slice(&(length as u32).to_le_bytes());
        }
        trace!("close '{}' at {}", frame.kind.code() as char, self.data.len());
        Ok(())
    }

    /// Finishes the body, returning its bytes and signature.
    pub(crate) fn complete(self) -> SdResult<(Vec<u8>, String)> {
        if !self.frames.is_empty() {
            return Err(Errno::EBUSY);
        }
        let signature = String::from_utf8(self.signature).map_err(|_| Errno::EINVAL)?;
        Ok((self.data, signature))
    }

    /// Zero-pads the written data to `alignment`.
    pub(crate) fn pad(&mut self, alignment: usize) {
        pad_to(&mut self.data, alignment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use test_log::test;

    #[test]
    fn struct_of_int_string_bool() -> SdResult<()> {
        let mut w = BodyWriter::new();
        w.open_container(ContainerKind::Struct, "isb")?;
        w.append_basic(&BasicValue::Int32(3))?;
        w.append_basic(&BasicValue::String(Cow::Borrowed("hi")))?;
        w.append_basic(&BasicValue::Boolean(false))?;
        w.close_container()?;
        let (data, signature) = w.complete()?;
        assert_eq!(signature, "(isb)");
        assert_eq!(
            data,
            vec![3, 0, 0, 0, 2, 0, 0, 0, b'h', b'i', 0, 0, 0, 0, 0, 0]
        );
        Ok(())
    }

    #[test]
    fn array_length_excludes_padding() -> SdResult<()> {
        let mut w = BodyWriter::new();
        w.append_basic(&BasicValue::Byte(1))?;
        w.open_container(ContainerKind::Array, "t")?;
        w.append_basic(&BasicValue::Uint64(5))?;
        w.close_container()?;
        let (data, signature) = w.complete()?;
        assert_eq!(signature, "yat");
        assert_eq!(
            data,
            vec![1, 0, 0, 0, 8, 0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0]
        );
        Ok(())
    }

    #[test]
    fn empty_array_still_pads() -> SdResult<()> {
        let mut w = BodyWriter::new();
        w.open_container(ContainerKind::Array, "(ii)")?;
        w.close_container()?;
        let (data, _) = w.complete()?;
        assert_eq!(data, vec![0, 0, 0, 0, 0, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn variant_writes_inner_signature() -> SdResult<()> {
        let mut w = BodyWriter::new();
        w.open_container(ContainerKind::Variant, "u")?;
        w.append_basic(&BasicValue::Uint32(9))?;
        w.close_container()?;
        let (data, signature) = w.complete()?;
        assert_eq!(signature, "v");
        assert_eq!(data, vec![1, b'u', 0, 0, 9, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn rejects_mismatched_types() -> SdResult<()> {
        let mut w = BodyWriter::new();
        w.open_container(ContainerKind::Array, "s")?;
        assert_eq!(w.append_basic(&BasicValue::Int32(1)), Err(Errno::ENXIO));
        w.close_container()?;
        assert_eq!(w.close_container(), Err(Errno::EINVAL));

        w.open_container(ContainerKind::Struct, "ii")?;
        w.append_basic(&BasicValue::Int32(1))?;
        assert_eq!(w.close_container(), Err(Errno::ENXIO));
        assert_eq!(
            w.open_container(ContainerKind::DictEntry, "sv"),
            Err(Errno::ENXIO)
        );
        Ok(())
    }

    #[test]
    fn dict_arrays_align_entries_to_eight() -> SdResult<()> {
        let mut w = BodyWriter::new();
        w.open_container(ContainerKind::Array, "{su}")?;
        w.open_container(ContainerKind::DictEntry, "su")?;
        w.append_basic(&BasicValue::String(Cow::Borrowed("a")))?;
        w.append_basic(&BasicValue::Uint32(5))?;
        w.close_container()?;
        w.close_container()?;
        let (data, signature) = w.complete()?;
        assert_eq!(signature, "a{su}");
        assert_eq!(
            data,
            vec![12, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, b'a', 0, 0, 0, 5, 0, 0, 0]
        );

        let mut w = BodyWriter::new();
        assert_eq!(w.open_container(ContainerKind::Array, "{vs}"), Err(Errno::EINVAL));
        assert_eq!(w.open_container(ContainerKind::Array, "{s}"), Err(Errno::EINVAL));
        assert_eq!(w.open_container(ContainerKind::Variant, "{su}"), Err(Errno::EINVAL));
        Ok(())
    }

    #[test]
    fn bulk_array_matches_element_writes() -> SdResult<()> {
        let mut bulk = BodyWriter::new();
        let bytes: Vec<u8> = [1u16, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        bulk.append_array(b'q', &bytes)?;

        let mut single = BodyWriter::new();
        single.open_container(ContainerKind::Array, "q")?;
        for v in [1u16, 2, 3] {
            single.append_basic(&BasicValue::Uint16(v))?;
        }
        single.close_container()?;

        assert_eq!(bulk.complete()?, single.complete()?);
        Ok(())
    }
}
