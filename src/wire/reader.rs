use std::str::from_utf8;

use log::{error, trace};

use crate::align::align;
use crate::error::{Errno, SdResult};
use crate::types::{ContainerKind, ObjectPath, Type};
use crate::wire::basic::{BasicValue, Endian};

const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
struct ReadFrame {
    // `None` for the message body itself.
    kind: Option<ContainerKind>,
    signature: Vec<u8>,
    index: usize,
    begin: usize,
    end: usize,
}

impl ReadFrame {
    fn at_end(&self, pos: usize) -> bool {
        match self.kind {
            Some(ContainerKind::Array) => pos >= self.end,
            _ => self.index >= self.signature.len(),
        }
    }
}

/// Length of the first complete type in `sig`.
pub(crate) fn single_type_len(sig: &[u8]) -> Option<usize> {
    let mut nesting = 0i32;
    for (i, c) in sig.iter().enumerate() {
        match c {
            b'(' | b'{' => {
                nesting += 1;
            }
            b')' | b'}' => {
                nesting -= 1;
            }
            b'a' => continue,
            _ => (),
        }

        if nesting == 0 {
            return Some(i + 1);
        }
    }
    None
}

fn sig_alignment(code: u8) -> usize {
    match code {
        b'a' => 4,
        b'(' | b'{' => 8,
        b'v' => 1,
        c => Type::from_basic_code(c).map_or(1, |t| t.alignment()),
    }
}

fn to_str(sig: &[u8]) -> SdResult<&str> {
    from_utf8(sig).map_err(|_| Errno::EBADMSG)
}

/// Cursor over a sealed message body. The body bytes are passed to every call
/// so the cursor can live next to the buffer it walks.
#[derive(Debug, Clone)]
pub(crate) struct BodyReader {
    frames: Vec<ReadFrame>,
    pos: usize,
    endian: Endian,
}

impl BodyReader {
    pub(crate) fn new(signature: &str, len: usize, endian: Endian) -> Self {
        Self {
            frames: vec![ReadFrame {
                kind: None,
                signature: signature.as_bytes().to_vec(),
                index: 0,
                begin: 0,
                end: len,
            }],
            pos: 0,
            endian,
        }
    }

    fn frame(&self) -> &ReadFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut ReadFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn next_type(&self) -> SdResult<Option<Vec<u8>>> {
        let frame = self.frame();
        if frame.at_end(self.pos) {
            return Ok(None);
        }
        let rest = &frame.signature[frame.index..];
        let len = single_type_len(rest).ok_or(Errno::EBADMSG)?;
        Ok(Some(rest[..len].to_vec()))
    }

    fn advance(&mut self, len: usize) {
        let frame = self.frame_mut();
        frame.index += len;
        if frame.kind == Some(ContainerKind::Array) && frame.index >= frame.signature.len() {
            frame.index = 0;
        }
    }

    fn align_reader(&mut self, alignment: usize) -> SdResult<()> {
        let aligned = align(self.pos, alignment);
        if aligned > self.frame().end {
            error!("Index out of bounds");
            return Err(Errno::EBADMSG);
        }
        self.pos = aligned;
        Ok(())
    }

    fn read<'d>(&mut self, data: &'d [u8], len: usize) -> SdResult<&'d [u8]> {
        let old_ix = self.pos;
        let new_ix = old_ix + len;
        if new_ix > self.frame().end || new_ix > data.len() {
            error!("Index out of bounds");
            return Err(Errno::EBADMSG);
        }
        self.pos = new_ix;
        Ok(&data[old_ix..new_ix])
    }

    fn peek_signature(&self, data: &[u8]) -> SdResult<String> {
        let len = *data.get(self.pos).ok_or(Errno::EBADMSG)? as usize;
        let sig = data
            .get(self.pos + 1..self.pos + 2 + len)
            .ok_or(Errno::EBADMSG)?;
        if sig[len] != 0 {
            return Err(Errno::EBADMSG);
        }
        Ok(to_str(&sig[..len])?.to_string())
    }

    /// Next type code and, for containers, their contents signature.
    pub(crate) fn peek_type(&self, data: &[u8]) -> SdResult<Option<(u8, Option<String>)>> {
        let t = match self.next_type()? {
            Some(t) => t,
            None => return Ok(None),
        };
        Ok(Some(match t[0] {
            b'a' => (b'a', Some(to_str(&t[1..])?.to_string())),
            b'(' => (b'r', Some(to_str(&t[1..t.len() - 1])?.to_string())),
            b'{' => (b'e', Some(to_str(&t[1..t.len() - 1])?.to_string())),
            b'v' => (b'v', Some(self.peek_signature(data)?)),
            code => (code, None),
        }))
    }

    pub(crate) fn verify_type(
        &self,
        data: &[u8],
        code: u8,
        contents: Option<&str>,
    ) -> SdResult<bool> {
        Ok(match self.peek_type(data)? {
            Some((c, found)) => {
                c == code
                    && match contents {
                        Some(expected) => found.as_deref() == Some(expected),
                        None => true,
                    }
            }
            None => false,
        })
    }

    pub(crate) fn at_end(&self, complete: bool) -> bool {
        if complete && self.frames.len() > 1 {
            return false;
        }
        self.frame().at_end(self.pos)
    }

    pub(crate) fn read_basic(&mut self, data: &[u8], code: u8) -> SdResult<BasicValue<'static>> {
        match self.next_type()? {
            Some(t) if t == [code] => (),
            _ => return Err(Errno::ENXIO),
        }
        let ty = Type::from_basic_code(code).ok_or(Errno::EINVAL)?;
        self.align_reader(ty.alignment())?;
        trace!("Read signature '{}' at {}", code as char, self.pos);
        let endian = self.endian;
        let value = match code {
            b'y' => BasicValue::Byte(self.read(data, 1)?[0]),
            b'b' => match endian.read_u32(self.read(data, 4)?) {
                0 => BasicValue::Boolean(false),
                1 => BasicValue::Boolean(true),
                _ => return Err(Errno::EBADMSG),
            },
            b'n' => BasicValue::Int16(endian.read_u16(self.read(data, 2)?) as i16),
            b'q' => BasicValue::Uint16(endian.read_u16(self.read(data, 2)?)),
            b'i' => BasicValue::Int32(endian.read_u32(self.read(data, 4)?) as i32),
            b'u' => BasicValue::Uint32(endian.read_u32(self.read(data, 4)?)),
            b'h' => BasicValue::UnixFd(endian.read_u32(self.read(data, 4)?) as i32),
            b'x' => BasicValue::Int64(endian.read_u64(self.read(data, 8)?) as i64),
            b't' => BasicValue::Uint64(endian.read_u64(self.read(data, 8)?)),
            b'd' => BasicValue::Double(f64::from_bits(endian.read_u64(self.read(data, 8)?))),
            b's' | b'o' => {
                let size = endian.read_u32(self.read(data, 4)?) as usize;
                let bytes = self.read(data, size + 1)?;
                if bytes[size] != 0 {
                    return Err(Errno::EBADMSG);
                }
                let s = to_str(&bytes[..size])?.to_string();
                trace!("string is {}", s);
                if code == b'o' {
                    if ObjectPath::new(s.as_str()).is_err() {
                        return Err(Errno::EBADMSG);
                    }
                    BasicValue::ObjectPath(s.into())
                } else {
                    BasicValue::String(s.into())
                }
            }
            b'g' => {
                let size = self.read(data, 1)?[0] as usize;
                let bytes = self.read(data, size + 1)?;
                if bytes[size] != 0 {
                    return Err(Errno::EBADMSG);
                }
                let s = to_str(&bytes[..size])?.to_string();
                if Type::parse(&s).is_err() {
                    return Err(Errno::EBADMSG);
                }
                BasicValue::Signature(s.into())
            }
            _ => return Err(Errno::EINVAL),
        };
        self.advance(1);
        Ok(value)
    }

    pub(crate) fn enter_container(
        &mut self,
        data: &[u8],
        kind: ContainerKind,
        contents: Option<&str>,
    ) -> SdResult<()> {
        let t = self.next_type()?.ok_or(Errno::ENXIO)?;
        let inner: Vec<u8> = match (kind, t[0]) {
            (ContainerKind::Array, b'a') => t[1..].to_vec(),
            (ContainerKind::Struct, b'(') => t[1..t.len() - 1].to_vec(),
            (ContainerKind::DictEntry, b'{') => {
                if self.frame().kind != Some(ContainerKind::Array) {
                    return Err(Errno::ENXIO);
                }
                t[1..t.len() - 1].to_vec()
            }
            (ContainerKind::Variant, b'v') => self.peek_signature(data)?.into_bytes(),
            _ => return Err(Errno::ENXIO),
        };
        if let Some(expected) = contents {
            if expected.as_bytes() != inner.as_slice() {
                return Err(Errno::ENXIO);
            }
        }

        let parent_end = self.frame().end;
        let (begin, end) = match kind {
            ContainerKind::Array => {
                self.align_reader(4)?;
                let len = self.endian.read_u32(self.read(data, 4)?) as usize;
                if len > MAX_ARRAY_LEN {
                    return Err(Errno::EBADMSG);
                }
                self.align_reader(sig_alignment(inner[0]))?;
                let end = self.pos + len;
                if end > parent_end {
                    return Err(Errno::EBADMSG);
                }
                (self.pos, end)
            }
            ContainerKind::Struct | ContainerKind::DictEntry => {
                self.align_reader(8)?;
                (self.pos, parent_end)
            }
            ContainerKind::Variant => {
                let sig_len = inner.len();
                self.read(data, sig_len + 2)?;
                if Type::parse_single(to_str(&inner)?).is_err() {
                    return Err(Errno::EBADMSG);
                }
                (self.pos, parent_end)
            }
        };

        trace!(
            "enter '{}' ({}) at {}",
            kind.code() as char,
            String::from_utf8_lossy(&inner),
            self.pos
        );
        self.advance(t.len());
        self.frames.push(ReadFrame {
            kind: Some(kind),
            signature: inner,
            index: 0,
            begin,
            end,
        });
        Ok(())
    }

    pub(crate) fn exit_container(&mut self) -> SdResult<()> {
        if self.frames.len() <= 1 {
            return Err(Errno::EINVAL);
        }
        let frame = self.frame();
        let done = match frame.kind {
            Some(ContainerKind::Array) => self.pos == frame.end,
            _ => frame.index >= frame.signature.len(),
        };
        if !done {
            return Err(Errno::EBUSY);
        }
        self.frames.pop();
        Ok(())
    }

    /// Skips over values of the given complete types.
    pub(crate) fn skip(&mut self, data: &[u8], types: &str) -> SdResult<()> {
        let mut sig = types.as_bytes();
        while !sig.is_empty() {
            let len = single_type_len(sig).ok_or(Errno::EINVAL)?;
            self.skip_one(data, &sig[..len])?;
            sig = &sig[len..];
        }
        Ok(())
    }

    fn skip_one(&mut self, data: &[u8], t: &[u8]) -> SdResult<()> {
        match t[0] {
            b'a' => {
                self.enter_container(data, ContainerKind::Array, Some(to_str(&t[1..])?))?;
                let end = self.frame().end;
                self.pos = end;
                self.exit_container()
            }
            b'(' | b'{' => {
                let kind = if t[0] == b'(' {
                    ContainerKind::Struct
                } else {
                    ContainerKind::DictEntry
                };
                let inner = to_str(&t[1..t.len() - 1])?;
                self.enter_container(data, kind, Some(inner))?;
                self.skip(data, inner)?;
                self.exit_container()
            }
            b'v' => {
                let inner = match self.peek_type(data)? {
                    Some((b'v', Some(inner))) => inner,
                    _ => return Err(Errno::ENXIO),
                };
                self.enter_container(data, ContainerKind::Variant, Some(&inner))?;
                self.skip(data, &inner)?;
                self.exit_container()
            }
            code => self.read_basic(data, code).map(|_| ()),
        }
    }

    /// Reads a packed array of fixed-width elements, returned as little-endian bytes.
    pub(crate) fn read_array(&mut self, data: &[u8], code: u8) -> SdResult<Vec<u8>> {
        let size = Type::from_basic_code(code)
            .and_then(|t| t.fixed_size())
            .ok_or(Errno::EINVAL)?;
        if code == b'h' {
            return Err(Errno::EINVAL);
        }
        let contents = [code];
        self.enter_container(data, ContainerKind::Array, Some(to_str(&contents)?))?;
        let end = self.frame().end;
        let mut bytes = data[self.pos..end].to_vec();
        if bytes.len() % size != 0 {
            return Err(Errno::EBADMSG);
        }
        self.endian.to_little(&mut bytes, size);
        self.pos = end;
        self.exit_container()?;
        Ok(bytes)
    }

    pub(crate) fn rewind(&mut self, complete: bool) {
        if complete {
            self.frames.truncate(1);
        }
        let frame = self.frame_mut();
        frame.index = 0;
        let begin = frame.begin;
        self.pos = begin;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::writer::BodyWriter;
    use std::borrow::Cow;
    use test_log::test;

    fn sample() -> SdResult<(Vec<u8>, String)> {
        let mut w = BodyWriter::new();
        w.append_basic(&BasicValue::Byte(7))?;
        w.open_container(ContainerKind::Array, "{sv}")?;
        w.open_container(ContainerKind::DictEntry, "sv")?;
        w.append_basic(&BasicValue::String(Cow::Borrowed("Key-1")))?;
        w.open_container(ContainerKind::Variant, "d")?;
        w.append_basic(&BasicValue::Double(1.5))?;
        w.close_container()?;
        w.close_container()?;
        w.close_container()?;
        w.append_basic(&BasicValue::Boolean(true))?;
        w.complete()
    }

    #[test]
    fn reads_nested_containers() -> SdResult<()> {
        let (data, signature) = sample()?;
        let mut r = BodyReader::new(&signature, data.len(), Endian::Little);
        assert_eq!(r.read_basic(&data, b'y')?, BasicValue::Byte(7));
        r.enter_container(&data, ContainerKind::Array, Some("{sv}"))?;
        assert!(!r.at_end(false));
        r.enter_container(&data, ContainerKind::DictEntry, Some("sv"))?;
        assert_eq!(
            r.read_basic(&data, b's')?,
            BasicValue::String("Key-1".to_string().into())
        );
        assert!(r.verify_type(&data, b'v', Some("d"))?);
        assert!(!r.verify_type(&data, b'v', Some("s"))?);
        r.enter_container(&data, ContainerKind::Variant, Some("d"))?;
        assert_eq!(r.read_basic(&data, b'd')?, BasicValue::Double(1.5));
        r.exit_container()?;
        r.exit_container()?;
        assert!(r.at_end(false));
        r.exit_container()?;
        assert_eq!(r.read_basic(&data, b'b')?, BasicValue::Boolean(true));
        assert!(r.at_end(true));
        Ok(())
    }

    #[test]
    fn skip_and_rewind() -> SdResult<()> {
        let (data, signature) = sample()?;
        let mut r = BodyReader::new(&signature, data.len(), Endian::Little);
        r.skip(&data, "ya{sv}")?;
        assert_eq!(r.read_basic(&data, b'b')?, BasicValue::Boolean(true));
        r.rewind(true);
        assert_eq!(r.peek_type(&data)?, Some((b'y', None)));
        assert_eq!(r.read_basic(&data, b'y')?, BasicValue::Byte(7));
        assert_eq!(
            r.peek_type(&data)?,
            Some((b'a', Some("{sv}".to_string())))
        );
        Ok(())
    }

    #[test]
    fn type_mismatch_is_enxio() -> SdResult<()> {
        let (data, signature) = sample()?;
        let mut r = BodyReader::new(&signature, data.len(), Endian::Little);
        assert_eq!(r.read_basic(&data, b'i'), Err(Errno::ENXIO));
        assert_eq!(
            r.enter_container(&data, ContainerKind::Struct, None),
            Err(Errno::ENXIO)
        );
        assert_eq!(r.exit_container(), Err(Errno::EINVAL));
        Ok(())
    }

    #[test]
    fn truncated_data_is_ebadmsg() -> SdResult<()> {
        let (data, signature) = sample()?;
        let short = &data[..10];
        let mut r = BodyReader::new(&signature, short.len(), Endian::Little);
        r.read_basic(short, b'y')?;
        assert_eq!(
            r.enter_container(short, ContainerKind::Array, None),
            Err(Errno::EBADMSG)
        );
        Ok(())
    }

    #[test]
    fn reads_big_endian() -> SdResult<()> {
        let data = vec![0, 0, 1, 2, 0, 0, 0, 8, 0, 0, 0, 1, 0, 0, 0, 2];
        let mut r = BodyReader::new("uau", data.len(), Endian::Big);
        assert_eq!(r.read_basic(&data, b'u')?, BasicValue::Uint32(258));
        let bytes = r.read_array(&data, b'u')?;
        assert_eq!(bytes, vec![1, 0, 0, 0, 2, 0, 0, 0]);
        assert!(r.at_end(true));
        Ok(())
    }
}
