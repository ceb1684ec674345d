use std::borrow::Cow;

use crate::align::align;
use crate::error::{Errno, SdResult};
use crate::types::ContainerKind;
use crate::wire::basic::{BasicValue, Endian};
use crate::wire::reader::BodyReader;
use crate::wire::writer::BodyWriter;

pub(crate) const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;

const PROTOCOL_VERSION: u8 = 1;
const PRELUDE_LEN: usize = 16;
const MAX_MESSAGE_LEN: usize = 128 * 1024 * 1024;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    fn code(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    fn from_code(code: u8) -> Option<MessageType> {
        match code {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

/// The fixed header and header fields of one message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Header {
    pub(crate) msg_type: MessageType,
    pub(crate) flags: u8,
    pub(crate) serial: u32,
    pub(crate) path: Option<String>,
    pub(crate) interface: Option<String>,
    pub(crate) member: Option<String>,
    pub(crate) error_name: Option<String>,
    pub(crate) reply_serial: Option<u32>,
    pub(crate) destination: Option<String>,
    pub(crate) sender: Option<String>,
    pub(crate) signature: String,
    pub(crate) unix_fds: u32,
}

impl Header {
    pub(crate) fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            flags: 0,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: String::new(),
            unix_fds: 0,
        }
    }

    /// Checks the fields each message type requires are present.
    pub(crate) fn validate(&self) -> SdResult<()> {
        let ok = match self.msg_type {
            MessageType::MethodCall => self.path.is_some() && self.member.is_some(),
            MessageType::Signal => {
                self.path.is_some() && self.interface.is_some() && self.member.is_some()
            }
            MessageType::Error => self.error_name.is_some() && self.reply_serial.is_some(),
            MessageType::MethodReturn => self.reply_serial.is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(Errno::EBADMSG)
        }
    }

    fn write_field(w: &mut BodyWriter, code: u8, value: BasicValue<'_>) -> SdResult<()> {
        let mut sig = [0u8; 1];
        sig[0] = value.type_code();
        let sig = std::str::from_utf8(&sig).map_err(|_| Errno::EINVAL)?;
        w.open_container(ContainerKind::Struct, "yv")?;
        w.append_basic(&BasicValue::Byte(code))?;
        w.open_container(ContainerKind::Variant, sig)?;
        w.append_basic(&value)?;
        w.close_container()?;
        w.close_container()
    }

    /// Encodes the header, padded so the body starts 8-aligned.
    pub(crate) fn encode(&self, body_len: usize) -> SdResult<Vec<u8>> {
        let mut w = BodyWriter::new();
        w.append_basic(&BasicValue::Byte(b'l'))?;
        w.append_basic(&BasicValue::Byte(self.msg_type.code()))?;
        w.append_basic(&BasicValue::Byte(self.flags))?;
        w.append_basic(&BasicValue::Byte(PROTOCOL_VERSION))?;
        w.append_basic(&BasicValue::Uint32(body_len as u32))?;
        w.append_basic(&BasicValue::Uint32(self.serial))?;
        w.open_container(ContainerKind::Array, "(yv)")?;

        let strings = [
            (FIELD_INTERFACE, &self.interface),
            (FIELD_MEMBER, &self.member),
            (FIELD_ERROR_NAME, &self.error_name),
            (FIELD_DESTINATION, &self.destination),
            (FIELD_SENDER, &self.sender),
        ];
        if let Some(path) = &self.path {
            Self::write_field(&mut w, FIELD_PATH, BasicValue::ObjectPath(Cow::Borrowed(path)))?;
        }
        for (code, value) in strings {
            if let Some(value) = value {
                Self::write_field(&mut w, code, BasicValue::String(Cow::Borrowed(value)))?;
            }
        }
        if let Some(reply_serial) = self.reply_serial {
            Self::write_field(&mut w, FIELD_REPLY_SERIAL, BasicValue::Uint32(reply_serial))?;
        }
        if !self.signature.is_empty() {
            Self::write_field(
                &mut w,
                FIELD_SIGNATURE,
                BasicValue::Signature(Cow::Borrowed(&self.signature)),
            )?;
        }
        if self.unix_fds > 0 {
            Self::write_field(&mut w, FIELD_UNIX_FDS, BasicValue::Uint32(self.unix_fds))?;
        }

        w.close_container()?;
        w.pad(8);
        let (data, _) = w.complete()?;
        Ok(data)
    }

    /// Parses a complete message, returning the header, the body range and its byte order.
    pub(crate) fn parse(buf: &[u8]) -> SdResult<(Header, std::ops::Range<usize>, Endian)> {
        let total = frame_length(buf)?.ok_or(Errno::EBADMSG)?;
        if buf.len() < total {
            return Err(Errno::EBADMSG);
        }
        let endian = Endian::from_marker(buf[0]).ok_or(Errno::EBADMSG)?;
        let fields_len = endian.read_u32(&buf[12..16]) as usize;
        let header_len = align(PRELUDE_LEN + fields_len, 8);

        let mut r = BodyReader::new("yyyyuua(yv)", PRELUDE_LEN + fields_len, endian);
        let _ = byte(r.read_basic(buf, b'y')?)?;
        let msg_type = MessageType::from_code(byte(r.read_basic(buf, b'y')?)?)
            .ok_or(Errno::EBADMSG)?;
        let flags = byte(r.read_basic(buf, b'y')?)?;
        if byte(r.read_basic(buf, b'y')?)? != PROTOCOL_VERSION {
            return Err(Errno::EBADMSG);
        }
        let _body_len = uint32(r.read_basic(buf, b'u')?)?;
        let serial = uint32(r.read_basic(buf, b'u')?)?;
        if serial == 0 {
            return Err(Errno::EBADMSG);
        }

        let mut header = Header::new(msg_type);
        header.flags = flags;
        header.serial = serial;

        r.enter_container(buf, ContainerKind::Array, Some("(yv)"))?;
        while !r.at_end(false) {
            r.enter_container(buf, ContainerKind::Struct, Some("yv"))?;
            let code = byte(r.read_basic(buf, b'y')?)?;
            let (vcode, _) = r
                .peek_type(buf)?
                .and_then(|(c, contents)| contents.map(|s| (c, s)))
                .ok_or(Errno::EBADMSG)?;
            if vcode != b'v' {
                return Err(Errno::EBADMSG);
            }
            let expected = match code {
                FIELD_PATH => Some("o"),
                FIELD_INTERFACE | FIELD_MEMBER | FIELD_ERROR_NAME | FIELD_DESTINATION
                | FIELD_SENDER => Some("s"),
                FIELD_REPLY_SERIAL | FIELD_UNIX_FDS => Some("u"),
                FIELD_SIGNATURE => Some("g"),
                _ => None,
            };
            match expected {
                None => r.skip(buf, "v")?,
                Some(sig) => {
                    r.enter_container(buf, ContainerKind::Variant, Some(sig))?;
                    let value = r.read_basic(buf, sig.as_bytes()[0])?;
                    r.exit_container()?;
                    match (code, value) {
                        (FIELD_PATH, BasicValue::ObjectPath(v)) => header.path = Some(v.into_owned()),
                        (FIELD_INTERFACE, BasicValue::String(v)) => {
                            header.interface = Some(v.into_owned())
                        }
                        (FIELD_MEMBER, BasicValue::String(v)) => header.member = Some(v.into_owned()),
                        (FIELD_ERROR_NAME, BasicValue::String(v)) => {
                            header.error_name = Some(v.into_owned())
                        }
                        (FIELD_DESTINATION, BasicValue::String(v)) => {
                            header.destination = Some(v.into_owned())
                        }
                        (FIELD_SENDER, BasicValue::String(v)) => header.sender = Some(v.into_owned()),
                        (FIELD_REPLY_SERIAL, BasicValue::Uint32(v)) => header.reply_serial = Some(v),
                        (FIELD_UNIX_FDS, BasicValue::Uint32(v)) => header.unix_fds = v,
                        (FIELD_SIGNATURE, BasicValue::Signature(v)) => {
                            header.signature = v.into_owned()
                        }
                        _ => return Err(Errno::EBADMSG),
                    }
                }
            }
            r.exit_container()?;
        }
        r.exit_container()?;
        header.validate()?;

        Ok((header, header_len..total, endian))
    }
}

fn byte(value: BasicValue<'_>) -> SdResult<u8> {
    match value {
        BasicValue::Byte(v) => Ok(v),
        _ => Err(Errno::EBADMSG),
    }
}

fn uint32(value: BasicValue<'_>) -> SdResult<u32> {
    match value {
        BasicValue::Uint32(v) => Ok(v),
        _ => Err(Errno::EBADMSG),
    }
}

/// Total length of the message starting at `buf`, once its fixed prelude is available.
pub(crate) fn frame_length(buf: &[u8]) -> SdResult<Option<usize>> {
    if buf.len() < PRELUDE_LEN {
        return Ok(None);
    }
    let endian = Endian::from_marker(buf[0]).ok_or(Errno::EBADMSG)?;
    let body_len = endian.read_u32(&buf[4..8]) as usize;
    let fields_len = endian.read_u32(&buf[12..16]) as usize;
    let total = align(PRELUDE_LEN + fields_len, 8) + body_len;
    if total > MAX_MESSAGE_LEN {
        return Err(Errno::EBADMSG);
    }
    Ok(Some(total))
}
