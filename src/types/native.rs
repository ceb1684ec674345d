use std::fmt;
use std::ops::Deref;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{Error, Result};
use crate::types::Type;

/// One key/value pair of a D-Bus dictionary (`{kv}`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DictEntry<K, V>(pub K, pub V);

impl<K, V> From<(K, V)> for DictEntry<K, V> {
    fn from((k, v): (K, V)) -> Self {
        DictEntry(k, v)
    }
}

/// A borrowed unix file descriptor. The message duplicates it on append.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnixFd(pub RawFd);

impl Default for UnixFd {
    fn default() -> Self {
        UnixFd(-1)
    }
}

impl AsRawFd for UnixFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// A D-Bus type signature (`g`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
    pub fn new(signature: impl Into<String>) -> Result<Self> {
        let signature = signature.into();
        Type::parse(&signature)?;
        Ok(Signature(signature))
    }

    pub(crate) fn from_wire(signature: String) -> Self {
        Signature(signature)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated D-Bus object path (`o`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl Default for ObjectPath {
    fn default() -> Self {
        ObjectPath("/".to_string())
    }
}

fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    path[1..].split('/').all(|element| {
        !element.is_empty()
            && element
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !is_valid_path(&path) {
            return Err(Error::InvalidObjectPath(path));
        }
        Ok(ObjectPath(path))
    }

    pub(crate) fn from_wire(path: String) -> Self {
        ObjectPath(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The unescaped last element, or an empty string for the root and
    /// elements that do not decode.
    pub fn filename(&self) -> String {
        match self.0.rfind('/') {
            Some(ix) if ix + 1 < self.0.len() => unescape(&self.0[ix + 1..]).unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// The path with its last element removed; the root is its own parent.
    pub fn parent_path(&self) -> ObjectPath {
        match self.0.rfind('/') {
            Some(0) | None => ObjectPath("/".to_string()),
            Some(ix) => ObjectPath(self.0[..ix].to_string()),
        }
    }

    /// Appends `element`, escaping it into the object path alphabet.
    pub fn join(&self, element: &str) -> ObjectPath {
        let escaped = escape(element);
        if self.0 == "/" {
            ObjectPath(format!("/{}", escaped))
        } else {
            ObjectPath(format!("{}/{}", self.0, escaped))
        }
    }
}

impl Deref for ObjectPath {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(path: &str) -> Result<Self> {
        ObjectPath::new(path)
    }
}

fn escape(element: &str) -> String {
    if element.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(element.len());
    for (ix, b) in element.bytes().enumerate() {
        if b.is_ascii_alphabetic() || (ix > 0 && b.is_ascii_digit()) {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{:02x}", b));
        }
    }
    out
}

fn unescape(element: &str) -> Option<String> {
    if element == "_" {
        return Some(String::new());
    }
    let bytes = element.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut ix = 0;
    while ix < bytes.len() {
        if bytes[ix] == b'_' {
            let hex = element.get(ix + 1..ix + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            ix += 3;
        } else {
            out.push(bytes[ix]);
            ix += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn validates_paths() {
        assert!(ObjectPath::new("/").is_ok());
        assert!(ObjectPath::new("/xyz/openbmc_project/sensors").is_ok());
        for bad in ["", "xyz", "/xyz/", "//", "/a-b", "/a//b"] {
            assert_eq!(
                ObjectPath::new(bad),
                Err(Error::InvalidObjectPath(bad.to_string()))
            );
        }
    }

    #[test]
    fn path_helpers() -> Result<()> {
        let root = ObjectPath::new("/")?;
        let child = root.join("abc");
        assert_eq!(child.as_str(), "/abc");
        let escaped = child.join("foo-bar 1");
        assert_eq!(escaped.as_str(), "/abc/foo_2dbar_201");
        assert_eq!(escaped.filename(), "foo-bar 1");
        assert_eq!(escaped.parent_path(), child);
        assert_eq!(child.parent_path(), root);
        assert_eq!(root.filename(), "");
        assert_eq!(root.join("").filename(), "");
        assert_eq!(root.join("1st").as_str(), "/_31st");
        Ok(())
    }

    #[test]
    fn signature_validation() {
        assert!(Signature::new("a{sv}").is_ok());
        assert!(Signature::new("a{").is_err());
    }
}
