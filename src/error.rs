use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Result of a raw bus primitive; failures carry the platform error number.
pub type SdResult<T> = std::result::Result<T, Errno>;

/// A positive platform error number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const EPERM: Errno = Errno(libc::EPERM);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const ENXIO: Errno = Errno(libc::ENXIO);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const EBUSY: Errno = Errno(libc::EBUSY);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EBADMSG: Errno = Errno(libc::EBADMSG);
    pub const EOPNOTSUPP: Errno = Errno(libc::EOPNOTSUPP);
    pub const ENOTCONN: Errno = Errno(libc::ENOTCONN);
    pub const ECONNRESET: Errno = Errno(libc::ECONNRESET);
    pub const ETIMEDOUT: Errno = Errno(libc::ETIMEDOUT);
    pub const EALREADY: Errno = Errno(libc::EALREADY);
    pub const ECANCELED: Errno = Errno(libc::ECANCELED);

    pub fn last_os_error() -> Errno {
        Errno::from(io::Error::last_os_error())
    }

    /// Symbolic name such as `EINVAL`, if known.
    pub fn name(self) -> Option<&'static str> {
        ERRNO_NAMES
            .iter()
            .find(|(errno, _)| *errno == self.0)
            .map(|(_, name)| *name)
    }

    pub fn from_name(name: &str) -> Option<Errno> {
        ERRNO_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(errno, _)| Errno(*errno))
    }
}

const ERRNO_NAMES: &[(i32, &str)] = &[
    (libc::EPERM, "EPERM"),
    (libc::ENOENT, "ENOENT"),
    (libc::ESRCH, "ESRCH"),
    (libc::EINTR, "EINTR"),
    (libc::EIO, "EIO"),
    (libc::ENXIO, "ENXIO"),
    (libc::E2BIG, "E2BIG"),
    (libc::EBADF, "EBADF"),
    (libc::EAGAIN, "EAGAIN"),
    (libc::ENOMEM, "ENOMEM"),
    (libc::EACCES, "EACCES"),
    (libc::EFAULT, "EFAULT"),
    (libc::EBUSY, "EBUSY"),
    (libc::EEXIST, "EEXIST"),
    (libc::ENODEV, "ENODEV"),
    (libc::ENOTDIR, "ENOTDIR"),
    (libc::EISDIR, "EISDIR"),
    (libc::EINVAL, "EINVAL"),
    (libc::ENOSPC, "ENOSPC"),
    (libc::EROFS, "EROFS"),
    (libc::EPIPE, "EPIPE"),
    (libc::ERANGE, "ERANGE"),
    (libc::ENOSYS, "ENOSYS"),
    (libc::EBADR, "EBADR"),
    (libc::ENONET, "ENONET"),
    (libc::EBADMSG, "EBADMSG"),
    (libc::EOPNOTSUPP, "EOPNOTSUPP"),
    (libc::EADDRINUSE, "EADDRINUSE"),
    (libc::EADDRNOTAVAIL, "EADDRNOTAVAIL"),
    (libc::ENOBUFS, "ENOBUFS"),
    (libc::ENOTCONN, "ENOTCONN"),
    (libc::ECONNRESET, "ECONNRESET"),
    (libc::ECONNREFUSED, "ECONNREFUSED"),
    (libc::ETIMEDOUT, "ETIMEDOUT"),
    (libc::EHOSTDOWN, "EHOSTDOWN"),
    (libc::EHOSTUNREACH, "EHOSTUNREACH"),
    (libc::EALREADY, "EALREADY"),
    (libc::ECANCELED, "ECANCELED"),
];

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Errno {}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("sd_bus_{primitive}: {errno}")]
    SdBus {
        primitive: &'static str,
        errno: Errno,
    },
    #[error("{name}: {message}")]
    Method {
        name: String,
        message: String,
        errno: Errno,
    },
    #[error("Invalid enum string")]
    InvalidEnumString,
    #[error(transparent)]
    UnpackProperty(#[from] UnpackPropertyError),
    #[error("Invalid object path: {0}")]
    InvalidObjectPath(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Operation stopped")]
    Stopped,
    #[error("Unhandled stop")]
    UnhandledStop,
    #[error("Context stopped")]
    ContextStopped,
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn sd_bus(primitive: &'static str, errno: Errno) -> Self {
        Error::SdBus { primitive, errno }
    }

    /// The underlying error number, for errors that carry one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::SdBus { errno, .. } | Error::Method { errno, .. } => Some(*errno),
            Error::Stopped | Error::UnhandledStop => Some(Errno::ECANCELED),
            _ => None,
        }
    }
}

impl From<BusError> for Error {
    fn from(err: BusError) -> Self {
        let errno = err.errno();
        Error::Method {
            name: err.name,
            message: err.message,
            errno,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnpackReason {
    MissingProperty,
    WrongType,
    AppearsMoreThanOnce,
}

impl fmt::Display for UnpackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnpackReason::MissingProperty => "Missing property",
            UnpackReason::WrongType => "Type not matched",
            UnpackReason::AppearsMoreThanOnce => "Property appears more than once",
        })
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{reason}: {property}")]
pub struct UnpackPropertyError {
    pub property: String,
    pub reason: UnpackReason,
}

impl UnpackPropertyError {
    pub fn new(property: impl Into<String>, reason: UnpackReason) -> Self {
        Self {
            property: property.into(),
            reason,
        }
    }
}

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";

const SYSTEM_ERROR_PREFIX: &str = "System.Error.";

// Name -> errno, in lookup order.
const BUS_ERROR_MAP: &[(&str, i32)] = &[
    (ERROR_FAILED, libc::EACCES),
    ("org.freedesktop.DBus.Error.NoMemory", libc::ENOMEM),
    ("org.freedesktop.DBus.Error.ServiceUnknown", libc::EHOSTUNREACH),
    ("org.freedesktop.DBus.Error.NameHasNoOwner", libc::ENXIO),
    (ERROR_NO_REPLY, libc::ETIMEDOUT),
    ("org.freedesktop.DBus.Error.IOError", libc::EIO),
    ("org.freedesktop.DBus.Error.BadAddress", libc::EADDRNOTAVAIL),
    ("org.freedesktop.DBus.Error.NotSupported", libc::EOPNOTSUPP),
    ("org.freedesktop.DBus.Error.LimitsExceeded", libc::ENOBUFS),
    ("org.freedesktop.DBus.Error.AccessDenied", libc::EACCES),
    ("org.freedesktop.DBus.Error.AuthFailed", libc::EACCES),
    ("org.freedesktop.DBus.Error.NoServer", libc::EHOSTDOWN),
    ("org.freedesktop.DBus.Error.Timeout", libc::ETIMEDOUT),
    ("org.freedesktop.DBus.Error.NoNetwork", libc::ENONET),
    ("org.freedesktop.DBus.Error.AddressInUse", libc::EADDRINUSE),
    ("org.freedesktop.DBus.Error.Disconnected", libc::ECONNRESET),
    ("org.freedesktop.DBus.Error.InvalidArgs", libc::EINVAL),
    ("org.freedesktop.DBus.Error.FileNotFound", libc::ENOENT),
    ("org.freedesktop.DBus.Error.FileExists", libc::EEXIST),
    (ERROR_UNKNOWN_METHOD, libc::EBADR),
    (ERROR_UNKNOWN_OBJECT, libc::EBADR),
    ("org.freedesktop.DBus.Error.UnknownInterface", libc::EBADR),
    ("org.freedesktop.DBus.Error.UnknownProperty", libc::EBADR),
    ("org.freedesktop.DBus.Error.PropertyReadOnly", libc::EROFS),
    ("org.freedesktop.DBus.Error.UnixProcessIdUnknown", libc::ESRCH),
    ("org.freedesktop.DBus.Error.InvalidSignature", libc::EINVAL),
    ("org.freedesktop.DBus.Error.InconsistentMessage", libc::EBADMSG),
    ("org.freedesktop.DBus.Error.MatchRuleNotFound", libc::ENOENT),
    ("org.freedesktop.DBus.Error.MatchRuleInvalid", libc::EINVAL),
];

/// A D-Bus error: a well-known error name plus a human readable message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusError {
    pub name: String,
    pub message: String,
}

impl BusError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Picks the conventional error name for `errno`.
    pub fn from_errno(errno: Errno, message: Option<&str>) -> Self {
        let name = match errno.0 {
            libc::ENOMEM => "org.freedesktop.DBus.Error.NoMemory".to_string(),
            libc::EPERM | libc::EACCES => "org.freedesktop.DBus.Error.AccessDenied".to_string(),
            libc::EINVAL => "org.freedesktop.DBus.Error.InvalidArgs".to_string(),
            libc::ESRCH => "org.freedesktop.DBus.Error.UnixProcessIdUnknown".to_string(),
            libc::ENOENT => "org.freedesktop.DBus.Error.FileNotFound".to_string(),
            libc::EEXIST => "org.freedesktop.DBus.Error.FileExists".to_string(),
            libc::ETIMEDOUT | libc::ETIME => "org.freedesktop.DBus.Error.Timeout".to_string(),
            libc::EIO => "org.freedesktop.DBus.Error.IOError".to_string(),
            libc::ENOTCONN | libc::ECONNRESET => {
                "org.freedesktop.DBus.Error.Disconnected".to_string()
            }
            libc::EOPNOTSUPP => "org.freedesktop.DBus.Error.NotSupported".to_string(),
            libc::EADDRNOTAVAIL => "org.freedesktop.DBus.Error.BadAddress".to_string(),
            libc::ENOBUFS => "org.freedesktop.DBus.Error.LimitsExceeded".to_string(),
            libc::EADDRINUSE => "org.freedesktop.DBus.Error.AddressInUse".to_string(),
            libc::EBADMSG => "org.freedesktop.DBus.Error.InconsistentMessage".to_string(),
            _ => match errno.name() {
                Some(name) => format!("{}{}", SYSTEM_ERROR_PREFIX, name),
                None => ERROR_FAILED.to_string(),
            },
        };
        let message = match message {
            Some(message) => message.to_string(),
            None => errno.to_string(),
        };
        Self { name, message }
    }

    /// The errno conventionally associated with this error name; `EIO` when unknown.
    pub fn errno(&self) -> Errno {
        if let Some(name) = self.name.strip_prefix(SYSTEM_ERROR_PREFIX) {
            if let Some(errno) = Errno::from_name(name) {
                return errno;
            }
        }
        BUS_ERROR_MAP
            .iter()
            .find(|(name, _)| *name == self.name)
            .map(|(_, errno)| Errno(*errno))
            .unwrap_or(Errno::EIO)
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for BusError {}
