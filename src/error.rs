//! Errno-carrying error type shared by the registry, syscall wrappers and
//! operation handlers.

use std::fmt;

/// A host errno, propagated verbatim through to the kernel transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(libc::c_int);

impl Error {
    pub fn from_errno(errno: libc::c_int) -> Self {
        Error(errno)
    }

    /// Wraps whatever `errno` is currently set to (the calling convention
    /// every raw libc wrapper in `sys` uses after a syscall returns -1).
    pub fn last_os_error() -> Self {
        Error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    pub fn errno(self) -> libc::c_int {
        self.0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
