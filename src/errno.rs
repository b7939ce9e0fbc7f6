//! POSIX errno as the lingua franca of operation failures.
//!
//! Every user-visible filesystem operation fails with an `Errno`; transport
//! and protocol failures are mapped to `EIO` before they reach a caller.

use std::fmt;
use std::io;

/// A POSIX errno value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(libc::c_int);

/// Result of a filesystem operation.
pub type OpResult<T> = Result<T, Errno>;

impl Errno {
    pub const EPERM: Errno = Errno(libc::EPERM);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EBUSY: Errno = Errno(libc::EBUSY);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    pub const ENODATA: Errno = Errno(libc::ENODATA);
    pub const ENOTCONN: Errno = Errno(libc::ENOTCONN);
    pub const ETIMEDOUT: Errno = Errno(libc::ETIMEDOUT);
    pub const ESTALE: Errno = Errno(libc::ESTALE);
    pub const ENOTSUP: Errno = Errno(libc::ENOTSUP);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    pub const ENAMETOOLONG: Errno = Errno(libc::ENAMETOOLONG);

    /// Wrap a raw errno value.
    pub fn from_raw(code: libc::c_int) -> Errno {
        Errno(code)
    }

    /// The raw errno value.
    pub fn code(self) -> libc::c_int {
        self.0
    }

    /// Map an I/O error onto an errno, defaulting to `EIO` for errors that
    /// carry no OS code (protocol decode failures and the like).
    pub fn from_io_error(err: &io::Error) -> Errno {
        match err.raw_os_error() {
            Some(code) => Errno(code),
            None => Errno::EIO,
        }
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Errno {
        Errno::from_io_error(&err)
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, io::Error::from_raw_os_error(self.0))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        io::Error::from_raw_os_error(self.0).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(Errno::from_io_error(&err), Errno::ENOENT);

        let err = io::Error::new(io::ErrorKind::InvalidData, "bad record");
        assert_eq!(Errno::from_io_error(&err), Errno::EIO);
    }
}
