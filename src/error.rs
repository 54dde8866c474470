use std::{fmt, io};

/// Errno-aligned outcome of a shim call.
///
/// Mirrors the POSIX error kinds the adaptation engine is contractually
/// allowed to surface (see the error handling section of the design doc).
/// Invariant violations are not represented here: they panic instead of
/// being returned, since the caller cannot soundly continue past corrupted
/// adapter state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShimError {
    /// Descriptor resolves to a slot that has already been freed.
    BadFd,
    /// Unsupported event bit, or unsupported address family.
    Invalid,
    /// `epoll_ctl(ADD)` on an already-registered key.
    Exists,
    /// `epoll_ctl(MOD)`/`epoll_ctl(DEL)` on an unknown key.
    NotFound,
    /// Standard readiness "not now" signal.
    WouldBlock,
    /// `pwait` observed no events before its deadline.
    TimedOut,
    /// Recognized but unimplemented surface (`connect`, `sendmsg`, non-IPv4/TCP, ...).
    NotSupported,
}

impl ShimError {
    /// The POSIX errno this error kind corresponds to.
    pub fn errno(self) -> libc::c_int {
        match self {
            ShimError::BadFd => libc::EBADF,
            ShimError::Invalid => libc::EINVAL,
            ShimError::Exists => libc::EEXIST,
            ShimError::NotFound => libc::ENOENT,
            ShimError::WouldBlock => libc::EWOULDBLOCK,
            ShimError::TimedOut => libc::ETIMEDOUT,
            ShimError::NotSupported => libc::ENOTSUP,
        }
    }
}

impl fmt::Display for ShimError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ShimError::BadFd => "descriptor refers to a freed slot",
            ShimError::Invalid => "invalid argument",
            ShimError::Exists => "key already registered",
            ShimError::NotFound => "key not found",
            ShimError::WouldBlock => "operation would block",
            ShimError::TimedOut => "timed out",
            ShimError::NotSupported => "not supported",
        };
        write!(fmt, "{}", msg)
    }
}

impl std::error::Error for ShimError {}

impl From<ShimError> for io::Error {
    fn from(err: ShimError) -> io::Error {
        io::Error::from_raw_os_error(err.errno())
    }
}

pub type Result<T> = std::result::Result<T, ShimError>;

thread_local! {
    static LAST_ERROR: std::cell::Cell<libc::c_int> = const { std::cell::Cell::new(0) };
}

/// Stashes `err` for the current thread, matching the `-1`-and-`errno`
/// contract the `extern "C"` surface presents to callers.
pub(crate) fn set_errno_and_fail<T>(err: ShimError) -> Result<T> {
    LAST_ERROR.with(|cell| cell.set(err.errno()));
    Err(err)
}

/// Returns the last errno value stashed by a failing shim call on this thread.
pub fn last_errno() -> libc::c_int {
    LAST_ERROR.with(|cell| cell.get())
}
