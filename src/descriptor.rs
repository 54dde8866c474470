//! Classification of the integer descriptor space into native, epoll and
//! accelerated-socket ranges (component C1).
//!
//! A descriptor is a plain signed integer. Which backend a call routes to is
//! decided purely by comparing it against two process-wide thresholds; there
//! is no tagging, no side table. The thresholds themselves come from the
//! original C prototype's offsets (`1 << 16` and `+ 1024`), reused as-is to
//! keep descriptor values stable for anyone inspecting raw fd numbers while
//! debugging.

/// First descriptor value reserved for epoll instances.
pub const EPOLL_BASE: i32 = 1 << 16;

/// First descriptor value reserved for accelerated sockets.
pub const SOCKET_BASE: i32 = EPOLL_BASE + 1024;

/// Which backend a descriptor routes to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Classified {
    /// Passed straight through to the host kernel.
    Native(i32),
    /// Index into the epoll slot table.
    Epoll(usize),
    /// Index into the socket slot table.
    Socket(usize),
}

/// Classifies `d` using the process-wide [`EPOLL_BASE`]/[`SOCKET_BASE`] thresholds.
///
/// A negative descriptor is always [`Classified::Native`] so host-kernel
/// errno propagation (e.g. a `-1` sentinel) round-trips untouched.
pub fn classify(d: i32) -> Classified {
    classify_with(d, EPOLL_BASE, SOCKET_BASE)
}

/// Classifies `d` against caller-supplied thresholds.
///
/// Exists so tests (and embedders sharing a process with a test harness that
/// itself opens many low-numbered fds) can pick bases that don't collide
/// with anything already open, without the production [`classify`] having
/// to consult mutable global state on every call.
pub fn classify_with(d: i32, epoll_base: i32, socket_base: i32) -> Classified {
    if d < epoll_base {
        Classified::Native(d)
    } else if d < socket_base {
        Classified::Epoll((d - epoll_base) as usize)
    } else {
        Classified::Socket((d - socket_base) as usize)
    }
}

/// Composes an epoll descriptor from a slot index, inverse of [`classify`].
pub fn make_epoll(slot: usize) -> i32 {
    make_epoll_with(slot, EPOLL_BASE)
}

pub fn make_epoll_with(slot: usize, epoll_base: i32) -> i32 {
    epoll_base + slot as i32
}

/// Composes an accelerated-socket descriptor from a slot index, inverse of [`classify`].
pub fn make_socket(slot: usize) -> i32 {
    make_socket_with(slot, SOCKET_BASE)
}

pub fn make_socket_with(slot: usize, socket_base: i32) -> i32 {
    socket_base + slot as i32
}
