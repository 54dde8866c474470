//! Thin `extern "C"` adapters over [`crate::shim::Shim`] for callers that
//! need the literal POSIX ABI rather than the safe Rust surface.
//!
//! Every wrapper here does the same three things: classify/convert its raw
//! arguments, call the corresponding [`Shim`] method against one
//! process-global instance, and fold the `Result` back into the C
//! `-1`-and-`errno` contract via [`crate::error::set_errno_and_fail`]. The
//! global instance is fixed to [`LoopbackTransport`] — a real kernel-bypass
//! binding would build its own `extern "C"` layer against its own transport
//! type rather than reusing this one, the same way the safe `Shim<T>` API is
//! generic but this ABI shim can only name one concrete `T`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::raw::{c_int, c_void};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use libc::{sockaddr, socklen_t, ssize_t};

use crate::error::{last_errno as error_last_errno, set_errno_and_fail, ShimError};
use crate::interest::Interest;
use crate::shim::{InitArgs, Shim};
use crate::token::UserData;
use crate::transport::LoopbackTransport;

const EPOLL_CTL_ADD: c_int = 1;
const EPOLL_CTL_DEL: c_int = 2;
const EPOLL_CTL_MOD: c_int = 3;

/// Matches the layout `epoll_event` callers already pass to real
/// `epoll_ctl`/`epoll_wait`: a 32-bit event mask followed by the opaque
/// 64-bit payload. `#[repr(C)]` so it has the same layout regardless of
/// host padding assumptions.
#[repr(C)]
pub struct ShimEpollEvent {
    pub events: u32,
    pub data: u64,
}

fn global_shim() -> &'static Mutex<Shim<LoopbackTransport>> {
    static SHIM: OnceLock<Mutex<Shim<LoopbackTransport>>> = OnceLock::new();
    SHIM.get_or_init(|| Mutex::new(Shim::new(LoopbackTransport::new(), InitArgs::default())))
}

fn fail_int(err: ShimError) -> c_int {
    let _ = set_errno_and_fail::<()>(err);
    -1
}

fn fail_ssize(err: ShimError) -> ssize_t {
    let _ = set_errno_and_fail::<()>(err);
    -1
}

fn sockaddr_to_v4(addr: *const sockaddr, len: socklen_t) -> Option<SocketAddrV4> {
    if addr.is_null() || (len as usize) < std::mem::size_of::<libc::sockaddr_in>() {
        return None;
    }
    // SAFETY: caller guarantees `addr` points to at least `len` readable
    // bytes; the size check above ensures a `sockaddr_in` fits.
    let sin = unsafe { &*(addr as *const libc::sockaddr_in) };
    if sin.sin_family as c_int != libc::AF_INET {
        return None;
    }
    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
    let port = u16::from_be(sin.sin_port);
    Some(SocketAddrV4::new(ip, port))
}

/// # Safety
/// `addr` must point to at least `size_of::<sockaddr_in>()` writable bytes.
unsafe fn v4_to_sockaddr(v4: SocketAddrV4, addr: *mut sockaddr, len: *mut socklen_t) {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: v4.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*v4.ip()).to_be(),
        },
        sin_zero: [0; 8],
    };
    std::ptr::write(addr as *mut libc::sockaddr_in, sin);
    if !len.is_null() {
        *len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
    }
}

fn interest_from_mask(mask: u32) -> Option<Interest> {
    if mask & !(libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) != 0 {
        return None;
    }
    let mut interest = Interest::empty();
    if mask & libc::EPOLLIN as u32 != 0 {
        interest = interest | Interest::readable();
    }
    if mask & libc::EPOLLOUT as u32 != 0 {
        interest = interest | Interest::writable();
    }
    Some(interest)
}

fn mask_from_interest(interest: Interest) -> u32 {
    let mut mask = 0u32;
    if interest.is_readable() {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

/// `domain`/`ty`/`proto` are accepted for ABI compatibility but otherwise
/// ignored: this surface only ever constructs IPv4/TCP sockets.
#[no_mangle]
pub extern "C" fn shim_socket(_domain: c_int, _ty: c_int, _proto: c_int) -> c_int {
    let mut shim = global_shim().lock().unwrap();
    match shim.socket() {
        Ok(fd) => fd,
        Err(e) => fail_int(e),
    }
}

/// # Safety
/// `addr` must point to at least `len` readable bytes if non-null.
#[no_mangle]
pub unsafe extern "C" fn shim_bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let Some(v4) = sockaddr_to_v4(addr, len) else {
        return fail_int(ShimError::Invalid);
    };
    let mut shim = global_shim().lock().unwrap();
    match shim.bind(fd, v4) {
        Ok(()) => 0,
        Err(e) => fail_int(e),
    }
}

#[no_mangle]
pub extern "C" fn shim_listen(fd: c_int, backlog: c_int) -> c_int {
    let mut shim = global_shim().lock().unwrap();
    match shim.listen(fd, backlog) {
        Ok(()) => 0,
        Err(e) => fail_int(e),
    }
}

/// # Safety
/// `addr`/`len` follow the usual `accept(2)` out-parameter contract; passing
/// null for both is always safe and simply skips filling in the peer address.
#[no_mangle]
pub unsafe extern "C" fn shim_accept(fd: c_int, _addr: *mut sockaddr, _len: *mut socklen_t) -> c_int {
    let mut shim = global_shim().lock().unwrap();
    match shim.accept(fd) {
        Ok(conn) => conn,
        Err(e) => fail_int(e),
    }
}

#[no_mangle]
pub extern "C" fn shim_close(fd: c_int) -> c_int {
    let mut shim = global_shim().lock().unwrap();
    match shim.close(fd) {
        Ok(()) => 0,
        Err(e) => fail_int(e),
    }
}

/// # Safety
/// `buf` must point to at least `count` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn shim_read(fd: c_int, buf: *mut c_void, count: usize) -> ssize_t {
    if buf.is_null() {
        return fail_ssize(ShimError::Invalid);
    }
    let slice = std::slice::from_raw_parts_mut(buf as *mut u8, count);
    let mut shim = global_shim().lock().unwrap();
    match shim.read(fd, slice) {
        Ok(n) => n as ssize_t,
        Err(e) => fail_ssize(e),
    }
}

/// # Safety
/// `buf` must point to at least `count` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn shim_write(fd: c_int, buf: *const c_void, count: usize) -> ssize_t {
    if buf.is_null() {
        return fail_ssize(ShimError::Invalid);
    }
    let slice = std::slice::from_raw_parts(buf as *const u8, count);
    let mut shim = global_shim().lock().unwrap();
    match shim.write(fd, slice) {
        Ok(n) => n as ssize_t,
        Err(e) => fail_ssize(e),
    }
}

/// # Safety
/// `addr` must point to at least `size_of::<sockaddr_in>()` writable bytes
/// when non-null; `len` must point to a writable `socklen_t` when non-null.
#[no_mangle]
pub unsafe extern "C" fn shim_getsockname(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    let mut shim = global_shim().lock().unwrap();
    match shim.getsockname(fd) {
        Ok(v4) => {
            if !addr.is_null() {
                v4_to_sockaddr(v4, addr, len);
            }
            0
        }
        Err(e) => fail_int(e),
    }
}

/// Socket options beyond trivial acknowledgement are a non-goal: this
/// validates the descriptor and always succeeds otherwise.
#[no_mangle]
pub extern "C" fn shim_setsockopt(
    fd: c_int,
    _level: c_int,
    _optname: c_int,
    _optval: *const c_void,
    _optlen: socklen_t,
) -> c_int {
    let mut shim = global_shim().lock().unwrap();
    match shim.setsockopt(fd) {
        Ok(()) => 0,
        Err(e) => fail_int(e),
    }
}

/// Always `ENOTSUP`: full `sendmsg`/`recvmsg` semantics (ancillary data,
/// multi-destination `msghdr`) are an explicit non-goal.
#[no_mangle]
pub extern "C" fn shim_sendmsg(fd: c_int, _msg: *const c_void, _flags: c_int) -> ssize_t {
    let mut shim = global_shim().lock().unwrap();
    match shim.sendmsg(fd, &[]) {
        Ok(n) => n as ssize_t,
        Err(e) => fail_ssize(e),
    }
}

#[no_mangle]
pub extern "C" fn shim_recvmsg(fd: c_int, _msg: *mut c_void, _flags: c_int) -> ssize_t {
    let mut shim = global_shim().lock().unwrap();
    match shim.recvmsg(fd, &mut []) {
        Ok(n) => n as ssize_t,
        Err(e) => fail_ssize(e),
    }
}

#[no_mangle]
pub extern "C" fn shim_epoll_create(_flags: c_int) -> c_int {
    let mut shim = global_shim().lock().unwrap();
    match shim.epoll_create() {
        Ok(fd) => fd,
        Err(e) => fail_int(e),
    }
}

/// # Safety
/// `event` must be non-null and point to a valid [`ShimEpollEvent`] for
/// `ADD`/`MOD`; it is ignored (and may be null) for `DEL`, mirroring real
/// `epoll_ctl`.
#[no_mangle]
pub unsafe extern "C" fn shim_epoll_ctl(epfd: c_int, op: c_int, fd: c_int, event: *mut ShimEpollEvent) -> c_int {
    let mut shim = global_shim().lock().unwrap();
    match op {
        EPOLL_CTL_ADD | EPOLL_CTL_MOD => {
            if event.is_null() {
                return fail_int(ShimError::Invalid);
            }
            let ev = &*event;
            let Some(interest) = interest_from_mask(ev.events) else {
                return fail_int(ShimError::Invalid);
            };
            let user_data = UserData(ev.data);
            let result = if op == EPOLL_CTL_ADD {
                shim.epoll_add(epfd, fd, interest, user_data)
            } else {
                shim.epoll_modify(epfd, fd, interest, user_data)
            };
            match result {
                Ok(()) => 0,
                Err(e) => fail_int(e),
            }
        }
        EPOLL_CTL_DEL => match shim.epoll_delete(epfd, fd) {
            Ok(()) => 0,
            Err(e) => fail_int(e),
        },
        _ => fail_int(ShimError::Invalid),
    }
}

/// # Safety
/// `events` must point to a writable buffer of at least `maxevents`
/// [`ShimEpollEvent`] slots. `sigmask` is accepted for ABI compatibility and
/// ignored: signal-mask swapping during the wait is an explicit non-goal.
#[no_mangle]
pub unsafe extern "C" fn shim_epoll_pwait(
    epfd: c_int,
    events: *mut ShimEpollEvent,
    maxevents: c_int,
    timeout_ms: c_int,
    _sigmask: *const libc::sigset_t,
) -> c_int {
    if events.is_null() || maxevents <= 0 {
        return fail_int(ShimError::Invalid);
    }
    let timeout = match timeout_ms {
        t if t < 0 => None,
        t => Some(Duration::from_millis(t as u64)),
    };
    let mut shim = global_shim().lock().unwrap();
    let ready = match shim.epoll_wait(epfd, maxevents as usize, timeout) {
        Ok(events) => events,
        Err(e) => return fail_int(e),
    };
    // `epoll_wait` already honors `maxevents` via the scheduler's
    // `drain_ready` cap, so every item in `ready` fits; `min` here is just
    // a defensive bound on the raw pointer write, not where capping happens.
    let n = ready.len().min(maxevents as usize);
    let out = std::slice::from_raw_parts_mut(events, n);
    for (slot, (user_data, interest)) in out.iter_mut().zip(ready.into_iter()) {
        slot.events = mask_from_interest(interest);
        slot.data = user_data.0;
    }
    n as c_int
}

/// Exposed for callers that want the raw errno without going through a
/// failing call's return value (matches `errno` access patterns on systems
/// without thread-local `errno` support built in).
#[no_mangle]
pub extern "C" fn shim_last_errno() -> c_int {
    error_last_errno()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_from_mask_rejects_unknown_bits() {
        assert!(interest_from_mask(libc::EPOLLIN as u32).is_some());
        assert!(interest_from_mask(libc::EPOLLERR as u32).is_none());
    }

    #[test]
    fn mask_from_interest_round_trips_through_from_mask() {
        let interest = Interest::readable() | Interest::writable();
        let mask = mask_from_interest(interest);
        assert_eq!(interest_from_mask(mask), Some(interest));
    }

    #[test]
    fn socket_bind_listen_close_over_the_c_abi() {
        let fd = shim_socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0u16.to_be(),
            sin_addr: libc::in_addr { s_addr: u32::from(Ipv4Addr::LOCALHOST).to_be() },
            sin_zero: [0; 8],
        };
        let rc = unsafe {
            shim_bind(
                fd,
                &sin as *const libc::sockaddr_in as *const sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(shim_listen(fd, 1), 0);

        let mut out_addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut out_len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let rc = unsafe {
            shim_getsockname(
                fd,
                &mut out_addr as *mut libc::sockaddr_in as *mut sockaddr,
                &mut out_len,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(u32::from_be(out_addr.sin_addr.s_addr), u32::from(Ipv4Addr::LOCALHOST));

        assert_eq!(shim_setsockopt(fd, 0, 0, std::ptr::null(), 0), 0);
        assert_eq!(shim_close(fd), 0);
    }

    #[test]
    fn sendmsg_and_recvmsg_report_not_supported() {
        let fd = shim_socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        assert_eq!(shim_sendmsg(fd, std::ptr::null(), 0), -1);
        assert_eq!(shim_last_errno(), libc::ENOTSUP);
        assert_eq!(shim_recvmsg(fd, std::ptr::null_mut(), 0), -1);
        assert_eq!(shim_close(fd), 0);
    }
}
