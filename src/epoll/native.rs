//! Thin wrapper over the host `epoll_create1`/`epoll_ctl`/`epoll_wait`
//! syscalls, used for descriptors that pass straight through to the kernel.
//!
//! This is deliberately a direct translation of libc calls, not a
//! reimplementation of readiness semantics: the kernel already does that
//! for native descriptors, the adaptation engine only needs a place to
//! register them and a way to read back what fired.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::interest::Interest;

/// Calls a libc function and turns a `-1` return into `io::Error::last_os_error`.
macro_rules! syscall {
    ($fn:ident $args:tt) => {{
        let res = unsafe { libc::$fn $args };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// A single host epoll instance backing one or more registered native fds.
pub struct NativeEpoll {
    epfd: RawFd,
}

impl NativeEpoll {
    pub fn new() -> std::io::Result<NativeEpoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(NativeEpoll { epfd })
    }

    pub fn add(&self, fd: RawFd, key: u64, interest: Interest) -> std::io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: key,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> std::io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: key,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> std::io::Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut event))?;
        Ok(())
    }

    /// Waits up to `timeout` (`None` = block indefinitely) and appends every
    /// fired `(key, Interest)` pair to `out`. A `timeout` of `Some(Duration::ZERO)`
    /// polls once without blocking, matching the "no wait" leg of `pwait`.
    pub fn wait(&self, out: &mut Vec<(u64, Interest)>, timeout: Option<Duration>) -> std::io::Result<()> {
        let millis = timeout
            .map(|d| d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let mut buf: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        let n = syscall!(epoll_wait(self.epfd, buf.as_mut_ptr(), buf.len() as i32, millis))?;

        for ev in &buf[..n as usize] {
            out.push((ev.u64, translate(ev.events as libc::c_int)));
        }
        Ok(())
    }
}

impl Drop for NativeEpoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= libc::EPOLLIN;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT;
    }
    bits as u32
}

/// Folds raw epoll event bits into an [`Interest`], treating `EPOLLERR` and
/// `EPOLLHUP` as readable so a caller waiting only on `READ` still observes
/// the error/hangup rather than blocking on it forever.
pub fn translate(bits: libc::c_int) -> Interest {
    let mut interest = Interest::empty();
    if bits & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLERR | libc::EPOLLHUP) != 0 {
        interest = interest | Interest::readable();
    }
    if bits & libc::EPOLLOUT != 0 {
        interest = interest | Interest::writable();
    }
    interest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_folds_error_and_hangup_into_readable() {
        assert!(translate(libc::EPOLLERR).is_readable());
        assert!(translate(libc::EPOLLHUP).is_readable());
        assert!(translate(libc::EPOLLIN).is_readable());
        assert!(translate(libc::EPOLLOUT).is_writable());
        assert!(!translate(libc::EPOLLOUT).is_readable());
    }

    #[test]
    fn a_fresh_instance_can_register_and_wait_on_itself() {
        // exercising the happy path against a real host epoll fd; this is
        // the one test in the crate that talks to the actual kernel.
        let epoll = NativeEpoll::new().unwrap();
        let (r, w) = unsafe {
            let mut fds = [0i32; 2];
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            (fds[0], fds[1])
        };
        epoll.add(r, 42, Interest::readable()).unwrap();
        unsafe {
            let byte = 1u8;
            libc::write(w, &byte as *const u8 as *const libc::c_void, 1);
        }
        let mut out = Vec::new();
        epoll.wait(&mut out, Some(Duration::from_millis(200))).unwrap();
        assert_eq!(out, vec![(42, Interest::readable())]);
        epoll.delete(r).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
