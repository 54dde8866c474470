//! The public adaptation surface (component C6): one [`Shim`] per process
//! (or per test), holding every arena and registry the scheduler needs and
//! dispatching each POSIX-shaped call to either the host kernel or the
//! accelerated path based on [`crate::descriptor::classify`].

use std::net::SocketAddrV4;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::arena::SlotTable;
use crate::descriptor::{self, Classified};
use crate::epoll::native::NativeEpoll;
use crate::epoll::EpollInstance;
use crate::error::{Result, ShimError};
use crate::interest::Interest;
use crate::scheduler;
use crate::socket::{sga_from_slices, Role, SocketState};
use crate::token::UserData;
use crate::transport::AsyncTransport;

/// Construction-time knobs. Currently just the initial slab capacities;
/// kept as a struct rather than bare arguments so new knobs don't break
/// callers down the line.
#[derive(Clone, Debug, Default)]
pub struct InitArgs {
    pub socket_capacity_hint: usize,
    pub epoll_capacity_hint: usize,
}

struct EpollEntry {
    registry: EpollInstance,
    native: NativeEpoll,
}

/// The adaptation engine. Generic over the async transport so production
/// code and tests can plug in different backends without touching anything
/// else in the crate.
pub struct Shim<T: AsyncTransport> {
    sockets: SlotTable<SocketState>,
    epolls: SlotTable<EpollEntry>,
    transport: T,
}

impl<T: AsyncTransport> Shim<T> {
    pub fn new(transport: T, args: InitArgs) -> Shim<T> {
        crate::config::init_logging();
        Shim {
            sockets: SlotTable::with_capacity(args.socket_capacity_hint),
            epolls: SlotTable::with_capacity(args.epoll_capacity_hint),
            transport,
        }
    }

    // --- socket lifecycle ---

    pub fn socket(&mut self) -> Result<i32> {
        let qd = self.transport.socket()?;
        let slot = self.sockets.insert(SocketState::new(qd));
        let d = descriptor::make_socket(slot);
        trace!("socket() -> {}", d);
        Ok(d)
    }

    pub fn bind(&mut self, d: i32, addr: SocketAddrV4) -> Result<()> {
        let slot = self.socket_slot(d)?;
        let state = self.sockets.get_mut(slot)?;
        if state.role != Role::Fresh {
            return Err(ShimError::Invalid);
        }
        if addr.ip().is_unspecified() {
            warn!("bind({}) to an unspecified address, forwarding to the transport as-is", addr);
        }
        self.transport.bind(state.qd, addr)?;
        let state = self.sockets.get_mut(slot)?;
        state.role = Role::Bound;
        state.local_addr = Some(addr);
        Ok(())
    }

    pub fn listen(&mut self, d: i32, backlog: i32) -> Result<()> {
        let slot = self.socket_slot(d)?;
        let state = self.sockets.get_mut(slot)?;
        if state.role != Role::Bound {
            return Err(ShimError::Invalid);
        }
        self.transport.listen(state.qd, backlog)?;
        let state = self.sockets.get_mut(slot)?;
        state.role = Role::Listening;
        Ok(())
    }

    pub fn connect(&mut self, _d: i32, _addr: SocketAddrV4) -> Result<()> {
        // Outbound connect needs a transport-side `connect` completion this
        // crate's transport seam doesn't yet expose; recognized but not
        // wired up.
        warn!("connect() is not supported by the accelerated transport");
        Err(ShimError::NotSupported)
    }

    /// Partial per spec: returns the address recorded by a prior `bind`,
    /// `ENOTSUP` if the socket was never bound (a real `getsockname` on an
    /// unbound socket would report `0.0.0.0:0`, but this surface doesn't
    /// track an ephemeral port the transport never assigned).
    pub fn getsockname(&mut self, d: i32) -> Result<SocketAddrV4> {
        let slot = self.socket_slot(d)?;
        let state = self.sockets.get(slot)?;
        state.local_addr.ok_or(ShimError::NotSupported)
    }

    /// Stub per spec: socket options beyond trivial acknowledgement are a
    /// non-goal, so this just validates the descriptor and succeeds.
    pub fn setsockopt(&mut self, d: i32) -> Result<()> {
        let _ = self.socket_slot(d)?;
        debug!("setsockopt({}) acknowledged as a no-op", d);
        Ok(())
    }

    pub fn sendmsg(&mut self, d: i32, _bufs: &[&[u8]]) -> Result<usize> {
        let _ = self.socket_slot(d)?;
        warn!("sendmsg() is not supported by the accelerated transport");
        Err(ShimError::NotSupported)
    }

    pub fn recvmsg(&mut self, d: i32, _bufs: &mut [&mut [u8]]) -> Result<usize> {
        let _ = self.socket_slot(d)?;
        warn!("recvmsg() is not supported by the accelerated transport");
        Err(ShimError::NotSupported)
    }

    /// Non-blocking: returns [`ShimError::WouldBlock`] if no connection has
    /// completed yet. Callers wanting to block should register `d` for
    /// `READ` on an epoll instance and call this after `pwait` reports it.
    pub fn accept(&mut self, d: i32) -> Result<i32> {
        let slot = self.socket_slot(d)?;
        let state = self.sockets.get_mut(slot)?;
        if state.role != Role::Listening {
            return Err(ShimError::Invalid);
        }
        if state.wants_accept_poll() {
            // Idle: submit and report not-yet-ready, same as a pop/accept
            // first touch anywhere else in the state machine.
            let token = self.transport.accept(state.qd)?;
            state.set_accept_token(token);
        } else if let Some(token) = state.outstanding_tokens().next() {
            // InFlight: a zero-timeout poll, so a caller looping on accept()
            // without going through epoll still makes progress.
            if let Ok((result, _)) = self.transport.wait_any(&[token], Some(Duration::ZERO)) {
                let state = self.sockets.get_mut(slot)?;
                state.handle_event(result);
            }
        }
        let state = self.sockets.get_mut(slot)?;
        match state.take_accepted() {
            Some(conn) => {
                let mut new_state = SocketState::new(conn.qd);
                new_state.role = Role::Connected;
                new_state.local_addr = Some(conn.addr);
                let new_slot = self.sockets.insert(new_state);
                Ok(descriptor::make_socket(new_slot))
            }
            None => Err(ShimError::WouldBlock),
        }
    }

    pub fn close(&mut self, d: i32) -> Result<()> {
        match descriptor::classify(d) {
            Classified::Native(fd) => {
                let rc = unsafe { libc::close(fd) };
                if rc == -1 {
                    Err(ShimError::Invalid)
                } else {
                    Ok(())
                }
            }
            Classified::Epoll(slot) => {
                self.epolls.remove(slot).map(|_| ()).map_err(|_| ShimError::BadFd)
            }
            Classified::Socket(slot) => {
                let state = self.sockets.get_mut(slot)?;
                let qd = state.qd;
                // drain every InFlight token synchronously before handing the
                // qd back to the transport; leaking a token across close is
                // forbidden.
                let pending: Vec<_> = state.outstanding_tokens().collect();
                for token in pending {
                    if let Ok((result, _)) = self.transport.wait_any(&[token], None) {
                        let state = self.sockets.get_mut(slot)?;
                        state.handle_event(result);
                    }
                }
                let state = self.sockets.get_mut(slot)?;
                state.mark_closed();
                let _ = self.transport.close(qd);
                Ok(())
            }
        }
    }

    // --- data path ---

    pub fn read(&mut self, d: i32, buf: &mut [u8]) -> Result<usize> {
        match descriptor::classify(d) {
            Classified::Native(fd) => native_read(fd, buf),
            Classified::Socket(slot) => self.socket_read(slot, buf),
            Classified::Epoll(_) => Err(ShimError::Invalid),
        }
    }

    pub fn readv(&mut self, d: i32, bufs: &mut [&mut [u8]]) -> Result<usize> {
        match descriptor::classify(d) {
            Classified::Native(fd) => native_readv(fd, bufs),
            Classified::Socket(slot) => {
                let state = self.sockets.get_mut(slot)?;
                if state.role != Role::Connected {
                    return Err(ShimError::Invalid);
                }
                if !state.can_read() {
                    return Err(ShimError::WouldBlock);
                }
                Ok(state.copy_into_vectored(bufs))
            }
            Classified::Epoll(_) => Err(ShimError::Invalid),
        }
    }

    fn socket_read(&mut self, slot: usize, buf: &mut [u8]) -> Result<usize> {
        let state = self.sockets.get_mut(slot)?;
        if state.role != Role::Connected {
            return Err(ShimError::Invalid);
        }
        if !state.can_read() {
            return Err(ShimError::WouldBlock);
        }
        Ok(state.copy_into(buf))
    }

    pub fn write(&mut self, d: i32, buf: &[u8]) -> Result<usize> {
        self.writev(d, &[buf])
    }

    pub fn writev(&mut self, d: i32, bufs: &[&[u8]]) -> Result<usize> {
        match descriptor::classify(d) {
            Classified::Native(fd) => native_writev(fd, bufs),
            Classified::Socket(slot) => {
                let state = self.sockets.get_mut(slot)?;
                if state.role != Role::Connected {
                    return Err(ShimError::Invalid);
                }
                // InFlight: reap a completed push with a zero-timeout poll
                // before deciding the slot is still busy, per §4.3 — a
                // caller retrying `write` on `EWOULDBLOCK` must be able to
                // make progress without an interposed `epoll_wait`.
                if let Some(token) = state.write_token() {
                    if let Ok((result, _)) = self.transport.wait_any(&[token], Some(Duration::ZERO)) {
                        let state = self.sockets.get_mut(slot)?;
                        state.handle_event(result);
                    }
                }
                let state = self.sockets.get_mut(slot)?;
                if !state.can_write() {
                    return Err(ShimError::WouldBlock);
                }
                let qd = state.qd;
                let sga = sga_from_slices(bufs);
                let len = sga.total_len();
                let token = self.transport.push(qd, sga)?;
                let state = self.sockets.get_mut(slot)?;
                state.set_write_token(token);
                Ok(len)
            }
            Classified::Epoll(_) => Err(ShimError::Invalid),
        }
    }

    // --- epoll ---

    pub fn epoll_create(&mut self) -> Result<i32> {
        let native = NativeEpoll::new().map_err(|_| ShimError::Invalid)?;
        let slot = self.epolls.insert(EpollEntry {
            registry: EpollInstance::new(),
            native,
        });
        Ok(descriptor::make_epoll(slot))
    }

    pub fn epoll_add(&mut self, epfd: i32, watched: i32, interest: Interest, user_data: UserData) -> Result<()> {
        let slot = self.epoll_slot(epfd)?;
        let entry = self.epolls.get_mut(slot)?;
        entry.registry.add(watched, interest, user_data)?;
        if let Classified::Native(fd) = descriptor::classify(watched) {
            if let Err(e) = entry.native.add(fd, watched as u64, interest) {
                entry.registry.delete(watched).ok();
                return Err(native_io_err(&e));
            }
        }
        Ok(())
    }

    pub fn epoll_modify(&mut self, epfd: i32, watched: i32, interest: Interest, user_data: UserData) -> Result<()> {
        let slot = self.epoll_slot(epfd)?;
        let entry = self.epolls.get_mut(slot)?;
        entry.registry.modify(watched, interest, user_data)?;
        if let Classified::Native(fd) = descriptor::classify(watched) {
            entry
                .native
                .modify(fd, watched as u64, interest)
                .map_err(|e| native_io_err(&e))?;
        }
        Ok(())
    }

    pub fn epoll_delete(&mut self, epfd: i32, watched: i32) -> Result<()> {
        let slot = self.epoll_slot(epfd)?;
        let entry = self.epolls.get_mut(slot)?;
        entry.registry.delete(watched)?;
        if let Classified::Native(fd) = descriptor::classify(watched) {
            let _ = entry.native.delete(fd);
        }
        Ok(())
    }

    pub fn epoll_wait(
        &mut self,
        epfd: i32,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<(UserData, Interest)>> {
        let slot = self.epoll_slot(epfd)?;
        let entry = self.epolls.get_mut(slot)?;
        let result = scheduler::pwait(
            &mut entry.registry,
            &mut self.sockets,
            &entry.native,
            &mut self.transport,
            timeout,
            max_events,
        );
        if let Ok(ref events) = result {
            debug!("epoll_wait({}) -> {} events", epfd, events.len());
        }
        result
    }

    fn socket_slot(&self, d: i32) -> Result<usize> {
        match descriptor::classify(d) {
            Classified::Socket(slot) if self.sockets.contains(slot) => Ok(slot),
            _ => Err(ShimError::BadFd),
        }
    }

    fn epoll_slot(&self, d: i32) -> Result<usize> {
        match descriptor::classify(d) {
            Classified::Epoll(slot) if self.epolls.contains(slot) => Ok(slot),
            _ => Err(ShimError::BadFd),
        }
    }
}

fn native_read(fd: i32, buf: &mut [u8]) -> Result<usize> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    native_rc(rc)
}

fn native_readv(fd: i32, bufs: &mut [&mut [u8]]) -> Result<usize> {
    let mut iov: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let rc = unsafe { libc::readv(fd, iov.as_mut_ptr(), iov.len() as i32) };
    native_rc(rc)
}

fn native_writev(fd: i32, bufs: &[&[u8]]) -> Result<usize> {
    let iov: Vec<libc::iovec> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let rc = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as i32) };
    native_rc(rc)
}

fn native_io_err(err: &std::io::Error) -> ShimError {
    match err.raw_os_error() {
        Some(libc::EBADF) => ShimError::BadFd,
        _ => ShimError::Invalid,
    }
}

fn native_rc(rc: isize) -> Result<usize> {
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) => Err(ShimError::WouldBlock),
            _ => Err(ShimError::Invalid),
        }
    } else {
        Ok(rc as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::net::Ipv4Addr;

    fn fresh_shim() -> Shim<LoopbackTransport> {
        Shim::new(LoopbackTransport::new(), InitArgs::default())
    }

    #[test]
    fn bind_before_socket_is_rejected() {
        let mut shim = fresh_shim();
        let err = shim.bind(999, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap_err();
        assert_eq!(err, ShimError::BadFd);
    }

    #[test]
    fn listen_requires_a_prior_bind() {
        let mut shim = fresh_shim();
        let d = shim.socket().unwrap();
        let err = shim.listen(d, 16).unwrap_err();
        assert_eq!(err, ShimError::Invalid);
    }

    #[test]
    fn read_before_connect_is_invalid_not_would_block() {
        let mut shim = fresh_shim();
        let d = shim.socket().unwrap();
        let mut buf = [0u8; 4];
        let err = shim.read(d, &mut buf).unwrap_err();
        assert_eq!(err, ShimError::Invalid);
    }

    #[test]
    fn double_add_to_the_same_epoll_instance_is_rejected() {
        let mut shim = fresh_shim();
        let epfd = shim.epoll_create().unwrap();
        let d = shim.socket().unwrap();
        shim.epoll_add(epfd, d, Interest::readable(), UserData(1)).unwrap();
        let err = shim.epoll_add(epfd, d, Interest::readable(), UserData(2)).unwrap_err();
        assert_eq!(err, ShimError::Exists);
    }

    #[test]
    fn an_unknown_descriptor_is_badfd_everywhere() {
        let mut shim = fresh_shim();
        assert_eq!(shim.close(12345).unwrap_err(), ShimError::BadFd);
        let epfd = shim.epoll_create().unwrap();
        assert_eq!(
            shim.epoll_add(epfd, 12345, Interest::readable(), UserData(0)).unwrap_err(),
            ShimError::BadFd
        );
    }

    #[test]
    fn getsockname_reports_the_bound_address_after_bind() {
        let mut shim = fresh_shim();
        let d = shim.socket().unwrap();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        shim.bind(d, addr).unwrap();
        assert_eq!(shim.getsockname(d).unwrap(), addr);
    }

    #[test]
    fn getsockname_before_bind_is_not_supported() {
        let mut shim = fresh_shim();
        let d = shim.socket().unwrap();
        assert_eq!(shim.getsockname(d).unwrap_err(), ShimError::NotSupported);
    }

    #[test]
    fn setsockopt_is_a_validated_no_op() {
        let mut shim = fresh_shim();
        let d = shim.socket().unwrap();
        shim.setsockopt(d).unwrap();
        assert_eq!(shim.setsockopt(12345).unwrap_err(), ShimError::BadFd);
    }

    #[test]
    fn sendmsg_and_recvmsg_are_not_supported() {
        let mut shim = fresh_shim();
        let d = shim.socket().unwrap();
        assert_eq!(shim.sendmsg(d, &[b"x"]).unwrap_err(), ShimError::NotSupported);
        let mut scratch = [0u8; 1];
        let mut bufs: [&mut [u8]; 1] = [&mut scratch];
        assert_eq!(shim.recvmsg(d, &mut bufs).unwrap_err(), ShimError::NotSupported);
    }
}
