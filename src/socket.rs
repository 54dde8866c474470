//! Per-descriptor state machine for an accelerated socket (component C3).
//!
//! A [`SocketState`] tracks at most one outstanding accept, one outstanding
//! pop and one outstanding push against the async transport at a time, plus
//! whatever has already completed but not yet been consumed by a caller.
//! Readiness (`can_read`/`can_write`/`can_accept`) is computed from that
//! buffered state alone — nothing here talks to the transport directly,
//! that's the scheduler's job (component C5). Keeping the two separate
//! means this type can be unit-tested without a real or mock transport.

use std::collections::VecDeque;
use std::net::SocketAddrV4;

use crate::error::ShimError;
use crate::transport::{AcceptResult, CompletionResult, CompletionToken, CompletionValue, Opcode, Sga};

/// Where a socket sits in the connect/accept lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// `socket()` called, neither `bind` nor `connect` yet.
    Fresh,
    /// `bind()` called but not `listen()`.
    Bound,
    /// `listen()` called; only `accept` is meaningful.
    Listening,
    /// Connected (via `accept` on the peer side, or a successful connect);
    /// `read`/`write` are meaningful.
    Connected,
    /// `close()` called; every operation now fails with `BadFd`.
    Closed,
}

/// A connection handed off by a completed `accept`, not yet claimed by a
/// caller's `accept()` call.
#[derive(Copy, Clone, Debug)]
pub struct AcceptedConnection {
    pub qd: u32,
    pub addr: SocketAddrV4,
}

/// Per-socket adaptation state.
pub struct SocketState {
    pub qd: u32,
    pub role: Role,
    pub local_addr: Option<SocketAddrV4>,

    accept_token: Option<CompletionToken>,
    read_token: Option<CompletionToken>,
    write_token: Option<CompletionToken>,

    accept_queue: VecDeque<AcceptedConnection>,
    recv_buffer: Option<(Sga, usize, usize)>, // (sga, segment index, offset within segment)
    peer_closed: bool,
    last_error: Option<ShimError>,
}

impl SocketState {
    pub fn new(qd: u32) -> SocketState {
        SocketState {
            qd,
            role: Role::Fresh,
            local_addr: None,
            accept_token: None,
            read_token: None,
            write_token: None,
            accept_queue: VecDeque::new(),
            recv_buffer: None,
            peer_closed: false,
            last_error: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.role == Role::Closed
    }

    pub fn mark_closed(&mut self) {
        self.role = Role::Closed;
        self.accept_token = None;
        self.read_token = None;
        self.write_token = None;
    }

    pub fn take_error(&mut self) -> Option<ShimError> {
        self.last_error.take()
    }

    // --- scheduling queries: does this socket need a fresh op submitted? ---

    pub fn wants_accept_poll(&self) -> bool {
        self.role == Role::Listening && self.accept_token.is_none() && self.accept_queue.is_empty()
    }

    pub fn wants_read_poll(&self) -> bool {
        self.role == Role::Connected
            && self.read_token.is_none()
            && self.recv_buffer.is_none()
            && !self.peer_closed
    }

    pub fn wants_write_poll(&self) -> bool {
        false // writes are submitted on demand by write()/writev(), never speculatively
    }

    pub fn set_accept_token(&mut self, token: CompletionToken) {
        self.accept_token = Some(token);
    }

    pub fn set_read_token(&mut self, token: CompletionToken) {
        self.read_token = Some(token);
    }

    pub fn set_write_token(&mut self, token: CompletionToken) {
        self.write_token = Some(token);
    }

    /// The push token still outstanding against the transport, if any. Used
    /// by the write path to reap a completed push before deciding whether
    /// the send slot is free for a new one.
    pub fn write_token(&self) -> Option<CompletionToken> {
        self.write_token
    }

    pub fn outstanding_tokens(&self) -> impl Iterator<Item = CompletionToken> + '_ {
        [self.accept_token, self.read_token, self.write_token]
            .into_iter()
            .flatten()
    }

    /// Folds a resolved completion into this socket's buffered state.
    pub fn handle_event(&mut self, result: CompletionResult) {
        match result.opcode {
            Opcode::Accept => {
                self.accept_token = None;
                if result.ret_code == 0 {
                    if let CompletionValue::Accept(AcceptResult { qd, addr }) = result.value {
                        self.accept_queue.push_back(AcceptedConnection { qd, addr });
                    }
                } else {
                    self.last_error = Some(ShimError::Invalid);
                }
            }
            Opcode::Pop => {
                self.read_token = None;
                if result.ret_code == 0 {
                    if let CompletionValue::Sga(sga) = result.value {
                        if sga.total_len() == 0 {
                            self.peer_closed = true;
                        } else {
                            self.recv_buffer = Some((sga, 0, 0));
                        }
                    }
                } else {
                    self.last_error = Some(ShimError::Invalid);
                }
            }
            Opcode::Push => {
                self.write_token = None;
                if result.ret_code != 0 {
                    self.last_error = Some(ShimError::Invalid);
                }
            }
            Opcode::Failed | Opcode::Invalid => {
                self.accept_token = None;
                self.read_token = None;
                self.write_token = None;
                self.last_error = Some(ShimError::Invalid);
            }
        }
    }

    // --- readiness ---

    pub fn can_accept(&self) -> bool {
        !self.accept_queue.is_empty()
    }

    pub fn can_read(&self) -> bool {
        self.recv_buffer.is_some() || self.peer_closed
    }

    pub fn can_write(&self) -> bool {
        self.role == Role::Connected && self.write_token.is_none()
    }

    // --- consuming completed state ---

    pub fn take_accepted(&mut self) -> Option<AcceptedConnection> {
        self.accept_queue.pop_front()
    }

    /// Copies as much buffered receive data as fits into `buf`, draining
    /// the underlying sga segment by segment. Returns `0` both when no data
    /// is buffered yet (caller should check `can_read`/peer_closed first)
    /// and when the peer has sent EOF.
    pub fn copy_into(&mut self, buf: &mut [u8]) -> usize {
        let Some((sga, mut seg_idx, mut seg_off)) = self.recv_buffer.take() else {
            return 0;
        };
        let mut written = 0;
        while written < buf.len() && seg_idx < sga.segments().len() {
            let seg = &sga.segments()[seg_idx];
            if seg_off >= seg.len() {
                seg_idx += 1;
                seg_off = 0;
                continue;
            }
            let available = &seg[seg_off..];
            let take = available.len().min(buf.len() - written);
            buf[written..written + take].copy_from_slice(&available[..take]);
            written += take;
            seg_off += take;
        }
        let exhausted = seg_idx >= sga.segments().len()
            || (seg_idx == sga.segments().len() - 1 && seg_off >= sga.segments()[seg_idx].len());
        if !exhausted {
            self.recv_buffer = Some((sga, seg_idx, seg_off));
        }
        written
    }

    /// Same as [`SocketState::copy_into`] but scatters across multiple
    /// destination buffers (`readv`), still draining a single sga.
    pub fn copy_into_vectored(&mut self, bufs: &mut [&mut [u8]]) -> usize {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            if buf.is_empty() {
                continue;
            }
            let n = self.copy_into(buf);
            total += n;
            if n < buf.len() {
                break; // drained everything currently buffered
            }
        }
        total
    }
}

/// Builds an owned sga from scattered source buffers, for `write`/`writev`.
pub fn sga_from_slices(bufs: &[&[u8]]) -> Sga {
    Sga::new(bufs.iter().map(|b| b.to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AcceptResult, CompletionResult, CompletionToken, CompletionValue, Opcode};
    use std::net::Ipv4Addr;

    fn pop_result(token: CompletionToken, qd: u32, bytes: &[u8]) -> CompletionResult {
        CompletionResult {
            opcode: Opcode::Pop,
            qd,
            token,
            ret_code: 0,
            value: CompletionValue::Sga(Sga::new(vec![bytes.to_vec()])),
        }
    }

    #[test]
    fn fresh_socket_has_no_readiness() {
        let s = SocketState::new(1);
        assert!(!s.can_read());
        assert!(!s.can_write());
        assert!(!s.can_accept());
    }

    #[test]
    fn connected_socket_is_writable_until_a_write_is_outstanding() {
        let mut s = SocketState::new(1);
        s.role = Role::Connected;
        assert!(s.can_write());
        s.set_write_token(CompletionToken(1));
        assert!(!s.can_write());
    }

    #[test]
    fn pop_completion_buffers_data_for_copy_into() {
        let mut s = SocketState::new(1);
        s.role = Role::Connected;
        s.set_read_token(CompletionToken(1));
        s.handle_event(pop_result(CompletionToken(1), 1, b"hello"));
        assert!(s.can_read());
        let mut buf = [0u8; 3];
        assert_eq!(s.copy_into(&mut buf), 3);
        assert_eq!(&buf, b"hel");
        // remainder still buffered
        let mut rest = [0u8; 8];
        assert_eq!(s.copy_into(&mut rest), 2);
        assert_eq!(&rest[..2], b"lo");
    }

    #[test]
    fn empty_pop_marks_peer_closed_and_readable() {
        let mut s = SocketState::new(1);
        s.role = Role::Connected;
        s.set_read_token(CompletionToken(1));
        s.handle_event(pop_result(CompletionToken(1), 1, b""));
        assert!(s.peer_closed);
        assert!(s.can_read());
        let mut buf = [0u8; 4];
        assert_eq!(s.copy_into(&mut buf), 0);
    }

    #[test]
    fn accept_completion_queues_a_connection() {
        let mut s = SocketState::new(1);
        s.role = Role::Listening;
        s.set_accept_token(CompletionToken(1));
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000);
        s.handle_event(CompletionResult {
            opcode: Opcode::Accept,
            qd: 1,
            token: CompletionToken(1),
            ret_code: 0,
            value: CompletionValue::Accept(AcceptResult { qd: 2, addr }),
        });
        assert!(s.can_accept());
        let conn = s.take_accepted().unwrap();
        assert_eq!(conn.qd, 2);
        assert!(!s.can_accept());
    }

    #[test]
    fn readv_drains_a_single_buffer_across_multiple_iovecs() {
        let mut s = SocketState::new(1);
        s.role = Role::Connected;
        s.set_read_token(CompletionToken(1));
        s.handle_event(pop_result(CompletionToken(1), 1, b"abcdefgh"));
        let mut a = [0u8; 3];
        let mut b = [0u8; 3];
        let mut c = [0u8; 3];
        let total = {
            let mut slices: [&mut [u8]; 3] = [&mut a, &mut b, &mut c];
            s.copy_into_vectored(&mut slices)
        };
        assert_eq!(total, 8);
        assert_eq!(&a, b"abc");
        assert_eq!(&b, b"def");
        assert_eq!(&c[..2], b"gh");
    }
}
