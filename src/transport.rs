//! The async transport seam (component C7).
//!
//! The real async transport is out of scope for this crate: it is an
//! external, completion-token-based kernel-bypass networking library. What
//! lives here is the trait the rest of the adaptation engine is written
//! against (abstracting native vs. user-space readiness sources behind a
//! single trait, rather than hard-coding one backend), plus an in-process
//! [`LoopbackTransport`] used by tests and examples.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddrV4, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use crate::error::{Result, ShimError};

/// Opaque identifier of a socket inside the async transport.
pub type TransportQd = u32;

/// A token returned by `accept`/`push`/`pop`, resolved by `wait`/`wait_any`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CompletionToken(pub u64);

/// The kind of operation a completion corresponds to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Push,
    Pop,
    Accept,
    Failed,
    Invalid,
}

/// A scatter-gather array: buffer segments owned by the transport's
/// allocator. Multi-segment on purpose — the copy helpers in [`crate::socket`]
/// are written to walk an arbitrary number of segments, matching the
/// original scatter-gather contract.
#[derive(Debug, Clone, Default)]
pub struct Sga {
    segments: Vec<Vec<u8>>,
}

impl Sga {
    pub fn new(segments: Vec<Vec<u8>>) -> Sga {
        Sga { segments }
    }

    /// A single-segment sga of `size` zeroed bytes, as a real transport's
    /// `sgaalloc(size)` would hand back for a future `push`.
    pub fn alloc(size: usize) -> Sga {
        Sga {
            segments: vec![vec![0u8; size]],
        }
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.segments
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }
}

/// The accepted-connection payload carried by an `ACCEPT` completion.
#[derive(Copy, Clone, Debug)]
pub struct AcceptResult {
    pub qd: TransportQd,
    pub addr: SocketAddrV4,
}

/// The payload of a resolved completion token.
#[derive(Debug, Clone)]
pub enum CompletionValue {
    Sga(Sga),
    Accept(AcceptResult),
    None,
}

/// A resolved completion, as handed back by `wait`/`wait_any`.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub opcode: Opcode,
    pub qd: TransportQd,
    pub token: CompletionToken,
    pub ret_code: i32,
    pub value: CompletionValue,
}

/// The completion-token async transport interface consumed by the scheduler.
///
/// All operations except [`AsyncTransport::wait_any`] and
/// [`AsyncTransport::wait`] are expected to return immediately: `socket`,
/// `bind`, `listen` and `close` are control-plane calls, while `accept`,
/// `push` and `pop` only *submit* work and hand back a token.
pub trait AsyncTransport {
    fn socket(&mut self) -> Result<TransportQd>;
    fn bind(&mut self, qd: TransportQd, addr: SocketAddrV4) -> Result<()>;
    fn listen(&mut self, qd: TransportQd, backlog: i32) -> Result<()>;
    fn close(&mut self, qd: TransportQd) -> Result<()>;

    fn accept(&mut self, qd: TransportQd) -> Result<CompletionToken>;
    fn push(&mut self, qd: TransportQd, sga: Sga) -> Result<CompletionToken>;
    fn pop(&mut self, qd: TransportQd) -> Result<CompletionToken>;

    fn sgaalloc(&mut self, size: usize) -> Sga;

    /// Polls a single token with `timeout`. `None` blocks indefinitely,
    /// `Some(Duration::ZERO)` polls once without blocking.
    fn wait(&mut self, token: CompletionToken, timeout: Option<Duration>) -> Result<CompletionResult> {
        self.wait_any(&[token], timeout).map(|(res, _)| res)
    }

    /// Blocks until any one of `tokens` resolves, or `timeout` elapses.
    /// Returns the resolved completion and the index into `tokens` it
    /// corresponds to. `Err(ShimError::TimedOut)` on expiry.
    fn wait_any(
        &mut self,
        tokens: &[CompletionToken],
        timeout: Option<Duration>,
    ) -> Result<(CompletionResult, usize)>;
}

enum LoopbackSocket {
    Fresh,
    Listening(TcpListener),
    Connected(TcpStream),
}

enum PendingOp {
    Accept(TransportQd),
    Push(TransportQd, Vec<u8>),
    Pop(TransportQd),
}

/// In-process reference transport used by the test suite and by the crate's
/// example binaries.
///
/// It is not a kernel-bypass stack: `accept`/`push`/`pop` are backed by real
/// nonblocking loopback TCP sockets, and `wait_any` resolves a token by
/// repeatedly re-attempting the underlying nonblocking syscall until it
/// stops returning `WouldBlock` or the deadline passes. That busy-poll loop
/// is the one place this type is deliberately not production-grade: it
/// exists so the adaptation engine above it — the actual subject of this
/// crate — can be driven end to end without real kernel-bypass hardware.
pub struct LoopbackTransport {
    sockets: HashMap<TransportQd, LoopbackSocket>,
    pending: HashMap<CompletionToken, PendingOp>,
    next_qd: TransportQd,
    next_token: u64,
    poll_interval: Duration,
}

impl Default for LoopbackTransport {
    fn default() -> LoopbackTransport {
        LoopbackTransport::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> LoopbackTransport {
        LoopbackTransport {
            sockets: HashMap::new(),
            pending: HashMap::new(),
            next_qd: 1,
            next_token: 1,
            poll_interval: Duration::from_micros(200),
        }
    }

    fn fresh_token(&mut self) -> CompletionToken {
        let tok = CompletionToken(self.next_token);
        self.next_token += 1;
        tok
    }

    fn try_resolve(&mut self, token: CompletionToken) -> Option<Result<CompletionResult>> {
        let op = self.pending.get_mut(&token)?;
        match op {
            PendingOp::Accept(qd) => {
                let qd = *qd;
                let listener = match self.sockets.get(&qd) {
                    Some(LoopbackSocket::Listening(l)) => l,
                    _ => {
                        return Some(Ok(failed(Opcode::Accept, qd, token)));
                    }
                };
                match listener.accept() {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nonblocking(true);
                        let new_qd = self.next_qd;
                        self.next_qd += 1;
                        self.sockets.insert(new_qd, LoopbackSocket::Connected(stream));
                        self.pending.remove(&token);
                        let addr_v4 = match addr {
                            std::net::SocketAddr::V4(a) => a,
                            std::net::SocketAddr::V6(_) => {
                                SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0)
                            }
                        };
                        Some(Ok(CompletionResult {
                            opcode: Opcode::Accept,
                            qd,
                            token,
                            ret_code: 0,
                            value: CompletionValue::Accept(AcceptResult {
                                qd: new_qd,
                                addr: addr_v4,
                            }),
                        }))
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(_) => {
                        self.pending.remove(&token);
                        Some(Ok(failed(Opcode::Accept, qd, token)))
                    }
                }
            }
            PendingOp::Pop(qd) => {
                let qd = *qd;
                let stream = match self.sockets.get_mut(&qd) {
                    Some(LoopbackSocket::Connected(s)) => s,
                    _ => return Some(Ok(failed(Opcode::Pop, qd, token))),
                };
                let mut buf = vec![0u8; 4096];
                match stream.read(&mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        self.pending.remove(&token);
                        Some(Ok(CompletionResult {
                            opcode: Opcode::Pop,
                            qd,
                            token,
                            ret_code: 0,
                            value: CompletionValue::Sga(Sga::new(vec![buf])),
                        }))
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(_) => {
                        self.pending.remove(&token);
                        Some(Ok(failed(Opcode::Pop, qd, token)))
                    }
                }
            }
            PendingOp::Push(qd, bytes) => {
                let qd = *qd;
                // `push` already wrote what the stream would immediately
                // accept; an empty remainder here means transmission
                // finished synchronously and this poll just collects it.
                if bytes.is_empty() {
                    self.pending.remove(&token);
                    return Some(Ok(push_completed(qd, token)));
                }
                let stream = match self.sockets.get_mut(&qd) {
                    Some(LoopbackSocket::Connected(s)) => s,
                    _ => {
                        self.pending.remove(&token);
                        return Some(Ok(failed(Opcode::Push, qd, token)));
                    }
                };
                match stream.write(bytes) {
                    Ok(0) => None,
                    Ok(n) => {
                        bytes.drain(0..n);
                        let drained = bytes.is_empty();
                        if drained {
                            self.pending.remove(&token);
                            Some(Ok(push_completed(qd, token)))
                        } else {
                            None
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(_) => {
                        self.pending.remove(&token);
                        Some(Ok(failed(Opcode::Push, qd, token)))
                    }
                }
            }
        }
    }
}

fn push_completed(qd: TransportQd, token: CompletionToken) -> CompletionResult {
    CompletionResult {
        opcode: Opcode::Push,
        qd,
        token,
        ret_code: 0,
        value: CompletionValue::None,
    }
}

fn failed(opcode: Opcode, qd: TransportQd, token: CompletionToken) -> CompletionResult {
    CompletionResult {
        opcode,
        qd,
        token,
        ret_code: libc::EIO,
        value: CompletionValue::None,
    }
}

impl AsyncTransport for LoopbackTransport {
    fn socket(&mut self) -> Result<TransportQd> {
        let qd = self.next_qd;
        self.next_qd += 1;
        self.sockets.insert(qd, LoopbackSocket::Fresh);
        Ok(qd)
    }

    fn bind(&mut self, qd: TransportQd, addr: SocketAddrV4) -> Result<()> {
        let listener = TcpListener::bind(addr).map_err(|_| ShimError::Invalid)?;
        listener.set_nonblocking(true).map_err(|_| ShimError::Invalid)?;
        self.sockets.insert(qd, LoopbackSocket::Listening(listener));
        Ok(())
    }

    fn listen(&mut self, _qd: TransportQd, _backlog: i32) -> Result<()> {
        // `bind` already created the listener; a real transport would
        // separate these two steps, this one is a no-op bookkeeping call.
        Ok(())
    }

    fn close(&mut self, qd: TransportQd) -> Result<()> {
        self.sockets.remove(&qd);
        Ok(())
    }

    fn accept(&mut self, qd: TransportQd) -> Result<CompletionToken> {
        let token = self.fresh_token();
        self.pending.insert(token, PendingOp::Accept(qd));
        Ok(token)
    }

    fn push(&mut self, qd: TransportQd, sga: Sga) -> Result<CompletionToken> {
        let token = self.fresh_token();
        let mut bytes = Vec::with_capacity(sga.total_len());
        for seg in sga.segments() {
            bytes.extend_from_slice(seg);
        }
        // A real transport starts transmitting the moment the operation is
        // submitted rather than waiting for a caller to poll `wait_any`;
        // mirror that by writing as much as the loopback stream accepts
        // right away. Anything left unwritten (a short nonblocking write,
        // or the peer not connected yet) stays pending for `try_resolve` to
        // keep draining on a later poll.
        if let Some(LoopbackSocket::Connected(stream)) = self.sockets.get_mut(&qd) {
            if let Ok(n) = stream.write(&bytes) {
                bytes.drain(0..n);
            }
        }
        self.pending.insert(token, PendingOp::Push(qd, bytes));
        Ok(token)
    }

    fn pop(&mut self, qd: TransportQd) -> Result<CompletionToken> {
        let token = self.fresh_token();
        self.pending.insert(token, PendingOp::Pop(qd));
        Ok(token)
    }

    fn sgaalloc(&mut self, size: usize) -> Sga {
        Sga::alloc(size)
    }

    fn wait_any(
        &mut self,
        tokens: &[CompletionToken],
        timeout: Option<Duration>,
    ) -> Result<(CompletionResult, usize)> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            for (idx, tok) in tokens.iter().enumerate() {
                if let Some(res) = self.try_resolve(*tok) {
                    return res.map(|r| (r, idx));
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(ShimError::TimedOut);
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgaalloc_reports_requested_size() {
        let mut t = LoopbackTransport::new();
        let sga = t.sgaalloc(128);
        assert_eq!(sga.total_len(), 128);
    }

    #[test]
    fn wait_any_times_out_with_no_progress() {
        let mut t = LoopbackTransport::new();
        let qd = t.socket().unwrap();
        let tok = t.pop(qd).unwrap();
        // qd was never bound/connected, so the pop can never resolve; this
        // just exercises the deadline path without waiting on real I/O.
        let err = t.wait_any(&[tok], Some(Duration::from_millis(5))).unwrap_err();
        assert_eq!(err, ShimError::TimedOut);
    }
}
