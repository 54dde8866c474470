//! The `pwait` scheduling loop (component C5): the part of the engine that
//! turns "here is an epoll instance and a deadline" into a drained ready
//! list, bridging the native host epoll and the completion-token async
//! transport in a single pass.
//!
//! Each iteration runs five passes:
//!
//! 1. **Reap** — drop registry entries whose socket was closed out from
//!    under them (the owning [`crate::arena::SlotTable`] slot was freed).
//! 2. **Schedule** — for every still-registered accelerated socket, submit
//!    whatever op (`accept`/`pop`) it's missing and doesn't already have
//!    outstanding. This is the "XOR" part: a socket only gets a fresh op
//!    when it wants one and doesn't already have one in flight, so the
//!    transport never sees two outstanding pops for the same socket.
//! 3. **Multiplex** — poll the native host epoll instance and the
//!    transport's outstanding tokens, both non-blocking.
//! 4. **Drain** — pull whatever the registry now has queued.
//! 5. **Augment** — if nothing was ready and the deadline hasn't passed,
//!    sleep briefly and go again; the native and transport polls in pass 3
//!    feed pass 4 on every iteration, so a native-fd event and an
//!    accelerated-socket event can both be picked up in the same `pwait`
//!    call regardless of which source produced them.

use std::time::{Duration, Instant};

use crate::arena::SlotTable;
use crate::epoll::native::NativeEpoll;
use crate::epoll::EpollInstance;
use crate::error::Result;
use crate::interest::Interest;
use crate::socket::SocketState;
use crate::token::UserData;
use crate::transport::AsyncTransport;

/// How long to sleep between busy-poll iterations while waiting for the
/// transport or the native epoll to produce something.
const SPIN_INTERVAL: Duration = Duration::from_micros(500);

/// Runs the scheduling loop until either an event is ready or `timeout`
/// elapses. `Ok(vec![])` on timeout, matching `epoll_wait`'s `0`-events
/// return rather than an error.
pub fn pwait<T: AsyncTransport>(
    epoll: &mut EpollInstance,
    sockets: &mut SlotTable<SocketState>,
    native: &NativeEpoll,
    transport: &mut T,
    timeout: Option<Duration>,
    max_events: usize,
) -> Result<Vec<(UserData, Interest)>> {
    let deadline = timeout.map(|d| Instant::now() + d);

    loop {
        reap_closed(epoll, sockets);
        mark_already_satisfied(epoll, sockets);
        schedule_missing_ops(epoll, sockets, transport);
        multiplex_once(epoll, sockets, native, transport);

        let ready = epoll.drain_ready(max_events);
        if !ready.is_empty() {
            return Ok(ready);
        }

        match deadline {
            Some(deadline) if Instant::now() >= deadline => return Ok(Vec::new()),
            None if !has_any_source(epoll, sockets) => return Ok(Vec::new()),
            _ => std::thread::sleep(SPIN_INTERVAL),
        }
    }
}

/// A `pwait(..., timeout = None)` with nothing registered at all would spin
/// forever; treat an empty registry as an immediate, empty return instead.
fn has_any_source(epoll: &EpollInstance, _sockets: &SlotTable<SocketState>) -> bool {
    !epoll.is_empty()
}

fn reap_closed(epoll: &mut EpollInstance, sockets: &SlotTable<SocketState>) {
    let stale: Vec<i32> = epoll
        .watched()
        .filter(|&watched| {
            if let crate::descriptor::Classified::Socket(slot) = crate::descriptor::classify(watched) {
                sockets.get(slot).map(|s| s.is_closed()).unwrap_or(true)
            } else {
                false
            }
        })
        .collect();
    for watched in stale {
        let _ = epoll.delete(watched);
    }
}

/// Pass 2 step 1-2: a socket already holding buffered, unconsumed state
/// (e.g. data popped on a prior iteration, or queued accepted connections)
/// is ready regardless of whether anything new resolved this time around.
fn mark_already_satisfied(epoll: &mut EpollInstance, sockets: &SlotTable<SocketState>) {
    for watched in epoll.watched().collect::<Vec<_>>() {
        let crate::descriptor::Classified::Socket(slot) = crate::descriptor::classify(watched) else {
            continue;
        };
        let Ok(state) = sockets.get(slot) else {
            continue;
        };
        let satisfied = current_readiness(state);
        if !satisfied.is_empty() {
            epoll.mark_ready(watched, satisfied);
        }
    }
}

fn schedule_missing_ops<T: AsyncTransport>(
    epoll: &EpollInstance,
    sockets: &mut SlotTable<SocketState>,
    transport: &mut T,
) {
    for watched in epoll.watched().collect::<Vec<_>>() {
        let crate::descriptor::Classified::Socket(slot) = crate::descriptor::classify(watched) else {
            continue;
        };
        let Ok(state) = sockets.get_mut(slot) else {
            continue;
        };
        if state.wants_accept_poll() {
            if let Ok(token) = transport.accept(state.qd) {
                state.set_accept_token(token);
            }
        }
        if state.wants_read_poll() {
            if let Ok(token) = transport.pop(state.qd) {
                state.set_read_token(token);
            }
        }
    }
}

fn multiplex_once<T: AsyncTransport>(
    epoll: &mut EpollInstance,
    sockets: &mut SlotTable<SocketState>,
    native: &NativeEpoll,
    transport: &mut T,
) {
    // Accelerated tokens are resolved before the native poll is invoked:
    // when both a socket and a native fd become ready within the same
    // `pwait` call, the drained order should surface the accelerated event
    // first (the ready list is consulted before native poll is augmented).
    let tokens: Vec<_> = epoll
        .watched()
        .filter_map(|watched| match crate::descriptor::classify(watched) {
            crate::descriptor::Classified::Socket(slot) => sockets.get(slot).ok().map(|s| (watched, slot, s)),
            _ => None,
        })
        .flat_map(|(watched, slot, state)| state.outstanding_tokens().map(move |t| (watched, slot, t)))
        .collect();

    if !tokens.is_empty() {
        let just_tokens: Vec<_> = tokens.iter().map(|(_, _, t)| *t).collect();
        if let Ok((result, idx)) = transport.wait_any(&just_tokens, Some(Duration::ZERO)) {
            let (watched, slot, _) = tokens[idx];
            if let Ok(state) = sockets.get_mut(slot) {
                state.handle_event(result);
                let observed = Interest::readable() | Interest::writable();
                let satisfied = current_readiness(state);
                epoll.mark_ready(watched, satisfied & observed);
            }
        }
    }

    let mut native_events = Vec::new();
    let _ = native.wait(&mut native_events, Some(Duration::ZERO));
    for (key, interest) in native_events {
        epoll.mark_ready(key as i32, interest);
    }
}

fn current_readiness(state: &SocketState) -> Interest {
    let mut interest = Interest::empty();
    if state.can_read() || state.can_accept() {
        interest = interest | Interest::readable();
    }
    if state.can_write() {
        interest = interest | Interest::writable();
    }
    interest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SlotTable;
    use crate::descriptor;
    use crate::epoll::EpollInstance;
    use crate::socket::{Role, SocketState};
    use crate::transport::LoopbackTransport;

    #[test]
    fn pwait_times_out_with_nothing_registered() {
        let mut epoll = EpollInstance::new();
        let mut sockets: SlotTable<SocketState> = SlotTable::new();
        let native = NativeEpoll::new().unwrap();
        let mut transport = LoopbackTransport::new();
        let result = pwait(&mut epoll, &mut sockets, &native, &mut transport, Some(Duration::from_millis(5)), 64);
        assert_eq!(result.unwrap(), vec![]);
    }

    #[test]
    fn a_closed_socket_is_reaped_from_the_registry() {
        let mut epoll = EpollInstance::new();
        let mut sockets: SlotTable<SocketState> = SlotTable::new();
        let mut state = SocketState::new(1);
        state.role = Role::Connected;
        let slot = sockets.insert(state);
        let watched = descriptor::make_socket(slot);
        epoll
            .add(watched, Interest::readable(), UserData(99))
            .unwrap();
        sockets.remove(slot).unwrap();

        let native = NativeEpoll::new().unwrap();
        let mut transport = LoopbackTransport::new();
        let result = pwait(&mut epoll, &mut sockets, &native, &mut transport, Some(Duration::from_millis(5)), 64);
        assert_eq!(result.unwrap(), vec![]);
        assert!(!epoll.contains(watched));
    }
}
