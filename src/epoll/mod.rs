//! The epoll registry (component C4): what `epoll_ctl` adds/modifies/
//! removes, and the ready list `epoll_wait` drains.
//!
//! Registration order is preserved with [`indexmap::IndexMap`] so that
//! `ctl`/`wait` behave the way a caller iterating `/proc/<pid>/fdinfo`
//! would expect, and readiness is tracked out of line in a `VecDeque`
//! rather than by walking every registered item on every `wait` — the
//! same externalized-ready-list shape the scheduler (component C5)
//! produces results for.

pub mod native;

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::error::{Result, ShimError};
use crate::interest::Interest;
use crate::token::UserData;

/// One registered `(watched descriptor, interest, user payload)` triple.
pub struct EpollItem {
    pub watched: i32,
    pub interest: Interest,
    pub user_data: UserData,
    ready_interest: Interest,
    queued: bool,
}

/// One `epoll_create` instance: a registry of watched descriptors plus
/// the subset of them currently observed ready.
#[derive(Default)]
pub struct EpollInstance {
    items: IndexMap<i32, EpollItem>,
    ready: VecDeque<i32>,
}

impl EpollInstance {
    pub fn new() -> EpollInstance {
        EpollInstance {
            items: IndexMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn add(&mut self, watched: i32, interest: Interest, user_data: UserData) -> Result<()> {
        if !interest.is_valid() {
            return Err(ShimError::Invalid);
        }
        if self.items.contains_key(&watched) {
            return Err(ShimError::Exists);
        }
        self.items.insert(
            watched,
            EpollItem {
                watched,
                interest,
                user_data,
                ready_interest: Interest::empty(),
                queued: false,
            },
        );
        Ok(())
    }

    pub fn modify(&mut self, watched: i32, interest: Interest, user_data: UserData) -> Result<()> {
        if !interest.is_valid() {
            return Err(ShimError::Invalid);
        }
        let item = self.items.get_mut(&watched).ok_or(ShimError::NotFound)?;
        item.interest = interest;
        item.user_data = user_data;
        // a level that was satisfied under the old interest may no longer
        // qualify under the new one; recompute lazily on next fill.
        item.ready_interest = item.ready_interest & interest;
        Ok(())
    }

    pub fn delete(&mut self, watched: i32) -> Result<()> {
        if self.items.shift_remove(&watched).is_none() {
            return Err(ShimError::NotFound);
        }
        self.ready.retain(|&fd| fd != watched);
        Ok(())
    }

    pub fn contains(&self, watched: i32) -> bool {
        self.items.contains_key(&watched)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn interest_of(&self, watched: i32) -> Option<Interest> {
        self.items.get(&watched).map(|item| item.interest)
    }

    /// Registers that `watched` currently satisfies `observed`. Queues the
    /// item for the next `drain_ready` unless it's already queued or the
    /// observed bits don't intersect the registered interest.
    pub fn mark_ready(&mut self, watched: i32, observed: Interest) {
        let Some(item) = self.items.get_mut(&watched) else {
            return;
        };
        let satisfied = item.interest & observed;
        if satisfied.is_empty() {
            return;
        }
        item.ready_interest = item.ready_interest | satisfied;
        if !item.queued {
            item.queued = true;
            self.ready.push_back(watched);
        }
    }

    /// Descriptors currently registered, for the scheduler to decide which
    /// ones still need a fresh async op submitted.
    pub fn watched(&self) -> impl Iterator<Item = i32> + '_ {
        self.items.keys().copied()
    }

    /// Drains up to `max` ready items as `(user_data, satisfied interest)`.
    /// An item whose registration vanished between `mark_ready` and the
    /// drain (raced by a `delete`) is silently skipped.
    pub fn drain_ready(&mut self, max: usize) -> Vec<(UserData, Interest)> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(watched) = self.ready.pop_front() else {
                break;
            };
            let Some(item) = self.items.get_mut(&watched) else {
                continue;
            };
            item.queued = false;
            let satisfied = item.ready_interest;
            item.ready_interest = Interest::empty();
            if satisfied.is_empty() {
                continue;
            }
            out.push((item.user_data, satisfied));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_add_is_rejected() {
        let mut epoll = EpollInstance::new();
        epoll.add(5, Interest::readable(), UserData(1)).unwrap();
        assert_eq!(
            epoll.add(5, Interest::readable(), UserData(2)).unwrap_err(),
            ShimError::Exists
        );
    }

    #[test]
    fn modify_or_delete_unknown_is_not_found() {
        let mut epoll = EpollInstance::new();
        assert_eq!(
            epoll.modify(9, Interest::readable(), UserData(0)).unwrap_err(),
            ShimError::NotFound
        );
        assert_eq!(epoll.delete(9).unwrap_err(), ShimError::NotFound);
    }

    #[test]
    fn invalid_interest_is_rejected_on_add_and_modify() {
        let mut epoll = EpollInstance::new();
        assert_eq!(
            epoll.add(1, Interest::empty(), UserData(0)).unwrap_err(),
            ShimError::Invalid
        );
        epoll.add(1, Interest::readable(), UserData(0)).unwrap();
        assert_eq!(
            epoll.modify(1, Interest::empty(), UserData(0)).unwrap_err(),
            ShimError::Invalid
        );
    }

    #[test]
    fn mark_ready_only_queues_intersecting_interest() {
        let mut epoll = EpollInstance::new();
        epoll.add(1, Interest::readable(), UserData(7)).unwrap();
        epoll.mark_ready(1, Interest::writable());
        assert!(epoll.drain_ready(8).is_empty());
        epoll.mark_ready(1, Interest::readable());
        let drained = epoll.drain_ready(8);
        assert_eq!(drained, vec![(UserData(7), Interest::readable())]);
    }

    #[test]
    fn drain_does_not_requeue_until_marked_again() {
        let mut epoll = EpollInstance::new();
        epoll.add(1, Interest::readable(), UserData(7)).unwrap();
        epoll.mark_ready(1, Interest::readable());
        assert_eq!(epoll.drain_ready(8).len(), 1);
        assert_eq!(epoll.drain_ready(8).len(), 0);
    }

    #[test]
    fn delete_clears_pending_readiness() {
        let mut epoll = EpollInstance::new();
        epoll.add(1, Interest::readable(), UserData(7)).unwrap();
        epoll.mark_ready(1, Interest::readable());
        epoll.delete(1).unwrap();
        assert!(epoll.drain_ready(8).is_empty());
    }

    #[test]
    fn drain_bounded_by_cap_leaves_surplus_queued_for_the_next_call() {
        let mut epoll = EpollInstance::new();
        for fd in 1..=3 {
            epoll.add(fd, Interest::readable(), UserData(fd as u64)).unwrap();
            epoll.mark_ready(fd, Interest::readable());
        }
        let first = epoll.drain_ready(2);
        assert_eq!(first.len(), 2);
        let second = epoll.drain_ready(2);
        assert_eq!(second, vec![(UserData(3), Interest::readable())]);
    }
}
