use std::{fmt, ops};

/// A set of readiness bits.
///
/// Only `READ` and `WRITE` are representable: the epoll registry (C4)
/// rejects any other bit at `ctl` time, so there is no `error()`/`hup()`
/// constructor here the way there is in a general-purpose poller. Error and
/// hangup conditions on native pass-through descriptors are folded into
/// `READABLE` before they ever reach an `Interest` value (see
/// `native::translate`).
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Default)]
pub struct Interest(u8);

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;
const ALL: u8 = READABLE | WRITABLE;

impl Interest {
    #[inline]
    pub fn empty() -> Interest {
        Interest(0)
    }

    #[inline]
    pub fn readable() -> Interest {
        Interest(READABLE)
    }

    #[inline]
    pub fn writable() -> Interest {
        Interest(WRITABLE)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Interest::readable())
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Interest::writable())
    }

    #[inline]
    pub fn contains(self, other: Interest) -> bool {
        (self.0 & other.0) == other.0
    }

    /// `true` iff every set bit is `READ` or `WRITE`.
    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 & !ALL == 0 && self.0 != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl ops::BitAnd for Interest {
    type Output = Interest;

    #[inline]
    fn bitand(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl ops::BitXor for Interest {
    type Output = Interest;

    #[inline]
    fn bitxor(self, other: Interest) -> Interest {
        Interest(self.0 ^ other.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        for (flag, name) in [(Interest::readable(), "READ"), (Interest::writable(), "WRITE")] {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(fmt, "(empty)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bits_outside_read_write() {
        let bogus = Interest(0b100);
        assert!(!bogus.is_valid());
        assert!((Interest::readable() | Interest::writable()).is_valid());
    }

    #[test]
    fn xor_is_the_remaining_interest() {
        let subscribed = Interest::readable() | Interest::writable();
        let satisfied = Interest::readable();
        assert_eq!(subscribed ^ satisfied, Interest::writable());
    }
}
