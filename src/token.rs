//! The opaque payload an `epoll_ctl` caller attaches to a registration and
//! gets back verbatim from `epoll_wait`.
//!
//! `libc::epoll_event` carries this as a `u64` union also usable as a raw
//! pointer; the adaptation engine never interprets it, so it's stored and
//! handed back as the plain integer a caller would expect from `.data.u64`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UserData(pub u64);

impl From<u64> for UserData {
    #[inline]
    fn from(val: u64) -> UserData {
        UserData(val)
    }
}

impl From<UserData> for u64 {
    #[inline]
    fn from(val: UserData) -> u64 {
        val.0
    }
}
