//! A Rust adaptation engine that makes a completion-token async transport
//! speak epoll.
//!
//! The transport exposes `socket`/`bind`/`listen`/`accept`/`push`/`pop`
//! plus a `wait_any` that resolves opaque completion tokens — closer to
//! io_uring or a kernel-bypass stack than to a readiness poller. This crate
//! sits in front of it and presents the POSIX shape callers already know:
//! `epoll_create`/`epoll_ctl`/`epoll_wait` over a descriptor space that
//! transparently spans native host fds and accelerated sockets.
//!
//! ```no_run
//! use epoll_shim::{InitArgs, Interest, Shim, UserData};
//! use epoll_shim::transport::LoopbackTransport;
//!
//! let mut shim = Shim::new(LoopbackTransport::new(), InitArgs::default());
//! let listener = shim.socket().unwrap();
//! shim.bind(listener, "127.0.0.1:0".parse().unwrap()).unwrap();
//! shim.listen(listener, 16).unwrap();
//!
//! let epfd = shim.epoll_create().unwrap();
//! shim.epoll_add(epfd, listener, Interest::readable(), UserData(1)).unwrap();
//! ```
//!
//! Logging follows `env_logger` conventions: set `RUST_LOG=epoll_shim=debug`
//! to see registry and scheduler activity.

pub mod arena;
pub mod config;
pub mod descriptor;
pub mod epoll;
pub mod error;
pub mod ffi;
pub mod interest;
pub mod scheduler;
pub mod shim;
pub mod socket;
pub mod token;
pub mod transport;

pub use descriptor::{classify, Classified, EPOLL_BASE, SOCKET_BASE};
pub use error::{last_errno, Result, ShimError};
pub use interest::Interest;
pub use shim::{InitArgs, Shim};
pub use token::UserData;
