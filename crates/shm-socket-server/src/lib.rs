//! TCP listener with an accepter thread, a per-connection reader thread, an accept
//! watchdog and a per-connection read timeout.
//!
//! Grounded in `original_source/.../sockets.py`'s `SocketServer`. No kernel
//! receive-timestamp capture (the original's `SO_TIMESTAMPNS`/`recvmsg` path on
//! POSIX): that needs raw `cmsg` parsing behind `unsafe`, which this workspace forbids
//! outright, and no crate in the reference pack (no `socket2` or similar) offers a
//! safe wrapper for it. Every received chunk is timestamped with the local wall clock
//! instead, matching the original's own Windows fallback branch unconditionally.
//!
//! - [`events`] — [`SocketEvents`], the data/fault callback contract.
//! - [`server`] — [`SocketServer`], the listener and its threads.

#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod events;
mod join;
mod server;

pub use events::SocketEvents;
pub use server::SocketServer;
