//! Deadline/heartbeat watchdog primitive shared by the socket server and node.
//!
//! The gateway runs three independent watchdogs — accept, read, and a one-shot
//! first-packet timer — all built on the same heartbeat-and-deadline shape: arm it,
//! feed it a heartbeat on every sign of life, and poll [`Watchdog::is_expired`] from a
//! supervising thread.
//!
//! - [`watchdog`] — [`Watchdog`], the deadline-tracking primitive.
//! - [`poll`] — [`spawn_poll_thread`], a background poller that fires a callback once
//!   per expiry.

#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod poll;
pub mod watchdog;

pub use poll::spawn_poll_thread;
pub use watchdog::Watchdog;
