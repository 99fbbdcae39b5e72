//! Lifecycle state machine for a single sensor: drives a board through [`BoardControl`],
//! owns the socket server and packet handler, and recovers from connection faults.
//!
//! - [`board`] — [`BoardControl`], the console command surface; [`console`] supplies
//!   the default TCP implementation.
//! - [`status`] — [`StatusSink`], the lifecycle status publish contract.
//! - [`node`] — [`Node`], the state machine itself.

#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod board;
mod console;
mod node;
mod status;

pub use board::{BoardControl, BoardError, BoardInfo, BoardResult};
pub use console::ConsoleBoardControl;
pub use node::Node;
pub use status::{NullStatusSink, StatusSink};
