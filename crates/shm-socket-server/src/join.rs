//! Bounded-wait thread join.
//!
//! `std::thread::JoinHandle` has no timeout variant, so a watcher thread joins on our
//! behalf and reports completion over a channel; if the grace period elapses first we
//! log and move on without blocking the shutdown path any further. The watcher keeps
//! running to completion either way — nothing is left unjoined at the OS level, we
//! simply stop waiting on it.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, thread_name: &str) {
    let (tx, rx) = crossbeam::channel::bounded(1);
    let spawned = thread::Builder::new().name(format!("{thread_name}-joiner")).spawn(move || {
        let _ = handle.join();
        let _ = tx.send(());
    });

    match spawned {
        Ok(_watcher) => {
            if rx.recv_timeout(timeout).is_err() {
                warn!(thread = thread_name, timeout_s = timeout.as_secs_f64(), "thread did not join within the shutdown grace period");
            }
        }
        Err(err) => warn!(error = %err, thread = thread_name, "failed to spawn joiner thread"),
    }
}
