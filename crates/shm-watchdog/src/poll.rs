//! Background polling thread that fires a callback once per watchdog expiry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::watchdog::Watchdog;

/// Spawn a thread that polls `watchdog` every `poll_interval` until `shutdown` is set,
/// calling `on_expired` the first time it observes expiry and disarming the watchdog
/// immediately after so the callback fires once per arm/heartbeat cycle rather than on
/// every poll tick.
///
/// The caller is responsible for re-arming the watchdog (typically from inside
/// `on_expired`'s recovery path, or by the next heartbeat).
pub fn spawn_poll_thread(
    watchdog: Arc<Watchdog>,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
    mut on_expired: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(poll_interval);
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            if watchdog.is_expired() {
                debug!(timeout_s = watchdog.timeout().as_secs_f64(), "watchdog expired");
                watchdog.disarm();
                on_expired();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn fires_once_per_expiry() {
        let wdt = Arc::new(Watchdog::new(Duration::from_millis(5)));
        wdt.arm();
        let shutdown = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicU32::new(0));

        let fired_clone = Arc::clone(&fired);
        let handle = spawn_poll_thread(
            Arc::clone(&wdt),
            Duration::from_millis(2),
            Arc::clone(&shutdown),
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        std::thread::sleep(Duration::from_millis(40));
        shutdown.store(true, Ordering::SeqCst);
        handle.join().expect("poll thread joins");

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_fires_if_heartbeats_keep_coming() {
        let wdt = Arc::new(Watchdog::new(Duration::from_millis(20)));
        wdt.arm();
        let shutdown = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicU32::new(0));

        let fired_clone = Arc::clone(&fired);
        let handle = spawn_poll_thread(
            Arc::clone(&wdt),
            Duration::from_millis(2),
            Arc::clone(&shutdown),
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(5));
            wdt.heartbeat();
        }
        shutdown.store(true, Ordering::SeqCst);
        handle.join().expect("poll thread joins");

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
