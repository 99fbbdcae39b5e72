//! A single arm/heartbeat/deadline tracker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A deadline tracker: arm it, feed it heartbeats, and poll for expiry.
///
/// Unlike a one-shot timer, a `Watchdog` stays armed across repeated heartbeats — each
/// call to [`heartbeat`](Watchdog::heartbeat) pushes the deadline forward. Call
/// [`disarm`](Watchdog::disarm) to stop tracking (e.g. while shutting down, so a
/// deliberate pause doesn't look like a stall).
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    armed: AtomicBool,
    last_heartbeat: Mutex<Option<Instant>>,
}

impl Watchdog {
    /// Build a new watchdog with the given timeout. Starts disarmed.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            armed: AtomicBool::new(false),
            last_heartbeat: Mutex::new(None),
        }
    }

    /// Arm the watchdog and record a heartbeat at the current instant.
    pub fn arm(&self) {
        *self.last_heartbeat.lock() = Some(Instant::now());
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarm the watchdog; [`is_expired`](Watchdog::is_expired) returns `false` until
    /// rearmed.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Whether the watchdog is currently armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Record a heartbeat, pushing the deadline forward. A no-op if disarmed.
    pub fn heartbeat(&self) {
        if self.is_armed() {
            *self.last_heartbeat.lock() = Some(Instant::now());
        }
    }

    /// Time elapsed since the last heartbeat, or `None` if never armed.
    #[must_use]
    pub fn time_since_heartbeat(&self) -> Option<Duration> {
        self.last_heartbeat.lock().map(|t| t.elapsed())
    }

    /// Whether the configured timeout has elapsed since the last heartbeat. Always
    /// `false` while disarmed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        if !self.is_armed() {
            return false;
        }
        self.time_since_heartbeat()
            .is_some_and(|elapsed| elapsed >= self.timeout)
    }

    /// The configured timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disarmed_watchdog_never_expires() {
        let wdt = Watchdog::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!wdt.is_expired());
    }

    #[test]
    fn armed_watchdog_expires_after_timeout() {
        let wdt = Watchdog::new(Duration::from_millis(5));
        wdt.arm();
        assert!(!wdt.is_expired());
        std::thread::sleep(Duration::from_millis(20));
        assert!(wdt.is_expired());
    }

    #[test]
    fn heartbeat_resets_the_deadline() {
        let wdt = Watchdog::new(Duration::from_millis(20));
        wdt.arm();
        std::thread::sleep(Duration::from_millis(10));
        wdt.heartbeat();
        std::thread::sleep(Duration::from_millis(15));
        assert!(!wdt.is_expired());
    }

    #[test]
    fn disarm_stops_expiry() {
        let wdt = Watchdog::new(Duration::from_millis(5));
        wdt.arm();
        std::thread::sleep(Duration::from_millis(20));
        wdt.disarm();
        assert!(!wdt.is_expired());
        assert!(!wdt.is_armed());
    }
}
