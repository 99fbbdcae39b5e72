//! The listener plus its accepter/reader threads.
//!
//! Grounded in `original_source/.../sockets.py`'s `SocketServer`: `open`,
//! `__accepting`, `__reading`, `close_connection`, `close`, `get_last_rx_age_s`. The
//! accept-timeout poll there is a Python `socket.settimeout(1.0)` soft poll; here it's
//! a non-blocking listener plus a bounded sleep, since `std::net::TcpListener` has no
//! accept-timeout API of its own. The per-connection read timeout maps directly onto
//! `std::net::TcpStream::set_read_timeout`, so the read watchdog needs no separate
//! poll thread: a stalled peer simply makes `read` return `WouldBlock`/`TimedOut`.

use std::io::{self, Read};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use shm_config::SensorContext;
use shm_errors::ConnectionError;
use shm_watchdog::Watchdog;
use tracing::{debug, info, warn};

use crate::events::SocketEvents;
use crate::join::join_with_timeout;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const JOIN_GRACE: Duration = Duration::from_secs(2);

/// State shared between the owning [`SocketServer`] and its background threads. Every
/// field is an `Arc`, so cloning `Shared` is cheap and gives a thread its own handle.
#[derive(Clone)]
struct Shared {
    events: Arc<dyn SocketEvents>,
    running: Arc<AtomicBool>,
    reading: Arc<AtomicBool>,
    last_rx_ms: Arc<AtomicU64>,
    client: Arc<Mutex<Option<TcpStream>>>,
    reader_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    accept_watchdog: Arc<Watchdog>,
    last_accept_notify: Arc<Mutex<Option<Instant>>>,
}

/// Single-listener TCP server: one accepter thread handing connections off to a
/// per-connection reader thread, an accept watchdog (armed only once the owner
/// commands sampling to start) and a per-connection read timeout.
///
/// Accepts one client at a time; a new connection simply replaces the previous reader.
/// Forwards every non-empty read to [`SocketEvents::on_data_received`] and every
/// fault — accept timeout, read timeout, peer close, I/O error — to
/// [`SocketEvents::on_error`]. The event sink is supplied at [`SocketServer::open`]
/// time rather than construction, mirroring the original's own two-phase
/// `SocketServer()` / `.on_data_received = ...` / `.open()` sequence — useful when the
/// sink (e.g. a `Node`) needs a handle to this server to exist before it can be built.
pub struct SocketServer {
    host: String,
    port: u16,
    read_timeout: Duration,
    rx_chunk: usize,
    running: Arc<AtomicBool>,
    reading: Arc<AtomicBool>,
    last_rx_ms: Arc<AtomicU64>,
    client: Arc<Mutex<Option<TcpStream>>>,
    reader_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    accept_watchdog: Arc<Watchdog>,
    last_accept_notify: Arc<Mutex<Option<Instant>>>,
    accepter: Option<JoinHandle<()>>,
}

impl SocketServer {
    /// Build a server bound to `ctx`'s host/port, with `ctx`'s accept/read timeouts.
    /// Does not bind or spawn any thread until [`SocketServer::open`] is called.
    #[must_use]
    pub fn new(ctx: &SensorContext) -> Self {
        Self {
            host: ctx.host.clone(),
            port: ctx.port,
            read_timeout: ctx.read_timeout,
            rx_chunk: ctx.rx_chunk.max(1),
            running: Arc::new(AtomicBool::new(false)),
            reading: Arc::new(AtomicBool::new(false)),
            last_rx_ms: Arc::new(AtomicU64::new(0)),
            client: Arc::new(Mutex::new(None)),
            reader_handle: Arc::new(Mutex::new(None)),
            accept_watchdog: Arc::new(Watchdog::new(ctx.accept_timeout)),
            last_accept_notify: Arc::new(Mutex::new(None)),
            accepter: None,
        }
    }

    /// Bind the listener, wire `events` as the data/fault sink, and spawn the
    /// accepter thread. The accept watchdog stays disarmed until
    /// [`SocketServer::enable_accept_watchdog`] is called.
    pub fn open(&mut self, events: Arc<dyn SocketEvents>) -> Result<(), ConnectionError> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).map_err(ConnectionError::Io)?;
        listener.set_nonblocking(true).map_err(ConnectionError::Io)?;

        self.running.store(true, Ordering::Release);

        let shared = Shared {
            events,
            running: Arc::clone(&self.running),
            reading: Arc::clone(&self.reading),
            last_rx_ms: Arc::clone(&self.last_rx_ms),
            client: Arc::clone(&self.client),
            reader_handle: Arc::clone(&self.reader_handle),
            accept_watchdog: Arc::clone(&self.accept_watchdog),
            last_accept_notify: Arc::clone(&self.last_accept_notify),
        };
        let accept_timeout = self.accept_watchdog.timeout();
        let read_timeout = self.read_timeout;
        let rx_chunk = self.rx_chunk;
        let running = Arc::clone(&self.running);

        self.accepter = thread::Builder::new()
            .name("socket-accepter".to_string())
            .spawn(move || accept_loop(&listener, &shared, accept_timeout, read_timeout, rx_chunk))
            .map_or_else(
                |err| {
                    warn!(error = %err, "failed to spawn accepter thread");
                    running.store(false, Ordering::Release);
                    None
                },
                Some,
            );

        Ok(())
    }

    /// Arm the accept watchdog. Called once the owner has commanded sampling to
    /// start; before that, a client not yet connecting is expected, not a fault.
    pub fn enable_accept_watchdog(&self) {
        self.accept_watchdog.arm();
    }

    /// Disarm the accept watchdog, e.g. while intentionally idle between sessions.
    pub fn disable_accept_watchdog(&self) {
        self.accept_watchdog.disarm();
    }

    /// Close the current client connection (if any) to unblock the reader thread,
    /// without tearing down the listener. Mirrors `close_connection` in the original:
    /// used on a recoverable fault where the listener should stay up for a
    /// reconnect.
    pub fn close_connection(&self) {
        if let Some(stream) = self.client.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Full shutdown: stop the listener and both threads. Idempotent — a second call
    /// on an already-closed server is a no-op.
    ///
    /// Order: (1) clear the running flag; (2) close the client socket, unblocking a
    /// reader parked in `read`; (3) join the reader; (4) join the accepter. The
    /// accepter needs no explicit unblock step — it never blocks longer than
    /// [`ACCEPT_POLL_INTERVAL`], so it observes the cleared running flag on its own.
    pub fn close(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.close_connection();

        if let Some(reader) = self.reader_handle.lock().take() {
            join_with_timeout(reader, JOIN_GRACE, "socket-reader");
        }
        if let Some(accepter) = self.accepter.take() {
            join_with_timeout(accepter, JOIN_GRACE, "socket-accepter");
        }

        self.accept_watchdog.disarm();
    }

    /// Whether the server is currently open (listener bound, accepter running).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether a reader thread currently holds an accepted connection.
    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Seconds since the last non-empty read, or `None` if nothing has been received
    /// yet this session.
    #[must_use]
    pub fn last_rx_age_s(&self) -> Option<f64> {
        let last = self.last_rx_ms.load(Ordering::Acquire);
        if last == 0 {
            return None;
        }
        let now = wall_clock_ms();
        Some(now.saturating_sub(last) as f64 / 1000.0)
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        if self.is_running() {
            self.close();
        }
    }
}

fn accept_loop(listener: &TcpListener, shared: &Shared, accept_timeout: Duration, read_timeout: Duration, rx_chunk: usize) {
    info!("socket accepter started");
    while shared.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "client connected");
                shared.accept_watchdog.heartbeat();

                if let Err(err) = stream.set_nodelay(true) {
                    warn!(error = %err, peer = %addr, "failed to set TCP_NODELAY on accepted connection");
                }

                let cloned = stream.try_clone().ok();
                *shared.client.lock() = cloned;

                let reader_shared = shared.clone();
                let handle = thread::Builder::new()
                    .name("socket-reader".to_string())
                    .spawn(move || read_loop(stream, &reader_shared, read_timeout, rx_chunk));
                match handle {
                    Ok(h) => *shared.reader_handle.lock() = Some(h),
                    Err(err) => warn!(error = %err, "failed to spawn reader thread"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
                maybe_notify_accept_timeout(shared, accept_timeout);
            }
            Err(e) => {
                shared.events.on_error(ConnectionError::Io(e));
                break;
            }
        }
    }
    info!("socket accepter stopped");
}

fn maybe_notify_accept_timeout(shared: &Shared, accept_timeout: Duration) {
    let no_client = shared.client.lock().is_none();
    let no_reader = !shared.reading.load(Ordering::Acquire);
    if !(no_client && no_reader && shared.accept_watchdog.is_expired()) {
        return;
    }

    let mut last = shared.last_accept_notify.lock();
    let should_notify = last.map_or(true, |t| t.elapsed() >= accept_timeout);
    if should_notify {
        *last = Some(Instant::now());
        shared.events.on_error(ConnectionError::AcceptTimeout);
    }
}

fn read_loop(mut stream: TcpStream, shared: &Shared, read_timeout: Duration, rx_chunk: usize) {
    if let Err(err) = stream.set_read_timeout(Some(read_timeout)) {
        warn!(error = %err, "failed to set read timeout on accepted socket");
    }
    shared.reading.store(true, Ordering::Release);
    info!("socket reader started");

    let mut buf = vec![0_u8; rx_chunk];
    loop {
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        match stream.read(&mut buf) {
            Ok(0) => {
                shared.events.on_error(ConnectionError::PeerClosed);
                break;
            }
            Ok(n) => {
                let ts_ms = wall_clock_ms();
                shared.last_rx_ms.store(ts_ms, Ordering::Release);
                shared.events.on_data_received(&buf[..n], ts_ms);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                shared.events.on_error(ConnectionError::ReadTimeout);
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                shared.events.on_error(ConnectionError::Io(e));
                break;
            }
        }
    }

    shared.reading.store(false, Ordering::Release);
    *shared.client.lock() = None;
    shared.accept_watchdog.heartbeat();
    info!("socket reader stopped");
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream as ClientStream;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingEvents {
        data: StdMutex<Vec<Vec<u8>>>,
        errors: StdMutex<Vec<String>>,
    }

    impl SocketEvents for RecordingEvents {
        fn on_data_received(&self, data: &[u8], _rx_ts_ms: u64) {
            self.data.lock().expect("lock").push(data.to_vec());
        }
        fn on_error(&self, error: ConnectionError) {
            self.errors.lock().expect("lock").push(error.to_string());
        }
    }

    fn test_ctx(port: u16) -> SensorContext {
        SensorContext {
            uuid: "uuid-1".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            board_ip: "localhost".to_string(),
            board_port: 1105,
            board_wdt: Duration::from_secs(15),
            accept_timeout: Duration::from_millis(150),
            read_timeout: Duration::from_millis(150),
            first_packet_timeout: Duration::from_secs(6),
            header_only: false,
            data_filtered: false,
            enable_header_crc32: false,
            header_crc_strict: true,
            ts_unit: shm_protocol::TsUnit::Auto,
            ts_future_slack_ms: 2000,
            ts_backstep_tol_ms: None,
            ts_check_enabled: true,
            ts_drop_on_violation: false,
            ts_header_drop_on_violation: false,
            file_duration: Duration::from_secs(300),
            data_dir: std::env::temp_dir(),
            log_dir: std::env::temp_dir(),
            run_dir: std::env::temp_dir(),
            packet_queue_max: 200,
            packet_buffer_max: 4 * 1024 * 1024,
            rx_chunk: 64,
            event_pre_ms: 30_000,
            event_post_ms: 45_000,
            supervisor_enabled: true,
            auto_restart_on_timeout: true,
            allow_unregistered: false,
        }
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        listener.local_addr().expect("local addr").port()
    }

    #[test]
    fn accepts_and_forwards_data() {
        let port = free_port();
        let events = Arc::new(RecordingEvents::default());
        let mut server = SocketServer::new(&test_ctx(port));
        server.open(events.clone()).expect("open");

        thread::sleep(Duration::from_millis(50));
        let mut client = ClientStream::connect(("127.0.0.1", port)).expect("connect");
        client.write_all(b"hello").expect("write");

        thread::sleep(Duration::from_millis(200));
        assert_eq!(events.data.lock().expect("lock").as_slice(), [b"hello".to_vec()].as_slice());

        server.close();
        assert!(!server.is_running());
    }

    #[test]
    fn peer_close_notifies_connection_closed() {
        let port = free_port();
        let events = Arc::new(RecordingEvents::default());
        let mut server = SocketServer::new(&test_ctx(port));
        server.open(events.clone()).expect("open");

        thread::sleep(Duration::from_millis(50));
        let client = ClientStream::connect(("127.0.0.1", port)).expect("connect");
        drop(client);

        thread::sleep(Duration::from_millis(300));
        let errors = events.errors.lock().expect("lock");
        assert!(errors.iter().any(|e| e == "Connection closed by the client"));

        drop(errors);
        server.close();
    }

    #[test]
    fn read_timeout_notifies_and_clears_client() {
        let port = free_port();
        let events = Arc::new(RecordingEvents::default());
        let mut server = SocketServer::new(&test_ctx(port));
        server.open(events.clone()).expect("open");

        thread::sleep(Duration::from_millis(50));
        let _client = ClientStream::connect(("127.0.0.1", port)).expect("connect");

        thread::sleep(Duration::from_millis(400));
        let errors = events.errors.lock().expect("lock");
        assert!(errors.iter().any(|e| e == "Timeout while reading data"));
        drop(errors);

        assert!(!server.is_reading());
        server.close();
    }

    #[test]
    fn accept_watchdog_fires_only_once_per_timeout_window() {
        let port = free_port();
        let events = Arc::new(RecordingEvents::default());
        let mut server = SocketServer::new(&test_ctx(port));
        server.open(events.clone()).expect("open");
        server.enable_accept_watchdog();

        thread::sleep(Duration::from_millis(1200));
        let errors = events.errors.lock().expect("lock");
        let accept_timeouts = errors.iter().filter(|e| e.as_str() == "Accept timeout: no client connected").count();
        assert!(accept_timeouts <= 2, "expected at most two accept-timeout notifications in the window, got {accept_timeouts}");
        drop(errors);

        server.close();
    }

    #[test]
    fn close_is_idempotent() {
        let port = free_port();
        let events = Arc::new(RecordingEvents::default());
        let mut server = SocketServer::new(&test_ctx(port));
        server.open(events).expect("open");
        server.close();
        server.close();
        assert!(!server.is_running());
    }
}
