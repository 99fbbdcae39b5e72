//! The sensor node: lifecycle state machine, fault recovery and supervisor loop.
//!
//! Grounded in `original_source/.../node.py`'s `Node` class. `start`/`stop`/`restart`
//! follow its step order and sleeps; `on_error`'s message-pattern recovery becomes an
//! exhaustive [`FaultKind`] match instead of `msg.lower().startswith(...)` string
//! matching. The supervisor drops the original's redundant self-locking (there, the
//! supervisor thread holds the start lock across its own call to `start()`, which then
//! fails to reacquire that same non-reentrant lock and returns immediately — making
//! supervisor-driven restarts a no-op after the first attempt); here the supervisor
//! calls [`Node::start`] directly and relies on its own internal guard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use shm_config::SensorContext;
use shm_errors::ConnectionError;
use shm_packet_handler::PacketHandler;
use shm_socket_server::{SocketEvents, SocketServer};
use shm_watchdog::{spawn_poll_thread, Watchdog};
use tracing::{debug, info, warn};

use crate::board::BoardControl;
use crate::status::StatusSink;

const FIRST_PACKET_POLL_INTERVAL: Duration = Duration::from_millis(200);
const SOCKET_SERVER_RETRY_CAP: Duration = Duration::from_secs(30);
const WATCHDOG_RECOVERY_PAUSE: Duration = Duration::from_millis(200);
const RESTART_PRE_RESET_PAUSE: Duration = Duration::from_secs(5);
const RESTART_POST_RESET_PAUSE: Duration = Duration::from_secs(10);
const STOP_SETTLE_PAUSE: Duration = Duration::from_millis(50);

/// Classification of a node-level fault, replacing the original's message-prefix
/// matching with an exhaustive match over [`ConnectionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultKind {
    FirstPacketTimeout,
    ReadTimeout,
    AcceptTimeout,
    Other,
}

impl From<&ConnectionError> for FaultKind {
    fn from(error: &ConnectionError) -> Self {
        match error {
            ConnectionError::FirstPacketTimeout { .. } => Self::FirstPacketTimeout,
            ConnectionError::ReadTimeout => Self::ReadTimeout,
            ConnectionError::AcceptTimeout => Self::AcceptTimeout,
            ConnectionError::PeerClosed | ConnectionError::Io(_) => Self::Other,
        }
    }
}

/// Bridges [`SocketEvents`] callbacks back to the owning [`Node`] through a weak
/// reference, avoiding a reference cycle (`Node` holds the `SocketServer`, which would
/// otherwise hold an `Arc<Node>` back).
struct NodeEvents(Weak<Node>);

impl SocketEvents for NodeEvents {
    fn on_data_received(&self, data: &[u8], rx_ts_ms: u64) {
        if let Some(node) = self.0.upgrade() {
            node.on_data_received(data, rx_ts_ms);
        }
    }

    fn on_error(&self, error: ConnectionError) {
        if let Some(node) = self.0.upgrade() {
            node.on_connection_error(&error);
        }
    }
}

/// Sensor node: owns the socket server and packet handler, drives the board through
/// [`BoardControl`], and recovers from connection faults per §4.8's recovery table.
pub struct Node {
    uuid: String,
    sensor_host: String,
    sensor_port: u16,
    header_only: bool,
    board_wdt: Duration,
    first_packet_timeout: Duration,
    auto_restart_on_timeout: bool,

    board: Arc<dyn BoardControl>,
    status: Arc<dyn StatusSink>,

    socket_server: Mutex<SocketServer>,
    packet_handler: Mutex<PacketHandler>,

    running: AtomicBool,
    start_lock: Mutex<()>,
    shutting_down: AtomicBool,

    rx_watchdog: Arc<Watchdog>,
    rx_watchdog_shutdown: Mutex<Arc<AtomicBool>>,
    rx_watchdog_handle: Mutex<Option<JoinHandle<()>>>,

    supervisor_shutdown: Arc<AtomicBool>,
    supervisor_handle: Mutex<Option<JoinHandle<()>>>,

    self_weak: Weak<Node>,
}

impl Node {
    /// Build a node around `packet_handler`, opening the socket server (retrying with
    /// exponential backoff, capped at 30 s, on bind failure) and starting the
    /// supervisor loop if `ctx.supervisor_enabled`.
    #[must_use]
    pub fn new(
        ctx: &SensorContext,
        board: Arc<dyn BoardControl>,
        status: Arc<dyn StatusSink>,
        packet_handler: PacketHandler,
    ) -> Arc<Self> {
        let uuid = ctx.uuid.clone();
        let sensor_host = ctx.host.clone();
        let sensor_port = ctx.port;
        let header_only = ctx.header_only;
        let board_wdt = ctx.board_wdt;
        let first_packet_timeout = ctx.first_packet_timeout;
        let auto_restart_on_timeout = ctx.auto_restart_on_timeout;
        let supervisor_enabled = ctx.supervisor_enabled;

        Arc::new_cyclic(|weak| {
            let events: Arc<dyn SocketEvents> = Arc::new(NodeEvents(weak.clone()));
            let socket_server = open_socket_server_with_retry(ctx, events);

            let supervisor_shutdown = Arc::new(AtomicBool::new(false));
            let supervisor_handle = if supervisor_enabled {
                spawn_supervisor(weak.clone(), Arc::clone(&supervisor_shutdown))
            } else {
                None
            };

            Self {
                uuid,
                sensor_host,
                sensor_port,
                header_only,
                board_wdt,
                first_packet_timeout,
                auto_restart_on_timeout,
                board,
                status,
                socket_server: Mutex::new(socket_server),
                packet_handler: Mutex::new(packet_handler),
                running: AtomicBool::new(false),
                start_lock: Mutex::new(()),
                shutting_down: AtomicBool::new(false),
                rx_watchdog: Arc::new(Watchdog::new(first_packet_timeout)),
                rx_watchdog_shutdown: Mutex::new(Arc::new(AtomicBool::new(false))),
                rx_watchdog_handle: Mutex::new(None),
                supervisor_shutdown,
                supervisor_handle: Mutex::new(supervisor_handle),
                self_weak: weak.clone(),
            }
        })
    }

    /// Whether the node is currently running a sampling session.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start sampling (§4.8's 7-step sequence). Guarded by a non-blocking lock so
    /// concurrent callers (the supervisor, a recovery path, an external caller) never
    /// race; a caller that loses the race simply returns.
    pub fn start(&self) {
        if self.running.load(Ordering::Acquire) {
            return;
        }
        let Some(_guard) = self.start_lock.try_lock() else {
            return;
        };
        if self.running.load(Ordering::Acquire) {
            return;
        }

        if !self.socket_server.lock().is_running() {
            warn!("socket server is not running");
            return;
        }

        info!("starting the sensor node");
        self.publish_status(1, "Starting sensor");
        self.packet_handler.lock().start();

        if let Err(err) = self.board.configure(&self.sensor_host, self.sensor_port) {
            warn!(error = %err, "error while configuring the sensor");
            self.packet_handler.lock().stop();
            return;
        }

        thread::sleep(Duration::from_secs(1));

        self.publish_status(3, "Sampling");
        info!("sensor node is about to run");
        if let Err(err) = self.board.start_sampling(self.header_only) {
            warn!(error = %err, "error while starting the sampling");
            self.publish_status(1, "Starting sensor");
            self.packet_handler.lock().stop();
            return;
        }

        // Only now, after configuration and sampling start both succeed, is the node
        // marked running.
        self.running.store(true, Ordering::Release);
        self.publish_status(3, "Running");

        self.socket_server.lock().enable_accept_watchdog();
        self.arm_first_packet_watchdog();

        info!("sensor node is running");
    }

    /// Stop sampling for good. Idempotent, and terminal: a stopped node is never
    /// restarted automatically again (`shutting_down` latches permanently).
    pub fn stop(&self, msg: &str) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutting_down.store(true, Ordering::Release);

        info!("stopping the sensor node");
        self.publish_status(2, msg);

        self.packet_handler.lock().stop();
        self.cancel_first_packet_watchdog();

        if let Err(err) = self.board.stop_sampling() {
            warn!(error = %err, "error while stopping the sampling");
        }

        {
            let mut server = self.socket_server.lock();
            server.disable_accept_watchdog();
            server.close_connection();
            server.close();
        }

        thread::sleep(STOP_SETTLE_PAUSE);
    }

    /// Restart: stop the handler and connection, pause, reset the board, pause again,
    /// then attempt `start()`.
    fn restart(&self) {
        info!("restarting the sensor node");
        self.packet_handler.lock().stop();
        self.running.store(false, Ordering::Release);
        self.publish_status(2, "Restarting");

        self.socket_server.lock().close_connection();

        thread::sleep(RESTART_PRE_RESET_PAUSE);

        if let Err(err) = self.board.reset() {
            warn!(error = %err, "error while resetting the sensor");
        }

        thread::sleep(RESTART_POST_RESET_PAUSE);
        self.start();
    }

    fn on_connection_error(&self, error: &ConnectionError) {
        warn!(error = %error, "connection error");
        self.handle_fault(FaultKind::from(error), &error.to_string());
    }

    fn handle_fault(&self, kind: FaultKind, msg: &str) {
        match kind {
            FaultKind::FirstPacketTimeout | FaultKind::ReadTimeout | FaultKind::AcceptTimeout => {
                if self.watchdog_recovery() {
                    return;
                }
            }
            FaultKind::Other => {}
        }

        if self.shutting_down.load(Ordering::Acquire) {
            debug!(message = msg, "skip restart: shutting down");
            return;
        }
        self.restart();
    }

    /// Stop sampling, pause, reset the board. Returns `true` if both steps succeeded
    /// (and any configured auto-restart has been scheduled) — matching the original's
    /// `return` inside the `try` block. Returns `false` if either step errored, which
    /// lets the caller fall through to the general `restart()` path exactly as the
    /// original does when its `except` clause doesn't return.
    fn watchdog_recovery(&self) -> bool {
        if let Err(err) = self.board.stop_sampling() {
            warn!(error = %err, "watchdog recovery: stop_sampling failed");
            return false;
        }
        thread::sleep(WATCHDOG_RECOVERY_PAUSE);
        if let Err(err) = self.board.reset() {
            warn!(error = %err, "watchdog recovery: reset failed");
            return false;
        }
        info!("board stop+reset requested due to watchdog fault");

        if self.auto_restart_on_timeout && !self.shutting_down.load(Ordering::Acquire) {
            self.running.store(false, Ordering::Release);
            thread::sleep(self.board_wdt + Duration::from_secs(2));
            self.start();
        }
        true
    }

    fn on_data_received(&self, data: &[u8], rx_ts_ms: u64) {
        self.rx_watchdog.disarm();
        self.packet_handler.lock().push(data.to_vec(), rx_ts_ms);
    }

    fn publish_status(&self, status: i32, message: &str) {
        self.status.publish(status, message, &self.uuid);
    }

    fn arm_first_packet_watchdog(&self) {
        self.cancel_first_packet_watchdog();

        let shutdown = Arc::new(AtomicBool::new(false));
        *self.rx_watchdog_shutdown.lock() = Arc::clone(&shutdown);
        self.rx_watchdog.arm();

        let watchdog = Arc::clone(&self.rx_watchdog);
        let weak = self.self_weak.clone();
        let timeout_s = self.first_packet_timeout.as_secs_f64();

        let handle = spawn_poll_thread(watchdog, FIRST_PACKET_POLL_INTERVAL, shutdown, move || {
            if let Some(node) = weak.upgrade() {
                let error = ConnectionError::first_packet_timeout(timeout_s);
                warn!(error = %error, "first-packet watchdog expired");
                node.handle_fault(FaultKind::FirstPacketTimeout, &error.to_string());
            }
        });
        *self.rx_watchdog_handle.lock() = Some(handle);
    }

    fn cancel_first_packet_watchdog(&self) {
        self.rx_watchdog.disarm();
        self.rx_watchdog_shutdown.lock().store(true, Ordering::Release);
        if let Some(handle) = self.rx_watchdog_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);

        self.supervisor_shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.supervisor_handle.lock().take() {
            let _ = handle.join();
        }

        self.cancel_first_packet_watchdog();

        if self.running.load(Ordering::Acquire) {
            self.stop("Stopped");
        }
    }
}

fn open_socket_server_with_retry(ctx: &SensorContext, events: Arc<dyn SocketEvents>) -> SocketServer {
    let mut backoff = Duration::from_secs(1);
    loop {
        let mut server = SocketServer::new(ctx);
        match server.open(Arc::clone(&events)) {
            Ok(()) => return server,
            Err(err) => {
                warn!(error = %err, backoff_s = backoff.as_secs_f64(), "failed to open socket server, retrying");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(SOCKET_SERVER_RETRY_CAP);
            }
        }
    }
}

fn spawn_supervisor(weak: Weak<Node>, shutdown: Arc<AtomicBool>) -> Option<JoinHandle<()>> {
    thread::Builder::new()
        .name("node-supervisor".to_string())
        .spawn(move || {
            let mut backoff = Duration::from_secs(1);
            while !shutdown.load(Ordering::Acquire) {
                let Some(node) = weak.upgrade() else {
                    break;
                };
                if node.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                if node.running.load(Ordering::Acquire) {
                    drop(node);
                    thread::sleep(Duration::from_secs(1));
                    continue;
                }

                node.start();
                let became_running = node.running.load(Ordering::Acquire);
                drop(node);

                if became_running {
                    backoff = Duration::from_secs(1);
                } else {
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(SOCKET_SERVER_RETRY_CAP);
                }
            }
        })
        .map_or_else(
            |err| {
                warn!(error = %err, "failed to spawn supervisor thread");
                None
            },
            Some,
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{BoardError, BoardInfo, BoardResult};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeBoard {
        stop_calls: AtomicUsize,
        reset_calls: AtomicUsize,
        fail_start: AtomicBool,
    }

    impl BoardControl for FakeBoard {
        fn info(&self) -> BoardResult<BoardInfo> {
            Ok(BoardInfo {
                uuid: "uuid-1".to_string(),
                mac: "aabbccddeeff".to_string(),
                frequency: 200,
                nreports: 10,
                channels: shm_protocol::ChannelMap::parse("11142222").expect("valid map"),
                header_len: 36,
                report_len: 52,
            })
        }
        fn configure(&self, _sensor_host: &str, _sensor_port: u16) -> BoardResult<()> {
            Ok(())
        }
        fn start_sampling(&self, _header_only: bool) -> BoardResult<u64> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(BoardError::Rejected("start sampling".to_string()));
            }
            Ok(0)
        }
        fn stop_sampling(&self) -> BoardResult<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn reset(&self) -> BoardResult<()> {
            self.reset_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingStatus {
        events: StdMutex<Vec<(i32, String)>>,
    }

    impl StatusSink for RecordingStatus {
        fn publish(&self, status: i32, message: &str, _uuid: &str) {
            self.events.lock().expect("lock").push((status, message.to_string()));
        }
    }

    struct NoopSink;
    impl shm_alarm::AlarmSink for NoopSink {
        fn publish_alert(&self, _trigger_ts_ms: u64, _status: i32, _uuid: &str) {}
        fn publish_alert_data(&self, _trigger_ts_ms: u64, _data_ts_ms: u64, _payload_blob: &str, _uuid: &str) {}
    }

    fn test_packet_handler(dir: &std::path::Path) -> PacketHandler {
        let config = shm_packet_handler::FrameProcessorConfig {
            uuid: "uuid-1".to_string(),
            channels: shm_protocol::ChannelMap::parse("11142222").expect("valid map"),
            nreports_default: 10,
            is_filtered: false,
            header_len: 36,
            ts_unit: shm_protocol::TsUnit::Auto,
            header_only_default: false,
            ts_future_slack_ms: 2000,
            ts_backstep_tol_ms: 5,
            ts_check_enabled: true,
            ts_drop_on_violation: false,
            ts_header_drop_on_violation: false,
        };
        let framer_config = shm_framer::FramerConfig::new(36, 52, 10, false, true, 4 * 1024 * 1024)
            .expect("valid framer config");
        let framer = shm_framer::Framer::new(framer_config);
        let alarm = shm_alarm::AlarmEngine::new(200, 45_000);
        let storer = shm_storer::Storer::new("aabbccddeeff", 200, Duration::from_secs(300), dir.to_path_buf());
        let processor = shm_packet_handler::FrameProcessor::new(config, framer, alarm, storer, Arc::new(NoopSink));
        PacketHandler::new(16, processor)
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        listener.local_addr().expect("local addr").port()
    }

    fn test_ctx(port: u16) -> SensorContext {
        SensorContext {
            uuid: "uuid-1".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            board_ip: "localhost".to_string(),
            board_port: 1105,
            board_wdt: Duration::from_millis(200),
            accept_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(10),
            first_packet_timeout: Duration::from_millis(150),
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
            supervisor_enabled: false,
            auto_restart_on_timeout: false,
            allow_unregistered: false,
        }
    }

    #[test]
    fn fault_kind_classifies_connection_errors() {
        assert_eq!(FaultKind::from(&ConnectionError::AcceptTimeout), FaultKind::AcceptTimeout);
        assert_eq!(FaultKind::from(&ConnectionError::ReadTimeout), FaultKind::ReadTimeout);
        assert_eq!(FaultKind::from(&ConnectionError::first_packet_timeout(6.0)), FaultKind::FirstPacketTimeout);
        assert_eq!(FaultKind::from(&ConnectionError::PeerClosed), FaultKind::Other);
    }

    #[test]
    fn start_transitions_to_running_and_publishes_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let port = free_port();
        let ctx = test_ctx(port);
        let board = Arc::new(FakeBoard::default());
        let status = Arc::new(RecordingStatus::default());

        let node = Node::new(&ctx, board, status.clone(), test_packet_handler(dir.path()));
        node.start();

        assert!(node.is_running());
        let events = status.events.lock().expect("lock");
        assert!(events.iter().any(|(s, m)| *s == 1 && m == "Starting sensor"));
        assert!(events.iter().any(|(s, m)| *s == 3 && m == "Running"));
    }

    #[test]
    fn stop_is_idempotent_and_publishes_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let port = free_port();
        let ctx = test_ctx(port);
        let board = Arc::new(FakeBoard::default());
        let status = Arc::new(RecordingStatus::default());

        let node = Node::new(&ctx, board, status.clone(), test_packet_handler(dir.path()));
        node.start();
        assert!(node.is_running());

        node.stop("done");
        node.stop("done");
        assert!(!node.is_running());

        let events = status.events.lock().expect("lock");
        assert!(events.iter().filter(|(s, m)| *s == 2 && m == "done").count() == 1);
    }

    #[test]
    fn failed_start_sampling_keeps_node_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let port = free_port();
        let ctx = test_ctx(port);
        let board = Arc::new(FakeBoard::default());
        board.fail_start.store(true, Ordering::SeqCst);
        let status = Arc::new(RecordingStatus::default());

        let node = Node::new(&ctx, board, status, test_packet_handler(dir.path()));
        node.start();

        assert!(!node.is_running());
    }

    #[test]
    fn first_packet_timeout_drives_watchdog_recovery() {
        let dir = tempfile::tempdir().expect("tempdir");
        let port = free_port();
        let mut ctx = test_ctx(port);
        ctx.first_packet_timeout = Duration::from_millis(100);
        ctx.auto_restart_on_timeout = false;
        let board = Arc::new(FakeBoard::default());
        let status = Arc::new(RecordingStatus::default());

        let node = Node::new(&ctx, Arc::clone(&board) as Arc<dyn BoardControl>, status, test_packet_handler(dir.path()));
        node.start();
        assert!(node.is_running());

        thread::sleep(Duration::from_millis(600));
        assert!(board.stop_calls.load(Ordering::SeqCst) >= 1);
        assert!(board.reset_calls.load(Ordering::SeqCst) >= 1);
    }
}
