//! Bounded queue plus worker thread driving the frame/alarm/storage pipeline.
//!
//! Grounded in `original_source/.../packet.py`'s `PacketHandler` (`add_packet`,
//! `__on_packet_parsing`, `start`/`stop`), expressed with the `Arc<AtomicBool>`
//! running-flag + `JoinHandle` + `Drop` idiom from `openracing-engine::Engine`.

#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod processor;

pub use processor::{FrameProcessor, FrameProcessorConfig};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{info, warn};

const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DROP_LOG_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// One inbound chunk: the raw bytes plus the receive-side timestamp in milliseconds
/// (kernel receive timestamp where available, else local wall-clock — supplied by the
/// socket layer).
type QueueItem = (Vec<u8>, u64);

/// Bounded-queue front end for a [`FrameProcessor`]. `push` never blocks: a full queue
/// drops the newest chunk and logs a throttled warning, trading completeness for
/// real-time freshness on the alarm path.
pub struct PacketHandler {
    sender: Sender<QueueItem>,
    receiver: Receiver<QueueItem>,
    processor: Arc<Mutex<FrameProcessor>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    drop_count: Arc<AtomicU64>,
    last_drop_log: Arc<Mutex<Option<Instant>>>,
}

impl PacketHandler {
    /// Build a new handler around `processor`, with a bounded queue of `queue_capacity`
    /// entries. The worker thread is not started until the first [`PacketHandler::push`]
    /// or an explicit [`PacketHandler::start`].
    #[must_use]
    pub fn new(queue_capacity: usize, processor: FrameProcessor) -> Self {
        let (sender, receiver) = crossbeam::channel::bounded(queue_capacity);
        Self {
            sender,
            receiver,
            processor: Arc::new(Mutex::new(processor)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            drop_count: Arc::new(AtomicU64::new(0)),
            last_drop_log: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the worker thread if it isn't already running.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let receiver = self.receiver.clone();
        let processor = Arc::clone(&self.processor);
        let running = Arc::clone(&self.running);

        self.worker = thread::Builder::new()
            .name("packet-handler".to_string())
            .spawn(move || {
                info!("packet handler worker started");
                while running.load(Ordering::Acquire) {
                    match receiver.recv_timeout(WORKER_POLL_INTERVAL) {
                        Ok((data, _rx_ts_ms)) => {
                            processor.lock().feed(&data);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("packet handler worker stopped");
            })
            .map_or_else(
                |err| {
                    warn!(error = %err, "failed to spawn packet handler worker");
                    self.running.store(false, Ordering::Release);
                    None
                },
                Some,
            );
    }

    /// Enqueue one chunk of received bytes. Drops the chunk (and logs a throttled
    /// warning) if the queue is full. Restarts the worker if it isn't running.
    pub fn push(&mut self, data: Vec<u8>, rx_ts_ms: u64) {
        if data.is_empty() {
            return;
        }

        match self.sender.try_send((data, rx_ts_ms)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.drop_count.fetch_add(1, Ordering::Relaxed) + 1;
                let mut last = self.last_drop_log.lock();
                let should_log = last.map_or(true, |t| t.elapsed() > DROP_LOG_MIN_INTERVAL);
                if should_log {
                    *last = Some(Instant::now());
                    warn!(dropped, "queue full, dropped chunks so far");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("packet handler queue disconnected");
            }
        }

        if !self.running.load(Ordering::Acquire) {
            self.start();
        }
    }

    /// Stop the worker, joining it within a bounded wait. Idempotent.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Whether the worker thread is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Total chunks dropped over this handler's lifetime due to a full queue.
    #[must_use]
    pub fn dropped_chunk_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }
}

impl Drop for PacketHandler {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
