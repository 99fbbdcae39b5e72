//! SHM sensor gateway daemon (`shm-gateway`): loads configuration from the
//! environment, discovers the board's sensor parameters over its console port, wires
//! the frame pipeline together and runs the node until a shutdown signal arrives.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use shm_alarm::{AlarmEngine, AlarmSink};
use shm_config::SensorContext;
use shm_framer::{Framer, FramerConfig};
use shm_node::{BoardControl, ConsoleBoardControl, Node, StatusSink};
use shm_packet_handler::{FrameProcessor, FrameProcessorConfig, PacketHandler};
use shm_protocol::SensorConfig;
use shm_storer::Storer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line surface for the gateway daemon. Every knob that varies per sensor
/// deployment lives in the environment (§6.5); these flags cover operational concerns
/// that don't belong in the environment-variable surface.
#[derive(Debug, Parser)]
#[command(name = "shm-gateway", about = "SHM sensor gateway daemon", version)]
struct Cli {
    /// Discover the board's sensor parameters, log the merged configuration and exit
    /// without starting the node.
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(err) = run(&cli) {
        error!(error = %err, "gateway exited with an error");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let ctx = SensorContext::from_env()?;
    info!(uuid = %ctx.uuid, host = %ctx.host, port = ctx.port, "loaded sensor context");

    let _lock = SingleInstanceLock::acquire(&ctx.run_dir, &ctx.uuid)?;

    let board: Arc<dyn BoardControl> = Arc::new(ConsoleBoardControl::new(ctx.board_ip.clone(), ctx.board_port));
    let board_info = board.info()?;

    if !ctx.allow_unregistered && board_info.uuid != ctx.uuid {
        anyhow::bail!(
            "board-reported UUID {:?} does not match configured SENSOR_UUID {:?} \
             (set SENSOR_ALLOW_UNREGISTERED=1 to bypass for testing)",
            board_info.uuid,
            ctx.uuid
        );
    }

    let config = SensorConfig::new(
        ctx.uuid.clone(),
        board_info.mac.clone(),
        board_info.frequency,
        board_info.nreports,
        board_info.channels.clone(),
        board_info.header_len,
        ctx.ts_unit,
        ctx.data_filtered,
        ctx.header_only,
    )?;
    info!(
        mac = %config.mac,
        frequency = config.frequency,
        nreports_default = config.nreports_default,
        header_len = config.header_len,
        "board discovery complete"
    );

    if cli.dry_run {
        info!("dry run requested, exiting without starting the node");
        return Ok(());
    }

    fs::create_dir_all(&ctx.data_dir)?;
    let packet_handler = build_packet_handler(&ctx, &config)?;
    let status: Arc<dyn StatusSink> = Arc::new(LoggingStatusSink);

    let node = Node::new(&ctx, Arc::clone(&board), status, packet_handler);
    node.start();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_for_handler = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        shutdown_for_handler.store(true, Ordering::SeqCst);
    })?;

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
    }

    node.stop("Stopped: shutdown signal received");
    info!("gateway shut down cleanly");
    Ok(())
}

fn build_packet_handler(ctx: &SensorContext, config: &SensorConfig) -> anyhow::Result<PacketHandler> {
    let framer_config = FramerConfig::new(
        config.header_len,
        config.report_len,
        config.nreports_default,
        ctx.enable_header_crc32,
        ctx.header_crc_strict,
        ctx.packet_buffer_max,
    )?;
    let framer = Framer::new(framer_config);
    let alarm = AlarmEngine::new(config.frequency, ctx.event_post_ms);
    let storer = Storer::new(&config.mac, config.frequency, ctx.file_duration, ctx.data_dir.clone());

    let processor_config = FrameProcessorConfig {
        uuid: config.uuid.clone(),
        channels: config.channels.clone(),
        nreports_default: config.nreports_default,
        is_filtered: config.is_filtered,
        header_len: config.header_len,
        ts_unit: config.ts_unit,
        header_only_default: config.header_only_default,
        ts_future_slack_ms: ctx.ts_future_slack_ms,
        ts_backstep_tol_ms: ctx.resolve_backstep_tol_ms(config.frequency),
        ts_check_enabled: ctx.ts_check_enabled,
        ts_drop_on_violation: ctx.ts_drop_on_violation,
        ts_header_drop_on_violation: ctx.ts_header_drop_on_violation,
    };
    let sink: Arc<dyn AlarmSink> = Arc::new(LoggingAlarmSink);
    let processor = FrameProcessor::new(processor_config, framer, alarm, storer, sink);
    Ok(PacketHandler::new(ctx.packet_queue_max, processor))
}

/// Default [`StatusSink`]: logs every publish. The HTTP status client that would post
/// these to a remote service is an external collaborator (out of scope for the core),
/// so this is the gateway's own placeholder until one is wired in.
struct LoggingStatusSink;

impl StatusSink for LoggingStatusSink {
    fn publish(&self, status: i32, message: &str, uuid: &str) {
        info!(status, message, uuid, "sensor status");
    }
}

/// Default [`AlarmSink`]: logs alerts instead of forwarding them to a remote manager.
struct LoggingAlarmSink;

impl AlarmSink for LoggingAlarmSink {
    fn publish_alert(&self, trigger_ts_ms: u64, status: i32, uuid: &str) {
        warn!(trigger_ts_ms, status, uuid, "alarm alert");
    }

    fn publish_alert_data(&self, trigger_ts_ms: u64, data_ts_ms: u64, payload_blob: &str, uuid: &str) {
        info!(trigger_ts_ms, data_ts_ms, payload_len = payload_blob.len(), uuid, "alarm event data");
    }
}

/// A PID file under `run_dir`, refusing to start a second instance for the same
/// sensor. Removed on drop so a clean shutdown always releases it.
struct SingleInstanceLock {
    path: PathBuf,
}

impl SingleInstanceLock {
    fn acquire(run_dir: &Path, uuid: &str) -> anyhow::Result<Self> {
        fs::create_dir_all(run_dir)?;
        let path = run_dir.join(format!("shm-gateway-{uuid}.pid"));
        if path.exists() {
            anyhow::bail!(
                "lock file {path:?} already exists; another instance for sensor {uuid:?} may be running"
            );
        }
        fs::write(&path, process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for SingleInstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
