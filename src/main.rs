use anyhow::{Result, anyhow, bail};
use byteorder::{BigEndian, WriteBytesExt};
use clap::{Parser, Subcommand};
use log::{debug, info, warn, error};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use telemetry_node::config::SystemConfig;
use telemetry_node::controller::TelemetryController;
use telemetry_node::counter::{FileStore, FrameCounterStore};
use telemetry_node::geo::{format_latitude, format_longitude, parse_latitude, parse_longitude};
use telemetry_node::lorawan::{FrameBuilder, parse_frame};
use telemetry_node::payload::{Record, decode_payload};
use telemetry_node::status::NodeStatus;
use telemetry_node::traits::{GpsSource, Radio, SampleHandler, SensorFeed};
use telemetry_node::types::{GpsFix, GpsReading, SensorSample};
use telemetry_node::uplink::UplinkSender;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides storage.state_dir from the config
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// JSON-lines GPS replay, one fix (or null) per poll
    #[arg(long)]
    gps_replay: Option<PathBuf>,

    /// JSON-lines sensor replay, one broadcast per scan window
    #[arg(long)]
    sensor_replay: Option<PathBuf>,

    /// UDP endpoint of the radio bridge
    #[arg(long, default_value = "127.0.0.1:1700")]
    radio_addr: String,

    /// Write the status snapshot here as JSON
    #[arg(long)]
    status_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the telemetry loop (default)
    Run,
    /// Reset the persisted uplink frame counter to zero
    ResetCounter,
    /// Decode an application payload, or a full uplink frame with --frame
    Decode {
        hex: String,

        /// Input is a PHY payload: verify the MIC and decrypt with the session keys
        #[arg(long, default_value_t = false)]
        frame: bool,

        /// Full 32-bit frame counter; defaults to the 16 bits carried in the header
        #[arg(long)]
        fcnt: Option<u32>,
    },
}

// ============================================================================
// Replay collaborators
// ============================================================================

/// Fix as rendered by the receiver library: hemisphere strings for coordinates.
#[derive(Debug, Deserialize)]
struct ReplayFix {
    epoch_time: u32,
    latitude: String,
    longitude: String,
    #[serde(default)]
    altitude: f64,
    satellites_in_use: u8,
    hdop: f64,
}

impl ReplayFix {
    fn into_fix(self) -> Result<GpsFix> {
        Ok(GpsFix {
            epoch_time: self.epoch_time,
            latitude: parse_latitude(&self.latitude)?,
            longitude: parse_longitude(&self.longitude)?,
            altitude: self.altitude,
            satellites_in_use: self.satellites_in_use,
            hdop: self.hdop,
        })
    }
}

fn read_lines(path: &Path) -> Result<VecDeque<String>> {
    let file = File::open(path).map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;
    let mut lines = VecDeque::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push_back(line);
        }
    }
    Ok(lines)
}

struct ReplayGps {
    lines: VecDeque<String>,
    current: GpsReading,
}

impl ReplayGps {
    fn open(path: Option<&Path>) -> Result<Self> {
        let lines = match path {
            Some(p) => read_lines(p)?,
            None => VecDeque::new(),
        };
        info!("[GPS] Replay source with {} records", lines.len());
        Ok(ReplayGps { lines, current: GpsReading::NoFix })
    }
}

impl GpsSource for ReplayGps {
    fn read_pending(&mut self) -> Result<()> {
        let line = match self.lines.pop_front() {
            Some(l) => l,
            None => {
                self.current = GpsReading::NoFix;
                return Ok(());
            }
        };
        let parsed: Option<ReplayFix> = serde_json::from_str(&line)
            .map_err(|e| anyhow!("Bad GPS replay line '{}': {}", line, e))?;
        self.current = match parsed {
            Some(fix) => GpsReading::Valid(fix.into_fix()?),
            None => GpsReading::NoFix,
        };
        Ok(())
    }

    fn current_fix(&self) -> GpsReading {
        self.current
    }
}

#[derive(Debug, Deserialize)]
struct ReplaySample {
    temperature: f64,
    humidity: f64,
    pressure: f64,
}

/// Delivers broadcasts from a worker thread, the way a scan callback fires
/// outside the main loop.
struct ReplaySensors {
    lines: Arc<Mutex<VecDeque<String>>>,
    handler: Arc<Mutex<Option<SampleHandler>>>,
    worker: Option<JoinHandle<()>>,
}

impl ReplaySensors {
    fn open(path: Option<&Path>) -> Result<Self> {
        let lines = match path {
            Some(p) => read_lines(p)?,
            None => VecDeque::new(),
        };
        info!("[Sensors] Replay source with {} broadcasts", lines.len());
        Ok(ReplaySensors {
            lines: Arc::new(Mutex::new(lines)),
            handler: Arc::new(Mutex::new(None)),
            worker: None,
        })
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("[Sensors] Scan worker panicked");
            }
        }
    }
}

impl SensorFeed for ReplaySensors {
    fn on_sample(&mut self, handler: SampleHandler) {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = Some(handler);
        }
    }

    fn scan(&mut self) -> Result<()> {
        self.join_worker();

        let lines = self.lines.clone();
        let handler = self.handler.clone();
        self.worker = Some(thread::spawn(move || {
            let line = match lines.lock().ok().and_then(|mut l| l.pop_front()) {
                Some(l) => l,
                None => return,
            };
            match serde_json::from_str::<ReplaySample>(&line) {
                Ok(s) => {
                    if let Ok(mut slot) = handler.lock() {
                        if let Some(h) = slot.as_mut() {
                            h(SensorSample::new(s.temperature, s.humidity, s.pressure));
                        }
                    }
                }
                Err(e) => warn!("[Sensors] Ignoring malformed broadcast '{}': {}", line, e),
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.join_worker();
        Ok(())
    }
}

/// Forwards frames to a packet-forwarder style bridge as
/// `channel_khz (u32 BE) | PHY payload`.
struct UdpRadio {
    socket: UdpSocket,
    target: String,
    channel_khz: u32,
}

impl UdpRadio {
    fn new(target: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        info!("[Radio] Bridge target {}", target);
        Ok(UdpRadio { socket, target: target.to_string(), channel_khz: 0 })
    }
}

impl Radio for UdpRadio {
    fn configure(&mut self, channel_khz: u32) -> Result<()> {
        self.channel_khz = channel_khz;
        debug!("[Radio] Tuned to {} kHz", channel_khz);
        Ok(())
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        if self.channel_khz == 0 {
            bail!("radio not configured");
        }
        let mut datagram = Vec::with_capacity(4 + frame.len());
        datagram.write_u32::<BigEndian>(self.channel_khz)?;
        datagram.extend_from_slice(frame);
        let sent = self.socket.send_to(&datagram, &self.target)?;
        if sent != datagram.len() {
            bail!("short datagram: {} of {} bytes", sent, datagram.len());
        }
        Ok(())
    }
}

// ============================================================================
// Commands
// ============================================================================

fn load_config(args: &Args) -> Result<SystemConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let c = SystemConfig::load(path)?;
            info!("Loaded config from {}", path.display());
            c
        }
        None => {
            info!("No config file given, using defaults");
            SystemConfig::default()
        }
    };
    if let Some(dir) = &args.state_dir {
        config.storage.state_dir = dir.display().to_string();
    }
    config.validate()?;
    Ok(config)
}

fn write_status(path: &Path, status: &Arc<RwLock<NodeStatus>>) {
    let json = match status.read() {
        Ok(s) => serde_json::to_string_pretty(&*s),
        Err(_) => return,
    };
    match json {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("Failed to write status file {}: {}", path.display(), e);
            }
        }
        Err(e) => warn!("Failed to serialize status: {}", e),
    }
}

fn log_status(status: &Arc<RwLock<NodeStatus>>) {
    if let Ok(s) = status.read() {
        info!(
            "[Status] fcnt={} samples={} (dropped {}) positions={} window={} next send in {}s",
            s.frame_counter, s.pending_samples, s.dropped_samples,
            s.pending_positions, s.track_window_len, s.secs_to_next_send
        );
    }
}

fn run(args: &Args, config: SystemConfig) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let keys = config.session.keys()?;
    let store = FileStore::open(&config.storage.state_dir)?;
    let radio = UdpRadio::new(&args.radio_addr)?;
    let uplink = UplinkSender::new(
        FrameBuilder::new(keys, config.session.fport),
        radio,
        FrameCounterStore::new(store),
    );

    let gps = ReplayGps::open(args.gps_replay.as_deref())?;
    let sensors = ReplaySensors::open(args.sensor_replay.as_deref())?;

    let status = Arc::new(RwLock::new(NodeStatus::default()));
    let tick = config.schedule.tick();
    let mut controller = TelemetryController::new(gps, sensors, uplink, status.clone(), config, Instant::now());

    info!("Starting telemetry loop...");
    let mut last_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        if let Err(e) = controller.process_tick(Instant::now()) {
            warn!("Error in loop: {}", e);
        }

        if last_log.elapsed() >= Duration::from_secs(10) {
            log_status(&status);
            if let Some(path) = &args.status_file {
                write_status(path, &status);
            }
            last_log = Instant::now();
        }

        thread::sleep(tick);
    }

    controller.shutdown();
    if let Some(path) = &args.status_file {
        write_status(path, &status);
    }
    info!("Exiting.");
    Ok(())
}

fn reset_counter(config: &SystemConfig) -> Result<()> {
    let store = FileStore::open(&config.storage.state_dir)?;
    let mut counter = FrameCounterStore::new(store);
    let previous = counter.load();
    counter.reset()?;
    info!("Frame counter reset (was {})", previous);
    Ok(())
}

fn decode_hex(value: &str) -> Result<Vec<u8>> {
    let digits: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            let pair = digits.get(i..i + 2).ok_or_else(|| anyhow!("not ASCII hex"))?;
            u8::from_str_radix(pair, 16).map_err(|e| anyhow!("invalid hex '{}': {}", pair, e))
        })
        .collect()
}

fn decode(config: &SystemConfig, hex: &str, frame: bool, fcnt: Option<u32>) -> Result<()> {
    let mut bytes = decode_hex(hex)?;

    if frame {
        let parsed = parse_frame(&bytes)?;
        let fc = fcnt.unwrap_or(parsed.fcnt16 as u32);
        let builder = FrameBuilder::new(config.session.keys()?, config.session.fport);
        bytes = builder.open(&bytes, fc)?;
        println!("Frame: fcnt={} fport={} MIC ok", fc, parsed.fport);
    }

    for record in decode_payload(&bytes)? {
        match record {
            Record::Environmental(env) => {
                println!("Environmental: {} samples", env.sample_count);
                for (name, s) in [("temperature", env.temperature), ("humidity", env.humidity), ("pressure", env.pressure)] {
                    println!(
                        "  {:<12} max={:.3} min={:.3} mean={:.3} stdev={:.3}",
                        name, s.max, s.min, s.mean, s.stdev
                    );
                }
            }
            Record::Gps(gps) => {
                match gps.first_epoch {
                    Some(epoch) => {
                        let when = chrono::DateTime::from_timestamp(epoch as i64, 0)
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| epoch.to_string());
                        println!("GPS: {} positions from {}", gps.positions.len(), when);
                    }
                    None => println!("GPS: no positions"),
                }
                for (lat, lon) in gps.positions {
                    println!("  {} {}", format_latitude(lat), format_longitude(lon));
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    match &args.command {
        None | Some(Command::Run) => run(&args, config),
        Some(Command::ResetCounter) => reset_counter(&config),
        Some(Command::Decode { hex, frame, fcnt }) => decode(&config, hex, *frame, *fcnt),
    }
}
