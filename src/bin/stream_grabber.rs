//! stream_grabber - Decode one stream and republish its frames.
//!
//! Opens a session on the engine, polls it, grabs every new frame, optionally halves
//! it and/or reduces it to grey, then publishes it as an image message over MQTT (or
//! to the log when no broker is configured).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rtsp_frame_grabber::republish::dump::FrameDumper;
use rtsp_frame_grabber::republish::{
    FramePublisher, ImageMessage, LogPublisher, MqttPublisher, Processing,
};
use rtsp_frame_grabber::{
    GrabberConfig, Handle, MediaBackend, StreamEngine, StreamStatus, SyntheticBackend,
};

const GRABBER_NAME: &str = "stream_grabber";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Grab frames from an RTSP stream and republish them"
)]
struct Args {
    /// Stream URI (rtsp://..., or stub://... for the synthetic source).
    #[arg(long)]
    uri: Option<String>,

    /// Output width; 0 keeps the stream's native size.
    #[arg(long)]
    width: Option<u32>,

    /// Output height; 0 keeps the stream's native size.
    #[arg(long)]
    height: Option<u32>,

    /// Publish mono8 frames instead of rgb8.
    #[arg(long, env = "GRABBER_GREY")]
    grey: bool,

    /// Halve the frame size with a 2x2 box average.
    #[arg(long, env = "GRABBER_HALF")]
    half: bool,

    /// How often the session status is polled.
    #[arg(long, env = "GRABBER_POLL_INTERVAL_MS", default_value_t = 5)]
    poll_interval_ms: u64,

    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,

    /// Write published frames as PPM/PGM into this directory.
    #[arg(long, env = "GRABBER_DUMP_DIR")]
    dump_dir: Option<PathBuf>,

    /// Dump only every Nth frame.
    #[arg(long, default_value_t = 1)]
    dump_every: u64,

    /// Reopen the stream this long after it fails; 0 exits instead.
    #[arg(long, env = "GRABBER_RECONNECT_DELAY_SECS", default_value_t = 2)]
    reconnect_delay_secs: u64,

    /// MQTT broker address (overrides config).
    #[arg(long)]
    mqtt_addr: Option<String>,
}

struct Grabber<'a, B: MediaBackend> {
    engine: StreamEngine<B>,
    args: &'a Args,
    cfg: &'a GrabberConfig,
    publisher: Box<dyn FramePublisher>,
    dumper: Option<FrameDumper>,
    shutdown: mpsc::Receiver<()>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut cfg = GrabberConfig::load()?;
    if let Some(uri) = &args.uri {
        cfg.stream.uri = uri.clone();
    }
    if let Some(width) = args.width {
        cfg.stream.width = width;
    }
    if let Some(height) = args.height {
        cfg.stream.height = height;
    }
    if let Some(addr) = &args.mqtt_addr {
        cfg.mqtt.addr = Some(addr.clone());
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    let publisher: Box<dyn FramePublisher> = match cfg.mqtt.addr.as_deref() {
        Some(addr) => Box::new(MqttPublisher::connect(
            addr,
            &cfg.mqtt.client_id,
            &cfg.mqtt.topic_prefix,
        )?),
        None => {
            log::info!("{}: no MQTT broker configured, logging frames", GRABBER_NAME);
            Box::new(LogPublisher::default())
        }
    };
    let dumper = match &args.dump_dir {
        Some(dir) => Some(FrameDumper::new(dir, args.dump_every)?),
        None => None,
    };

    if cfg.stream.uri.starts_with("stub://") {
        let engine = StreamEngine::new(SyntheticBackend::new(), cfg.engine.clone());
        return Grabber::new(engine, &args, &cfg, publisher, dumper, rx).run();
    }
    run_ffmpeg(&args, &cfg, publisher, dumper, rx)
}

#[cfg(feature = "rtsp-ffmpeg")]
fn run_ffmpeg(
    args: &Args,
    cfg: &GrabberConfig,
    publisher: Box<dyn FramePublisher>,
    dumper: Option<FrameDumper>,
    shutdown: mpsc::Receiver<()>,
) -> Result<()> {
    let backend = rtsp_frame_grabber::FfmpegBackend::new()?;
    if let Some(level) = cfg.ffmpeg_log_level.as_deref() {
        backend.set_log_level(level)?;
    }
    let engine = StreamEngine::new(backend, cfg.engine.clone());
    Grabber::new(engine, args, cfg, publisher, dumper, shutdown).run()
}

#[cfg(not(feature = "rtsp-ffmpeg"))]
fn run_ffmpeg(
    _args: &Args,
    cfg: &GrabberConfig,
    _publisher: Box<dyn FramePublisher>,
    _dumper: Option<FrameDumper>,
    _shutdown: mpsc::Receiver<()>,
) -> Result<()> {
    anyhow::bail!(
        "'{}' needs the FFmpeg backend; rebuild with --features rtsp-ffmpeg or use a stub:// URI",
        rtsp_frame_grabber::decode::redact_uri(&cfg.stream.uri)
    )
}

impl<'a, B: MediaBackend> Grabber<'a, B> {
    fn new(
        engine: StreamEngine<B>,
        args: &'a Args,
        cfg: &'a GrabberConfig,
        publisher: Box<dyn FramePublisher>,
        dumper: Option<FrameDumper>,
        shutdown: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            engine,
            args,
            cfg,
            publisher,
            dumper,
            shutdown,
        }
    }

    fn run(mut self) -> Result<()> {
        let result = self.grab_loop();
        self.engine.shutdown();
        self.publisher.close()?;
        result
    }

    fn open(&mut self) -> Result<Handle> {
        let stream = &self.cfg.stream;
        let handle = self
            .engine
            .open(&stream.uri, stream.width, stream.height)
            .context("failed to open stream")?;
        Ok(handle)
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.try_recv().is_ok()
    }

    fn grab_loop(&mut self) -> Result<()> {
        let processing = Processing {
            half: self.args.half,
            grey: self.args.grey,
        };
        let poll = Duration::from_millis(self.args.poll_interval_ms.max(1));
        let reconnect_delay = Duration::from_secs(self.args.reconnect_delay_secs);
        let mut handle = self.open()?;
        let mut rgb: Vec<u8> = Vec::new();
        let mut frames: u64 = 0;

        loop {
            if self.stop_requested() {
                log::info!("{}: shutdown signal received", GRABBER_NAME);
                return Ok(());
            }
            match self.engine.status(handle) {
                StreamStatus::NewFrame => {
                    let dimensions = self.engine.frame_dimensions(handle);
                    if rgb.len() != dimensions.byte_len() {
                        log::info!("{}: receiving frames at {}", GRABBER_NAME, dimensions);
                        rgb.resize(dimensions.byte_len(), 0);
                    }
                    let written = self.engine.grab_frame(handle, &mut rgb);
                    if written == 0 {
                        continue;
                    }
                    let message = ImageMessage::from_rgb(&rgb[..written], dimensions, processing);
                    if let Err(e) = self.publisher.publish(&message) {
                        log::warn!("{}: publish failed: {:#}", GRABBER_NAME, e);
                    }
                    if let Some(dumper) = self.dumper.as_mut() {
                        dumper.offer(&message)?;
                    }
                    frames += 1;
                    if self.args.max_frames.is_some_and(|max| frames >= max) {
                        log::info!("{}: reached {} frames", GRABBER_NAME, frames);
                        return Ok(());
                    }
                }
                StreamStatus::Error => {
                    let reason = self
                        .engine
                        .error_kind(handle)
                        .map_or_else(|| "unknown".to_string(), |kind| kind.to_string());
                    log::warn!("{}: stream stopped ({})", GRABBER_NAME, reason);
                    self.engine.close(handle);
                    if reconnect_delay.is_zero() {
                        return Ok(());
                    }
                    if !self.sleep_unless_stopped(reconnect_delay, poll) {
                        return Ok(());
                    }
                    log::info!("{}: reopening stream", GRABBER_NAME);
                    handle = self.open()?;
                }
                StreamStatus::Connecting | StreamStatus::Ok => std::thread::sleep(poll),
            }
        }
    }

    /// Returns false if a shutdown was requested during the wait.
    fn sleep_unless_stopped(&self, delay: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if self.stop_requested() {
                return false;
            }
            std::thread::sleep(poll);
        }
        true
    }
}
