//! readerd - reading device camera daemon
//!
//! This daemon:
//! 1. Loads `ReaderConfig` (READER_CONFIG file plus READER_* overrides)
//! 2. Opens the capture device and the page light
//! 3. Runs the capture loop until Ctrl-C or `--frames`
//! 4. Logs events and writes OCR snapshots as JPEG when asked to

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use reader_vision::{CameraEvent, CameraHandle, PreviewFrame, ReaderConfig};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Camera acquisition and vision core for the reading device"
)]
struct Args {
    /// Capture device (`stub://...` for the simulated sensor).
    /// Overrides READER_DEVICE and the config file.
    #[arg(long)]
    device: Option<String>,

    /// Stop after this many captured frames.
    #[arg(long)]
    frames: Option<u64>,

    /// Interpret hand motion over the page as gestures.
    #[arg(long)]
    gestures: bool,

    /// Write every OCR snapshot into this directory as JPEG.
    #[arg(long, env = "READER_SNAPSHOT_DIR")]
    snapshot_dir: Option<PathBuf>,

    /// Request a snapshot whenever the reader becomes ready.
    #[arg(long)]
    auto_snapshot: bool,

    /// Seconds between statistics log lines (0 disables them).
    #[arg(long, default_value_t = 10)]
    stats_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = ReaderConfig::load()?;
    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if let Some(dir) = &args.snapshot_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
    }
    log::info!(
        "readerd {} starting on {} (light {})",
        env!("CARGO_PKG_VERSION"),
        config.device,
        config.illumination
    );

    let mut camera = reader_vision::build_camera(&config)?;
    let handle = camera.handle();
    if args.gestures {
        handle.set_gestures_enabled(true);
    }
    let events = camera
        .take_events()
        .context("camera event channel already taken")?;
    let consumer = spawn_consumer(events, handle, args.snapshot_dir.clone(), args.auto_snapshot)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_flag.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let stats_every = Duration::from_secs(args.stats_secs);
    let mut last_stats = Instant::now();
    let result = loop {
        if stop.load(Ordering::SeqCst) {
            log::info!("shutdown signal received");
            break Ok(());
        }
        if args
            .frames
            .is_some_and(|max| camera.stats().frames_captured >= max)
        {
            break Ok(());
        }
        match camera.tick() {
            Ok(Some(event)) => camera.publish(event),
            Ok(None) => {}
            Err(err) => break Err(err),
        }
        if !stats_every.is_zero() && last_stats.elapsed() >= stats_every {
            last_stats = Instant::now();
            let stats = camera.stats();
            log::info!(
                "stats: state {:?}, {} frames, {} skipped, {} snapshots, {} gestures",
                camera.state(),
                stats.frames_captured,
                stats.frames_skipped,
                stats.snapshots,
                stats.gestures
            );
        }
    };

    camera.shutdown()?;
    drop(camera);
    if consumer.join().is_err() {
        log::warn!("event consumer panicked");
    }
    result.context("capture loop failed")
}

fn spawn_consumer(
    events: Receiver<CameraEvent>,
    handle: CameraHandle,
    snapshot_dir: Option<PathBuf>,
    auto_snapshot: bool,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("readerd-events".to_string())
        .spawn(move || {
            let mut snapshots = 0u64;
            for event in events {
                match event {
                    CameraEvent::ShowPreviewFrame(frame) => {
                        let (width, height) = match &frame {
                            PreviewFrame::Grey(grey) => (grey.width, grey.height),
                            PreviewFrame::Color(color) => (color.width, color.height),
                        };
                        log::trace!("preview {}x{}", width, height);
                    }
                    CameraEvent::StartOcr(image) => {
                        snapshots += 1;
                        log::info!("OCR snapshot {} ({}x{})", snapshots, image.width, image.height);
                        if let Some(dir) = &snapshot_dir {
                            let path = dir.join(format!("snapshot-{:05}.jpg", snapshots));
                            match image.save_jpeg(&path) {
                                Ok(()) => log::info!("snapshot written to {}", path.display()),
                                Err(err) => log::warn!("snapshot export failed: {:#}", err),
                            }
                        }
                    }
                    CameraEvent::ReaderReady => {
                        log::info!("reader ready");
                        if auto_snapshot {
                            handle.request_snapshot();
                        }
                    }
                    other => log::info!("event: {:?}", other),
                }
            }
        })
        .context("spawn event consumer")
}
