mod capture;
mod clock;
mod detection;
mod output;
mod selector;
mod session;

use anyhow::{bail, Context, Result};
use capture::{CaptureDevice, WebcamDevice};
use clap::Parser;
use clock::{StreamClock, SystemClock};
use output::{OutputQueue, OutputSink, ProducerConfig, V4L2Output};
use selector::SelectorConfig;
use session::{Session, SessionConfig};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index (repeatable); all discovered cameras if omitted
    #[arg(short, long = "input-device")]
    input_devices: Vec<u32>,

    /// Skip cameras whose name contains this text (repeatable)
    #[arg(long, default_value = "Dummy video device")]
    exclude: Vec<String>,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Output frames per second
    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Samples the output queue holds before new ones are dropped
    #[arg(long, default_value_t = 30)]
    queue_capacity: usize,

    /// Minimum milliseconds between face checks of one camera
    #[arg(long, default_value_t = 500)]
    face_check_ms: u64,

    /// Minimum milliseconds a camera stays active before another can take over
    #[arg(long, default_value_t = 3000)]
    hysteresis_ms: u64,

    /// Path to face landmark model (ONNX file)
    /// If not provided, the first camera is forwarded without switching
    #[arg(long)]
    model: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("MultiCam starting");
    tracing::info!("Output: {}x{} @ {} fps", args.output_width, args.output_height, args.fps);

    if args.fps == 0 {
        bail!("--fps must be at least 1");
    }

    // Open the output first so its own name can be excluded from the inputs
    let output = V4L2Output::new(&args.output_device, args.output_width, args.output_height)
        .context("Failed to initialize v4l2loopback output")?;

    let mut exclude = args.exclude.clone();
    exclude.push(output.card_name().to_string());

    let devices = select_devices(&args, &exclude)?;
    if devices.is_empty() {
        tracing::warn!("No input cameras found");
    }

    let detector = if let Some(model_path) = &args.model {
        let detector = detection::create_default_detector(model_path)
            .context("Failed to load face landmark model")?;
        Some(detector)
    } else {
        tracing::info!("Running in passthrough mode (no face detection)");
        None
    };

    let config = SessionConfig {
        selector: SelectorConfig {
            face_check_interval: Duration::from_millis(args.face_check_ms),
            switch_hysteresis: Duration::from_millis(args.hysteresis_ms),
        },
        producer: ProducerConfig {
            width: args.output_width,
            height: args.output_height,
            frame_rate: args.fps,
        },
        queue_capacity: args.queue_capacity,
    };

    let mut session = Session::new(devices, detector, config, Arc::new(SystemClock));
    let queue = session.queue();
    let consumer = spawn_consumer(Arc::clone(&queue), session.stream_clock(), output)?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("Failed to install Ctrl+C handler")?;

    session.start().context("Failed to start capture session")?;
    tracing::info!("Press Ctrl+C to stop");

    let _ = shutdown_rx.recv();
    tracing::info!("Shutting down");

    session.stop();
    queue.clear_altered_proc();
    if consumer.join().is_err() {
        tracing::error!("Output consumer panicked");
    }
    if !queue.is_empty() {
        tracing::warn!("{} samples left unwritten", queue.len());
    }

    Ok(())
}

fn select_devices(args: &Args, exclude: &[String]) -> Result<Vec<Arc<dyn CaptureDevice>>> {
    let devices: Vec<WebcamDevice> = if args.input_devices.is_empty() {
        capture::discover_devices(exclude, args.capture_width, args.capture_height)?
    } else {
        args.input_devices
            .iter()
            .map(|&index| WebcamDevice {
                index,
                name: format!("camera {}", index),
                width: args.capture_width,
                height: args.capture_height,
            })
            .collect()
    };

    Ok(devices
        .into_iter()
        .map(|device| Arc::new(device) as Arc<dyn CaptureDevice>)
        .collect())
}

/// Drain the queue into the loopback device whenever a sample lands
///
/// Exits once the queue's notification is cleared and the backlog is written.
/// Samples written more than two frames after their presentation time count
/// as late.
fn spawn_consumer<O>(queue: Arc<OutputQueue>, stream_clock: Arc<StreamClock>, mut output: O) -> Result<JoinHandle<()>>
where
    O: OutputSink + 'static,
{
    let (altered_tx, altered_rx) = mpsc::channel::<()>();
    queue.set_altered_proc(move |_| {
        let _ = altered_tx.send(());
    });

    let (width, height) = output.resolution();
    tracing::info!("Writing {}x{} samples to loopback device", width, height);

    thread::Builder::new()
        .name("output-consumer".into())
        .spawn(move || {
            let mut written = 0u64;
            let mut late = 0u64;
            let mut worst_lag = Duration::ZERO;
            while altered_rx.recv().is_ok() {
                while let Some(sample) = queue.dequeue() {
                    if let Err(e) = output.write_sample(&sample) {
                        tracing::warn!("{:#}", e);
                        continue;
                    }
                    written += 1;

                    let presentation = sample.timing.presentation.as_duration();
                    if let Some(lag) = stream_clock.lag_behind(presentation, Instant::now()) {
                        worst_lag = worst_lag.max(lag);
                        if lag > sample.timing.duration.as_duration() * 2 {
                            late += 1;
                            tracing::debug!("Sample {} written {:?} late", sample.sequence_number, lag);
                        }
                    }
                }
            }
            tracing::info!(
                "Output consumer wrote {} of {} produced samples ({} late, worst lag {:?})",
                written,
                stream_clock.events_posted(),
                late,
                worst_lag
            );
        })
        .context("Failed to spawn output consumer thread")
}
