//! inktrace CLI: capture gesture traces from recorded or synthetic IR frames.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use inktrace::{
    threshold_dim, to_gray, BlobDetector, CaptureConfig, CaptureSession, FrameSource, Keypoint,
    MotionSegmenter, ReplaySource, SyntheticScene, SyntheticSource,
};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "inktrace")]
#[command(about = "Capture hand-drawn ink traces from an infrared frame stream")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a capture session and save one image per completed trace.
    Capture(CliCaptureArgs),

    /// Run segmentation and blob detection over recorded frames and dump keypoints.
    Detect(CliDetectArgs),

    /// Print the default configuration as JSON.
    DefaultConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    /// Deterministic moving-spot scene.
    Synthetic,
    /// Directory of recorded IR frames.
    Replay,
}

#[derive(Debug, Clone, Args)]
struct CliCaptureArgs {
    /// Frame source.
    #[arg(long, value_enum, default_value_t = SourceArg::Synthetic)]
    source: SourceArg,

    /// Directory of frames for `--source replay`.
    #[arg(long)]
    replay_dir: Option<PathBuf>,

    /// Frame rate used for replay timestamps and the synthetic scene.
    #[arg(long, default_value = "30.0")]
    fps: f64,

    /// Deliver frames no faster than their timestamps.
    #[arg(long)]
    realtime: bool,

    /// Stop the synthetic scene after this many frames.
    #[arg(long)]
    frames: Option<u64>,

    /// Synthetic noise seed.
    #[arg(long, default_value = "7")]
    seed: u64,

    /// JSON configuration file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory for trace images.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Intensity threshold in [0, 255] applied before segmentation.
    #[arg(long)]
    threshold: Option<u8>,

    /// Minimum accepted points for a trace to be saved.
    #[arg(long)]
    min_points: Option<usize>,

    /// Seconds without an accepted point before the trace is reset.
    #[arg(long)]
    keypoint_timeout: Option<f64>,

    /// Seconds after a reset before points are accepted.
    #[arg(long)]
    warmup_delay: Option<f64>,

    /// Smallest accepted step between consecutive points (px).
    #[arg(long)]
    velocity_lower: Option<f32>,

    /// Largest accepted step between consecutive points (px).
    #[arg(long)]
    velocity_upper: Option<f32>,

    /// Write preview surfaces to this directory.
    #[arg(long)]
    preview_dir: Option<PathBuf>,

    /// Preview cadence in ticks.
    #[arg(long)]
    preview_every: Option<usize>,

    /// Save traces on the worker thread instead of a dedicated writer.
    #[arg(long)]
    no_background_writes: bool,

    /// Do not read operator keys (`q` quit, `r` reset) from stdin.
    #[arg(long)]
    no_keys: bool,

    /// Path to write the session summary (JSON).
    #[arg(long)]
    summary: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct CliDetectArgs {
    /// Directory of recorded IR frames.
    #[arg(long)]
    frames: PathBuf,

    /// Path to write per-frame keypoints (JSON).
    #[arg(long)]
    out: PathBuf,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Intensity threshold in [0, 255] applied before segmentation.
    #[arg(long)]
    threshold: Option<u8>,

    /// Skip peak normalization of each frame.
    #[arg(long)]
    no_peak_normalize: bool,
}

fn load_config(path: Option<&PathBuf>) -> CliResult<CaptureConfig> {
    match path {
        Some(path) => {
            tracing::info!("Loading config: {}", path.display());
            Ok(CaptureConfig::from_json_file(path)?)
        }
        None => Ok(CaptureConfig::default()),
    }
}

impl CliCaptureArgs {
    fn to_config(&self) -> CliResult<CaptureConfig> {
        let mut config = load_config(self.config.as_ref())?;
        if let Some(dir) = &self.out_dir {
            config.output.dir = dir.clone();
        }
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if let Some(min_points) = self.min_points {
            config.trace.min_points = min_points;
        }
        if let Some(timeout) = self.keypoint_timeout {
            config.trace.keypoint_timeout_s = timeout;
        }
        if let Some(delay) = self.warmup_delay {
            config.trace.warmup_delay_s = delay;
        }
        if let Some(lower) = self.velocity_lower {
            config.trace.velocity.lower_px = lower;
        }
        if let Some(upper) = self.velocity_upper {
            config.trace.velocity.upper_px = upper;
        }
        if let Some(dir) = &self.preview_dir {
            config.output.preview_dir = Some(dir.clone());
        }
        if let Some(every) = self.preview_every {
            config.output.preview_every = every;
        }
        if self.no_background_writes {
            config.output.background_writes = false;
        }
        Ok(config)
    }

    fn to_source(&self) -> CliResult<Box<dyn FrameSource>> {
        match self.source {
            SourceArg::Synthetic => {
                let scene = SyntheticScene {
                    fps: self.fps,
                    seed: self.seed,
                    frame_limit: self.frames,
                    ..SyntheticScene::default()
                };
                Ok(Box::new(
                    SyntheticSource::new(scene).realtime(self.realtime),
                ))
            }
            SourceArg::Replay => {
                let dir = self
                    .replay_dir
                    .clone()
                    .ok_or("--source replay requires --replay-dir")?;
                Ok(Box::new(
                    ReplaySource::new(dir, self.fps).realtime(self.realtime),
                ))
            }
        }
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Capture(args) => run_capture(&args),
        Commands::Detect(args) => run_detect(&args),
        Commands::DefaultConfig => run_default_config(),
    }
}

// ── capture ────────────────────────────────────────────────────────────

/// Forward every character typed on stdin. The thread ends with stdin.
fn spawn_key_reader() -> CliResult<crossbeam_channel::Receiver<char>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::Builder::new()
        .name("operator-keys".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                for key in line.chars().filter(|c| !c.is_whitespace()) {
                    if tx.send(key).is_err() {
                        return;
                    }
                }
            }
        })?;
    Ok(rx)
}

fn run_capture(args: &CliCaptureArgs) -> CliResult<()> {
    let config = args.to_config()?;
    let mut source = args.to_source()?;
    tracing::info!(
        "Saving traces to {} (min {} points)",
        config.output.dir.display(),
        config.trace.min_points
    );

    let mut session = CaptureSession::new(config)?;
    if !args.no_keys {
        session = session.with_keys(spawn_key_reader()?);
        tracing::info!("Keys: q + Enter quits, r + Enter resets the trace");
    }

    let summary = session.run(source.as_mut())?;
    tracing::info!(
        "{} frames, {} dropped, {} traces saved, {} discarded, {} restarts",
        summary.frames_delivered,
        summary.queue.dropped,
        summary.traces_saved(),
        summary.engine.discarded,
        summary.restarts
    );

    if let Some(path) = &args.summary {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, &json)?;
        tracing::info!("Summary written to {}", path.display());
    }
    Ok(())
}

// ── detect ─────────────────────────────────────────────────────────────

#[derive(serde::Serialize)]
struct FrameKeypoints {
    sequence: u64,
    timestamp_s: f64,
    keypoints: Vec<Keypoint>,
}

fn run_detect(args: &CliDetectArgs) -> CliResult<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(threshold) = args.threshold {
        config.threshold = threshold;
    }
    config.validate()?;

    let mut source = ReplaySource::new(&args.frames, 30.0);
    source.start()?;
    tracing::info!("Detecting keypoints in {} frames", source.len());

    let mut segmenter = MotionSegmenter::new(config.segmenter.clone());
    let detector = BlobDetector::new(config.blob.clone());
    let mut results = Vec::with_capacity(source.len());

    while let Some(mut frame) = source.next_frame(Duration::ZERO)? {
        if !args.no_peak_normalize {
            inktrace::normalize_peak(&mut frame.image);
        }
        let mut gray = match to_gray(&frame.image) {
            Ok(gray) => gray,
            Err(err) => {
                tracing::warn!("Skipping frame {}: {}", frame.sequence, err);
                continue;
            }
        };
        threshold_dim(&mut gray, config.threshold);
        let mask = segmenter.apply(&gray);
        let keypoints = detector.detect(&mask);
        tracing::debug!("frame {}: {} keypoints", frame.sequence, keypoints.len());
        results.push(FrameKeypoints {
            sequence: frame.sequence,
            timestamp_s: frame.timestamp.as_secs_f64(),
            keypoints,
        });
    }
    source.stop();

    let total: usize = results.iter().map(|r| r.keypoints.len()).sum();
    tracing::info!("{} keypoints over {} frames", total, results.len());

    let json = serde_json::to_string_pretty(&results)?;
    std::fs::write(&args.out, &json)?;
    tracing::info!("Results written to {}", args.out.display());
    Ok(())
}

// ── default-config ─────────────────────────────────────────────────────

fn run_default_config() -> CliResult<()> {
    let json = serde_json::to_string_pretty(&CaptureConfig::default())?;
    println!("{}", json);
    Ok(())
}
