//! Error types shared across the capture pipeline.

use std::path::PathBuf;

/// Invalid configuration, reported by [`crate::CaptureConfig::validate`]
/// before any capture thread is started.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("velocity bounds are inverted: lower {lower} > upper {upper}")]
    InvertedVelocityBounds { lower: f32, upper: f32 },
    #[error("velocity bounds must be finite and non-negative (lower {lower}, upper {upper})")]
    InvalidVelocityBounds { lower: f32, upper: f32 },
    #[error("blob area range is inverted: min {min} > max {max}")]
    InvertedAreaRange { min: f32, max: f32 },
    #[error("{name} must be a finite, non-negative number of seconds (got {value})")]
    InvalidDuration { name: &'static str, value: f64 },
    #[error("{name} must be in [0, 1] (got {value})")]
    OutOfUnitRange { name: &'static str, value: f32 },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("segmenter variance bounds are inconsistent: min {min}, init {init}, max {max}")]
    InvalidVariance { min: f32, init: f32, max: f32 },
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A frame that cannot be processed. The tick is skipped; the session goes on.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has no samples ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("frame sample at ({x}, {y}) is not finite")]
    NonFinite { x: u32, y: u32 },
}

/// Failure to write a completed trace.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("cannot create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write trace image {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("background writer is no longer running")]
    WriterGone,
}

/// Why [`crate::FrameReceiver::pop`] returned without a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PopError {
    #[error("no frame queued within {0:?}")]
    Timeout(std::time::Duration),
    #[error("frame producer disconnected")]
    Disconnected,
}

/// The consuming side of the frame queue is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame consumer disconnected")]
pub struct QueueClosed;

/// Frame source failures. `Timeout` is the only recoverable one: the session
/// answers it with a restart.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no frame received within {0:?}")]
    Timeout(std::time::Duration),
    #[error("frame source is not started")]
    NotStarted,
    #[error("cannot read frame {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("cannot list frames in {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Device(String),
}

/// Errors that end a capture session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("trace worker panicked")]
    WorkerPanicked,
}
