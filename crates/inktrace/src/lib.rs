//! inktrace: real-time ink-trace capture from an infrared sensor.
//!
//! A bright marker waved in front of the sensor is followed frame by frame
//! and its path is drawn onto a canvas, one image per gesture. The pipeline
//! stages are:
//!
//! 1. **Normalize** – float IR samples to 8-bit intensity, dim noise zeroed.
//! 2. **Segment** – mixture-of-Gaussians background model → foreground mask.
//! 3. **Blobs** – point-like blobs filtered by color, area, circularity and
//!    convexity.
//! 4. **Trace** – warm-up gating, velocity filter, stroke drawing, and
//!    reset/persist when the gesture goes quiet.
//!
//! # Public API
//! - [`CaptureSession`] drives a [`FrameSource`] with a worker thread
//! - [`TraceEngine`] for running the per-frame pipeline directly
//! - [`CaptureConfig`] for tuning, loadable from JSON
//! - [`TraceSink`] implementations for persistence

mod blob;
mod config;
mod controls;
mod engine;
mod error;
mod frame;
mod persist;
mod preview;
mod queue;
mod segment;
mod session;
mod source;
mod trace;

#[cfg(test)]
pub(crate) mod test_utils;

pub use blob::{BlobConfig, BlobDetector, Keypoint};
pub use config::{
    CaptureConfig, OutputConfig, QueueConfig, SourceConfig, StarvationPolicy, TraceConfig,
};
pub use controls::{Action, ControlMap};
pub use engine::{
    Disposition, EngineState, EngineStats, ResetHandle, ResetOutcome, ResetReason, TickReport,
    TraceEngine,
};
pub use error::{
    ConfigError, FrameError, PersistError, PopError, QueueClosed, SessionError, SourceError,
};
pub use frame::{normalize_peak, threshold_dim, to_gray, Frame, IrImage};
pub use persist::{
    sink_from_config, BackgroundWriter, DirectoryWriter, IdSource, TraceId, TraceSink,
    WriteCounts,
};
pub use preview::{render_keypoints, render_overlay, PreviewDumper, TickObserver, TickView};
pub use queue::{frame_queue, FrameReceiver, FrameSender, Pushed, QueueCounts, QueueStats};
pub use segment::{MotionSegmenter, SegmenterConfig, BACKGROUND, FOREGROUND};
pub use session::{
    CancelToken, CaptureSession, FrameSource, LoopControl, SessionSummary, StopReason,
};
pub use source::{ReplaySource, SyntheticScene, SyntheticSource};
pub use trace::{Offer, Trace, VelocityBounds, INK};
