//! Per-tick trace pipeline.
//!
//! [`TraceEngine`] is the primary entry point for turning infrared frames
//! into persisted traces. It owns the background model, the blob detector,
//! the active trace and the sink; one engine serves one session and lives
//! on the worker thread.
//!
//! A tick runs these steps:
//! 1. normalize, threshold and segment the frame into a foreground mask;
//! 2. create the trace if absent, or reset it on keypoint timeout, external
//!    request or frame-size change;
//! 3. detect blobs;
//! 4. once the warm-up delay after the last reset has elapsed, offer every
//!    keypoint to the trace, then stroke the last two accepted points;
//! 5. hand the tick to the observer, if any.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::blob::{BlobDetector, Keypoint};
use crate::config::CaptureConfig;
use crate::error::{ConfigError, FrameError};
use crate::frame::{threshold_dim, to_gray, Frame};
use crate::persist::{IdSource, TraceId, TraceSink, WriteCounts};
use crate::preview::{TickObserver, TickView};
use crate::segment::MotionSegmenter;
use crate::trace::{Offer, Trace};

/// Coarse lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No frame processed yet (or the trace was flushed on exit).
    #[default]
    Empty,
    /// Warming up after a reset; keypoints are ignored.
    Capturing,
    /// Accepting keypoints.
    Ready,
}

/// Why a trace was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    /// No point accepted for the keypoint timeout.
    Timeout,
    /// Operator or API request.
    Requested,
    /// Frame dimensions changed.
    Resized,
    /// Worker shutting down.
    Shutdown,
}

/// What became of the retired trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fewer points than the persistence minimum.
    Discarded,
    /// Handed to the sink. A background sink may still fail to write it.
    Persisted(TraceId),
    /// The sink refused the trace; it is gone either way.
    Failed(TraceId),
}

/// Outcome of one reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    pub reason: ResetReason,
    /// Points in the retired trace.
    pub points: usize,
    pub disposition: Disposition,
}

/// Result of one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub sequence: u64,
    pub timestamp: Duration,
    /// Keypoints found this tick, accepted or not.
    pub keypoints: Vec<Keypoint>,
    /// How many of them joined the trace.
    pub accepted: usize,
    /// Points in the active trace after the tick.
    pub trace_len: usize,
    pub state: EngineState,
    /// Set when the trace was reset during this tick.
    pub reset: Option<ResetOutcome>,
}

/// Running totals over the engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EngineStats {
    pub ticks: u64,
    pub skipped_frames: u64,
    pub accepted_points: u64,
    /// Traces handed to the sink.
    pub submitted: u64,
    pub discarded: u64,
    /// Traces the sink refused at hand-off.
    pub failed: u64,
}

/// Thread-safe handle that asks the engine to reset its trace.
///
/// The request is served at the start of the next tick.
#[derive(Debug, Clone)]
pub struct ResetHandle(Arc<AtomicBool>);

impl ResetHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Frame-to-trace pipeline.
///
/// ```no_run
/// use inktrace::{CaptureConfig, DirectoryWriter, TraceEngine};
///
/// let config = CaptureConfig::default();
/// let sink = DirectoryWriter::new("traces", "bmp");
/// let mut engine = TraceEngine::new(config, Box::new(sink))?;
/// # let frame: inktrace::Frame = unimplemented!();
/// let report = engine.process(&frame)?;
/// println!("{} keypoints, {} accepted", report.keypoints.len(), report.accepted);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct TraceEngine {
    config: CaptureConfig,
    segmenter: MotionSegmenter,
    detector: BlobDetector,
    trace: Option<Trace>,
    ready: bool,
    sink: Box<dyn TraceSink>,
    observer: Option<Box<dyn TickObserver>>,
    ids: IdSource,
    reset_requested: Arc<AtomicBool>,
    stats: EngineStats,
}

impl TraceEngine {
    /// Validate `config` and create an engine.
    pub fn new(config: CaptureConfig, sink: Box<dyn TraceSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            segmenter: MotionSegmenter::new(config.segmenter.clone()),
            detector: BlobDetector::new(config.blob.clone()),
            config,
            trace: None,
            ready: false,
            sink,
            observer: None,
            ids: IdSource::new(),
            reset_requested: Arc::new(AtomicBool::new(false)),
            stats: EngineStats::default(),
        })
    }

    pub fn set_observer(&mut self, observer: Box<dyn TickObserver>) {
        self.observer = Some(observer);
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn state(&self) -> EngineState {
        match self.trace {
            None => EngineState::Empty,
            Some(_) if self.ready => EngineState::Ready,
            Some(_) => EngineState::Capturing,
        }
    }

    pub fn reset_handle(&self) -> ResetHandle {
        ResetHandle(Arc::clone(&self.reset_requested))
    }

    /// Run one tick on `frame`.
    ///
    /// A frame that cannot be normalized is skipped and leaves every piece of
    /// state untouched.
    pub fn process(&mut self, frame: &Frame) -> Result<TickReport, FrameError> {
        let gray = match to_gray(&frame.image) {
            Ok(gray) => gray,
            Err(err) => {
                self.stats.skipped_frames += 1;
                return Err(err);
            }
        };
        let mut dimmed = gray.clone();
        threshold_dim(&mut dimmed, self.config.threshold);
        let mask = self.segmenter.apply(&dimmed);
        let keypoints = self.detector.detect(&mask);

        let mut report = self.advance(frame.timestamp, gray.dimensions(), keypoints);
        report.sequence = frame.sequence;

        if let Some(observer) = self.observer.as_mut() {
            observer.observe(&TickView {
                report: &report,
                frame: &gray,
                mask: &mask,
                canvas: self.trace.as_ref().map(Trace::canvas),
            });
        }
        Ok(report)
    }

    /// Trace lifecycle and acceptance for one tick, given its keypoints.
    pub fn advance(
        &mut self,
        now: Duration,
        dims: (u32, u32),
        keypoints: Vec<Keypoint>,
    ) -> TickReport {
        self.stats.ticks += 1;
        let reset = self.maintain(now, dims);
        let accepted = self.accept(now, &keypoints);
        TickReport {
            sequence: 0,
            timestamp: now,
            keypoints,
            accepted,
            trace_len: self.trace.as_ref().map_or(0, Trace::len),
            state: self.state(),
            reset,
        }
    }

    /// Reset the active trace right away. `None` when there is no trace.
    pub fn reset(&mut self, reason: ResetReason, now: Duration) -> Option<ResetOutcome> {
        let dims = self.trace.as_ref()?.dimensions();
        let fresh = Trace::new(dims.0, dims.1, now);
        let old = self.trace.replace(fresh)?;
        Some(self.retire(old, reason, now))
    }

    /// Wait for the sink's pending writes and return its write outcomes,
    /// when it tracks them.
    pub fn close_sink(&mut self) -> Option<WriteCounts> {
        self.sink.flush();
        self.sink.write_counts()
    }

    /// Flush the active trace through the reset protocol and leave the
    /// engine empty. Does nothing when `flush_on_exit` is off.
    pub fn finish(&mut self, now: Duration) -> Option<ResetOutcome> {
        if !self.config.trace.flush_on_exit {
            return None;
        }
        let old = self.trace.take()?;
        Some(self.retire(old, ResetReason::Shutdown, now))
    }

    fn maintain(&mut self, now: Duration, dims: (u32, u32)) -> Option<ResetOutcome> {
        let requested = self.reset_requested.swap(false, Ordering::AcqRel);
        let Some(trace) = self.trace.as_ref() else {
            tracing::debug!("starting first trace at {:?} ({}x{})", now, dims.0, dims.1);
            self.trace = Some(Trace::new(dims.0, dims.1, now));
            return None;
        };

        let reason = if trace.dimensions() != dims {
            ResetReason::Resized
        } else if requested {
            ResetReason::Requested
        } else if trace.is_stale(now, self.config.trace.keypoint_timeout()) {
            ResetReason::Timeout
        } else {
            return None;
        };
        let old = self.trace.replace(Trace::new(dims.0, dims.1, now))?;
        Some(self.retire(old, reason, now))
    }

    fn accept(&mut self, now: Duration, keypoints: &[Keypoint]) -> usize {
        let Some(trace) = self.trace.as_mut() else {
            return 0;
        };
        let cfg = &self.config.trace;
        let ready = trace.is_ready(now, cfg.warmup_delay());
        if ready != self.ready {
            if ready {
                tracing::info!("trace ready at {:?}", now);
            } else {
                tracing::info!("trace warming up for {:?}", cfg.warmup_delay());
            }
            self.ready = ready;
        }
        if !ready {
            return 0;
        }

        let mut accepted = 0;
        for kp in keypoints {
            match trace.offer(kp.position(), now, &cfg.velocity) {
                Offer::Accepted => accepted += 1,
                rejected => {
                    tracing::debug!("keypoint ({:.1}, {:.1}): {:?}", kp.x, kp.y, rejected)
                }
            }
        }
        if accepted > 0 {
            trace.stroke_last(cfg.stroke_thickness_px);
        }
        self.stats.accepted_points += accepted as u64;
        accepted
    }

    fn retire(&mut self, trace: Trace, reason: ResetReason, now: Duration) -> ResetOutcome {
        self.ready = false;
        let points = trace.len();
        let min_points = self.config.trace.min_points;
        if points == 0 || points < min_points {
            self.stats.discarded += 1;
            if points > 0 {
                tracing::info!(
                    "discarding trace with {} points ({:?}, minimum {})",
                    points,
                    reason,
                    min_points
                );
            }
            return ResetOutcome {
                reason,
                points,
                disposition: Disposition::Discarded,
            };
        }

        let id = self.ids.next_id();
        let disposition = match self.sink.persist(trace.into_canvas(), id, points) {
            Ok(()) => {
                self.stats.submitted += 1;
                tracing::info!("trace {} completed with {} points ({:?})", id, points, reason);
                Disposition::Persisted(id)
            }
            Err(err) => {
                self.stats.failed += 1;
                tracing::error!("failed to persist trace {}: {}", id, err);
                Disposition::Failed(id)
            }
        };
        tracing::debug!("trace reset at {:?}", now);
        ResetOutcome {
            reason,
            points,
            disposition,
        }
    }
}
