//! Capture session: frame delivery on the calling thread, tracing on a
//! dedicated worker.
//!
//! The delivery loop polls the [`FrameSource`], peak-normalizes each frame,
//! pushes it into the bounded queue and serves operator keys. Frame timeouts
//! are answered with a source restart, up to `source.max_restarts` per
//! session. The worker pops frames and runs them through a [`TraceEngine`]
//! until the queue disconnects, the pop times out under
//! [`StarvationPolicy::Stop`], or the session is cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::config::{CaptureConfig, QueueConfig, StarvationPolicy};
use crate::controls::{Action, ControlMap};
use crate::engine::{EngineStats, ResetHandle, TraceEngine};
use crate::error::{ConfigError, PopError, SessionError, SourceError};
use crate::frame::{normalize_peak, Frame};
use crate::persist::{sink_from_config, TraceSink, WriteCounts};
use crate::preview::{PreviewDumper, TickObserver};
use crate::queue::{frame_queue, FrameReceiver, FrameSender, QueueCounts};

/// Producer of timestamped infrared frames.
///
/// Device enumeration, mode selection and window handling live behind this
/// trait.
pub trait FrameSource {
    fn start(&mut self) -> Result<(), SourceError>;

    /// Next frame, waiting at most `timeout`. `Ok(None)` ends the stream;
    /// a stall is reported as [`SourceError::Timeout`].
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, SourceError>;

    fn restart(&mut self) -> Result<(), SourceError> {
        self.stop();
        self.start()
    }

    fn stop(&mut self);
}

/// Cooperative cancellation flag shared between threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Whether a loop goes on after the current iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// Why delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The source reported the end of its stream.
    EndOfStream,
    /// Operator quit.
    Quit,
    /// The cancel token was triggered from outside.
    Cancelled,
    /// Frame timeouts persisted after every allowed restart.
    SourceStalled,
    /// The worker stopped consuming frames.
    WorkerGone,
}

/// Totals of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SessionSummary {
    pub stop: StopReason,
    pub frames_delivered: u64,
    pub restarts: u32,
    pub queue: QueueCounts,
    pub engine: EngineStats,
    /// Finished writes, when the sink tracks them.
    pub writes: Option<WriteCounts>,
}

impl SessionSummary {
    /// Traces known to be on disk, or handed to the sink when the sink does
    /// not report writes.
    pub fn traces_saved(&self) -> u64 {
        self.writes.map_or(self.engine.submitted, |w| w.written)
    }
}

struct Delivery {
    stop: StopReason,
    frames: u64,
    restarts: u32,
}

/// One capture run over a [`FrameSource`].
pub struct CaptureSession {
    config: CaptureConfig,
    sink: Option<Box<dyn TraceSink>>,
    observer: Option<Box<dyn TickObserver>>,
    keys: Option<Receiver<char>>,
    controls: ControlMap,
    cancel: CancelToken,
}

impl CaptureSession {
    /// Validate `config` and prepare a session. Nothing is started yet.
    pub fn new(config: CaptureConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            sink: None,
            observer: None,
            keys: None,
            controls: ControlMap::default(),
            cancel: CancelToken::new(),
        })
    }

    /// Persist into `sink` instead of the configured output directory.
    pub fn with_sink(mut self, sink: Box<dyn TraceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Observe every tick. Replaces the configured preview dumper.
    pub fn with_observer(mut self, observer: Box<dyn TickObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Operator key presses, polled once per delivered frame.
    pub fn with_keys(mut self, keys: Receiver<char>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_controls(mut self, controls: ControlMap) -> Self {
        self.controls = controls;
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run until the source ends, the operator quits, the source stalls for
    /// good, or the session is cancelled. The active trace is flushed before
    /// returning.
    pub fn run(mut self, source: &mut dyn FrameSource) -> Result<SessionSummary, SessionError> {
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => sink_from_config(&self.config.output).map_err(|source| {
                SessionError::Spawn {
                    name: "trace-writer",
                    source,
                }
            })?,
        };
        let mut engine = TraceEngine::new(self.config.clone(), sink)?;
        let observer = self.observer.take().or_else(|| {
            let dir = self.config.output.preview_dir.as_ref()?;
            let dumper = PreviewDumper::new(dir, self.config.output.preview_every);
            Some(Box::new(dumper) as Box<dyn TickObserver>)
        });
        if let Some(observer) = observer {
            engine.set_observer(observer);
        }
        let reset = engine.reset_handle();

        let (tx, rx) = frame_queue(self.config.queue.capacity);
        let queue_stats = tx.stats();
        let queue_config = self.config.queue.clone();
        let cancel = self.cancel.clone();
        let worker = std::thread::Builder::new()
            .name("trace-worker".to_string())
            .spawn(move || run_worker(engine, rx, &queue_config, &cancel))
            .map_err(|source| SessionError::Spawn {
                name: "trace-worker",
                source,
            })?;

        tracing::info!(
            "capture started (queue {}, frame timeout {:?})",
            self.config.queue.capacity,
            self.config.source.frame_timeout()
        );
        let delivered = self.deliver(source, &tx, &reset);
        source.stop();
        drop(tx);

        let (engine_stats, writes) = worker.join().map_err(|_| SessionError::WorkerPanicked)?;
        let delivery = delivered?;
        let summary = SessionSummary {
            stop: delivery.stop,
            frames_delivered: delivery.frames,
            restarts: delivery.restarts,
            queue: queue_stats.snapshot(),
            engine: engine_stats,
            writes,
        };
        tracing::info!(
            "capture stopped ({:?}): {} frames, {} traces saved, {} discarded",
            summary.stop,
            summary.frames_delivered,
            summary.traces_saved(),
            summary.engine.discarded
        );
        if let Some(w) = writes.filter(|w| w.failed > 0) {
            tracing::error!("{} trace writes failed", w.failed);
        }
        Ok(summary)
    }

    fn deliver(
        &mut self,
        source: &mut dyn FrameSource,
        tx: &FrameSender,
        reset: &ResetHandle,
    ) -> Result<Delivery, SourceError> {
        let frame_timeout = self.config.source.frame_timeout();
        let push_timeout = self.config.queue.push_timeout();
        let max_restarts = self.config.source.max_restarts;
        let mut delivery = Delivery {
            stop: StopReason::EndOfStream,
            frames: 0,
            restarts: 0,
        };

        source.start()?;
        loop {
            if self.cancel.is_cancelled() {
                delivery.stop = StopReason::Cancelled;
                return Ok(delivery);
            }
            if self.poll_controls(reset) == LoopControl::Stop {
                self.cancel.cancel();
                delivery.stop = StopReason::Quit;
                return Ok(delivery);
            }

            match source.next_frame(frame_timeout) {
                Ok(Some(mut frame)) => {
                    if self.config.source.peak_normalize {
                        normalize_peak(&mut frame.image);
                    }
                    delivery.frames += 1;
                    if tx.push(frame, push_timeout).is_err() {
                        tracing::warn!("trace worker stopped consuming; ending delivery");
                        delivery.stop = StopReason::WorkerGone;
                        return Ok(delivery);
                    }
                }
                Ok(None) => {
                    tracing::info!("frame source exhausted after {} frames", delivery.frames);
                    delivery.stop = StopReason::EndOfStream;
                    return Ok(delivery);
                }
                Err(SourceError::Timeout(waited)) => {
                    tracing::error!("timed out waiting for a new frame ({:?})", waited);
                    if delivery.restarts >= max_restarts {
                        tracing::error!(
                            "frame source still stalled after {} restarts; stopping",
                            delivery.restarts
                        );
                        delivery.stop = StopReason::SourceStalled;
                        return Ok(delivery);
                    }
                    delivery.restarts += 1;
                    tracing::info!(
                        "restarting frame source ({} of {})",
                        delivery.restarts,
                        max_restarts
                    );
                    source.restart()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn poll_controls(&self, reset: &ResetHandle) -> LoopControl {
        let Some(keys) = self.keys.as_ref() else {
            return LoopControl::Continue;
        };
        while let Ok(key) = keys.try_recv() {
            match self.controls.action_for(key) {
                Some(Action::Quit) => {
                    tracing::info!("quit requested");
                    return LoopControl::Stop;
                }
                Some(Action::ResetTrace) => {
                    tracing::info!("trace reset requested");
                    reset.request();
                }
                None => {}
            }
        }
        LoopControl::Continue
    }
}

/// Worker body: pop, process, repeat. Returns the engine totals and the
/// sink's write outcomes after the final flush.
fn run_worker(
    mut engine: TraceEngine,
    rx: FrameReceiver,
    queue: &QueueConfig,
    cancel: &CancelToken,
) -> (EngineStats, Option<WriteCounts>) {
    let mut clock = Duration::ZERO;
    while !cancel.is_cancelled() {
        if worker_step(&mut engine, &rx, queue, &mut clock) == LoopControl::Stop {
            break;
        }
    }
    engine.finish(clock);
    let writes = engine.close_sink();
    (engine.stats(), writes)
}

fn worker_step(
    engine: &mut TraceEngine,
    rx: &FrameReceiver,
    queue: &QueueConfig,
    clock: &mut Duration,
) -> LoopControl {
    match rx.pop(queue.pop_timeout()) {
        Ok(frame) => {
            *clock = frame.timestamp;
            if let Err(err) = engine.process(&frame) {
                tracing::warn!("skipping frame {}: {}", frame.sequence, err);
            }
            LoopControl::Continue
        }
        Err(PopError::Timeout(waited)) => match queue.on_starvation {
            StarvationPolicy::Stop => {
                tracing::warn!("no frame for {:?}; stopping trace worker", waited);
                LoopControl::Stop
            }
            StarvationPolicy::Continue => {
                tracing::info!("no frame for {:?}; still waiting", waited);
                LoopControl::Continue
            }
        },
        Err(PopError::Disconnected) => {
            tracing::debug!("frame producer finished");
            LoopControl::Stop
        }
    }
}
