//! Bounded frame hand-off between the delivery thread and the trace worker.
//!
//! Frames are moved through the channel, never shared. The sender waits a
//! bounded time for room and then drops the frame; the receiver waits a
//! bounded time and tells a quiet producer apart from a departed one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::error::{PopError, QueueClosed};
use crate::frame::Frame;

/// Live queue counters, shared by both ends.
#[derive(Debug, Default)]
pub struct QueueStats {
    pushed: AtomicU64,
    dropped: AtomicU64,
    popped: AtomicU64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueCounts {
        QueueCounts {
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub pushed: u64,
    pub dropped: u64,
    pub popped: u64,
}

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// The queue stayed full for the whole push timeout.
    Dropped,
}

/// Create a queue holding at most `capacity` frames.
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let stats = Arc::new(QueueStats::default());
    (
        FrameSender {
            tx,
            stats: Arc::clone(&stats),
        },
        FrameReceiver { rx, stats },
    )
}

/// Producing end, owned by the delivery thread.
#[derive(Debug)]
pub struct FrameSender {
    tx: Sender<Frame>,
    stats: Arc<QueueStats>,
}

impl FrameSender {
    /// Enqueue `frame`, waiting up to `timeout` for room.
    pub fn push(&self, frame: Frame, timeout: Duration) -> Result<Pushed, QueueClosed> {
        let sequence = frame.sequence;
        match self.tx.send_timeout(frame, timeout) {
            Ok(()) => {
                self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(Pushed::Queued)
            }
            Err(SendTimeoutError::Timeout(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    "frame queue full; dropped frame {} ({} so far)",
                    sequence,
                    dropped
                );
                Ok(Pushed::Dropped)
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(QueueClosed),
        }
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }
}

/// Consuming end, owned by the trace worker.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: Receiver<Frame>,
    stats: Arc<QueueStats>,
}

impl FrameReceiver {
    /// Oldest queued frame, waiting up to `timeout`.
    ///
    /// Frames queued before the sender went away are still delivered;
    /// `Disconnected` is only reported once the queue is empty.
    pub fn pop(&self, timeout: Duration) -> Result<Frame, PopError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                Ok(frame)
            }
            Err(RecvTimeoutError::Timeout) => Err(PopError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(PopError::Disconnected),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }
}
