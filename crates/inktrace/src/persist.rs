//! Trace persistence: ids, sinks, and the background writer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use image::GrayImage;

use crate::config::OutputConfig;
use crate::error::PersistError;

/// Identifier of a persisted trace: wall-clock nanoseconds, strictly
/// increasing within one [`IdSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceId(u64);

impl TraceId {
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out [`TraceId`]s that never repeat, even when the clock is coarse
/// or steps backwards.
#[derive(Debug, Default)]
pub struct IdSource {
    last: u64,
}

impl IdSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> TraceId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let id = now.max(self.last.saturating_add(1));
        self.last = id;
        TraceId(id)
    }
}

/// Outcome of the writes a sink has finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WriteCounts {
    pub written: u64,
    pub failed: u64,
}

/// Write outcome counters, shared with a writer thread.
#[derive(Debug, Default)]
struct WriteStats {
    written: AtomicU64,
    failed: AtomicU64,
}

impl WriteStats {
    fn record<T, E>(&self, result: &Result<T, E>) {
        let counter = if result.is_ok() {
            &self.written
        } else {
            &self.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WriteCounts {
        WriteCounts {
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Destination for completed traces. The canvas is moved in, so the caller
/// cannot keep drawing on it.
pub trait TraceSink: Send {
    fn persist(&mut self, canvas: GrayImage, id: TraceId, points: usize)
        -> Result<(), PersistError>;

    /// Block until every accepted trace has been written or has failed.
    fn flush(&mut self) {}

    /// Finished writes so far, for sinks that track them.
    fn write_counts(&self) -> Option<WriteCounts> {
        None
    }
}

impl TraceSink for Box<dyn TraceSink> {
    fn persist(
        &mut self,
        canvas: GrayImage,
        id: TraceId,
        points: usize,
    ) -> Result<(), PersistError> {
        (**self).persist(canvas, id, points)
    }

    fn flush(&mut self) {
        (**self).flush()
    }

    fn write_counts(&self) -> Option<WriteCounts> {
        (**self).write_counts()
    }
}

/// Writes each trace to `<dir>/<id>.<extension>`.
#[derive(Debug, Clone)]
pub struct DirectoryWriter {
    dir: PathBuf,
    extension: String,
    dir_ready: bool,
    counts: WriteCounts,
}

impl DirectoryWriter {
    /// The directory is created on the first write.
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            dir_ready: false,
            counts: WriteCounts::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: TraceId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, self.extension))
    }

    fn write(
        &mut self,
        canvas: &GrayImage,
        id: TraceId,
        points: usize,
    ) -> Result<(), PersistError> {
        if !self.dir_ready {
            std::fs::create_dir_all(&self.dir).map_err(|source| PersistError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;
            self.dir_ready = true;
        }
        let path = self.path_for(id);
        canvas.save(&path).map_err(|source| PersistError::Write {
            path: path.clone(),
            source,
        })?;
        tracing::info!("saved trace {} ({} points) to {}", id, points, path.display());
        Ok(())
    }
}

impl TraceSink for DirectoryWriter {
    fn persist(
        &mut self,
        canvas: GrayImage,
        id: TraceId,
        points: usize,
    ) -> Result<(), PersistError> {
        let result = self.write(&canvas, id, points);
        match result {
            Ok(()) => self.counts.written += 1,
            Err(_) => self.counts.failed += 1,
        }
        result
    }

    fn write_counts(&self) -> Option<WriteCounts> {
        Some(self.counts)
    }
}

struct Job {
    canvas: GrayImage,
    id: TraceId,
    points: usize,
}

/// Runs another sink on a dedicated thread.
///
/// `persist` only enqueues; write failures are logged and counted by the
/// writer thread. `flush` or dropping the writer drains pending jobs and
/// joins the thread.
pub struct BackgroundWriter {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<WriteStats>,
}

impl BackgroundWriter {
    const QUEUE_DEPTH: usize = 16;

    pub fn spawn<S: TraceSink + 'static>(mut sink: S) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(Self::QUEUE_DEPTH);
        let stats = Arc::new(WriteStats::default());
        let thread_stats = Arc::clone(&stats);
        let handle = std::thread::Builder::new()
            .name("trace-writer".to_string())
            .spawn(move || {
                for job in rx.iter() {
                    let result = sink.persist(job.canvas, job.id, job.points);
                    thread_stats.record(&result);
                    if let Err(err) = result {
                        tracing::error!("failed to persist trace {}: {}", job.id, err);
                    }
                }
                tracing::debug!("trace writer drained");
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            stats,
        })
    }


    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("trace writer thread panicked");
            }
        }
    }
}

impl TraceSink for BackgroundWriter {
    fn persist(
        &mut self,
        canvas: GrayImage,
        id: TraceId,
        points: usize,
    ) -> Result<(), PersistError> {
        let tx = self.tx.as_ref().ok_or(PersistError::WriterGone)?;
        tx.send(Job { canvas, id, points })
            .map_err(|_| PersistError::WriterGone)
    }

    /// Drain pending jobs and stop the thread. Later traces are refused.
    fn flush(&mut self) {
        self.shutdown();
    }

    fn write_counts(&self) -> Option<WriteCounts> {
        Some(self.stats.snapshot())
    }
}

impl Drop for BackgroundWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sink described by `output`: a directory writer, optionally behind a
/// background thread.
pub fn sink_from_config(output: &OutputConfig) -> std::io::Result<Box<dyn TraceSink>> {
    let writer = DirectoryWriter::new(&output.dir, output.extension.clone());
    if output.background_writes {
        Ok(Box::new(BackgroundWriter::spawn(writer)?))
    } else {
        Ok(Box::new(writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{draw_disc, uniform, FailingSink, RecordingSink};

    #[test]
    fn ids_are_strictly_increasing() {
        let mut ids = IdSource::new();
        let batch: Vec<TraceId> = (0..1000).map(|_| ids.next_id()).collect();
        assert!(batch.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ids_survive_a_clock_step_back() {
        let mut ids = IdSource { last: u64::MAX - 1 };
        assert_eq!(ids.next_id().as_nanos(), u64::MAX);
    }

    #[test]
    fn directory_writer_creates_dir_and_names_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("traces");
        let mut writer = DirectoryWriter::new(&dir, "png");
        let mut canvas = uniform(16, 16, 0);
        draw_disc(&mut canvas, [8.0, 8.0], 3.0, 255);

        let id = TraceId::from_nanos(1_700_000_000_123);
        writer.persist(canvas.clone(), id, 21).unwrap();

        let path = dir.join("1700000000123.png");
        assert_eq!(writer.path_for(id), path);
        let back = image::open(&path).unwrap().to_luma8();
        assert_eq!(back, canvas);
    }

    #[test]
    fn default_extension_is_bmp() {
        let tmp = tempfile::tempdir().unwrap();
        let output = OutputConfig {
            dir: tmp.path().to_path_buf(),
            background_writes: false,
            ..OutputConfig::default()
        };
        let mut sink = sink_from_config(&output).unwrap();
        sink.persist(uniform(8, 8, 255), TraceId::from_nanos(42), 20)
            .unwrap();
        assert!(tmp.path().join("42.bmp").is_file());
    }

    #[test]
    fn write_into_a_file_path_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let mut writer = DirectoryWriter::new(&blocker, "bmp");
        let err = writer
            .persist(uniform(4, 4, 0), TraceId::from_nanos(1), 20)
            .unwrap_err();
        assert!(matches!(err, PersistError::CreateDir { .. }));
    }

    #[test]
    fn background_writer_delivers_in_order_and_drains_on_drop() {
        let recorder = RecordingSink::default();
        let mut writer = BackgroundWriter::spawn(recorder.clone()).unwrap();
        for n in 0..5u64 {
            writer
                .persist(uniform(4, 4, 0), TraceId::from_nanos(n), n as usize)
                .unwrap();
        }
        drop(writer);
        assert_eq!(recorder.points(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn background_writer_reports_failed_writes_after_flush() {
        let mut writer = BackgroundWriter::spawn(FailingSink).unwrap();
        for n in 0..3u64 {
            writer
                .persist(uniform(4, 4, 0), TraceId::from_nanos(n), 20)
                .unwrap();
        }
        writer.flush();
        assert_eq!(
            writer.write_counts(),
            Some(WriteCounts {
                written: 0,
                failed: 3
            })
        );
        let refused = writer.persist(uniform(4, 4, 0), TraceId::from_nanos(9), 20);
        assert!(matches!(refused, Err(PersistError::WriterGone)));
    }

    #[test]
    fn directory_writer_counts_outcomes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ok = DirectoryWriter::new(tmp.path(), "bmp");
        ok.persist(uniform(4, 4, 0), TraceId::from_nanos(1), 20)
            .unwrap();
        assert_eq!(ok.write_counts().map(|c| c.written), Some(1));

        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let mut bad = DirectoryWriter::new(&blocker, "bmp");
        assert!(bad.persist(uniform(4, 4, 0), TraceId::from_nanos(2), 20).is_err());
        assert_eq!(bad.write_counts().map(|c| c.failed), Some(1));
    }
}
