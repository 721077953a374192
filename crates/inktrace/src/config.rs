use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::blob::BlobConfig;
use crate::error::ConfigError;
use crate::segment::SegmenterConfig;
use crate::trace::VelocityBounds;

/// Trace lifecycle timing and acceptance policy.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// A trace with no accepted point for this long is reset (seconds).
    pub keypoint_timeout_s: f64,
    /// Grace period after a reset during which no point is accepted (seconds).
    pub warmup_delay_s: f64,
    /// Accepted distance band between consecutive points (pixels).
    pub velocity: VelocityBounds,
    /// Minimum number of accepted points for a trace to be persisted.
    pub min_points: usize,
    /// Stroke width drawn between consecutive points (pixels).
    pub stroke_thickness_px: u32,
    /// Run the reset protocol on the active trace when the worker exits.
    pub flush_on_exit: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            keypoint_timeout_s: 1.0,
            warmup_delay_s: 1.5,
            velocity: VelocityBounds::default(),
            min_points: 20,
            stroke_thickness_px: 2,
            flush_on_exit: true,
        }
    }
}

impl TraceConfig {
    pub fn keypoint_timeout(&self) -> Duration {
        secs(self.keypoint_timeout_s)
    }

    pub fn warmup_delay(&self) -> Duration {
        secs(self.warmup_delay_s)
    }
}

/// What the worker does when no frame arrives within the pop timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StarvationPolicy {
    /// Treat the producer as dead and end the worker.
    #[default]
    Stop,
    /// Log and keep waiting.
    Continue,
}

/// Frame hand-off between the delivery thread and the trace worker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of frames waiting for the worker.
    pub capacity: usize,
    /// Longest a push waits for room before the frame is dropped (seconds).
    pub push_timeout_s: f64,
    /// Longest a pop waits for a frame (seconds).
    pub pop_timeout_s: f64,
    pub on_starvation: StarvationPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            push_timeout_s: 0.1,
            pop_timeout_s: 3.0,
            on_starvation: StarvationPolicy::Stop,
        }
    }
}

impl QueueConfig {
    pub fn push_timeout(&self) -> Duration {
        secs(self.push_timeout_s)
    }

    pub fn pop_timeout(&self) -> Duration {
        secs(self.pop_timeout_s)
    }
}

/// Frame delivery policy.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Longest the delivery loop waits for the next frame (seconds).
    pub frame_timeout_s: f64,
    /// Source restarts attempted after consecutive frame timeouts before the
    /// session gives up.
    pub max_restarts: u32,
    /// Divide every infrared frame by its peak sample before enqueueing.
    pub peak_normalize: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            frame_timeout_s: 3.0,
            max_restarts: 3,
            peak_normalize: true,
        }
    }
}

impl SourceConfig {
    pub fn frame_timeout(&self) -> Duration {
        secs(self.frame_timeout_s)
    }
}

/// Where completed traces (and optional preview surfaces) are written.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Trace output directory, created on first write.
    pub dir: PathBuf,
    /// Raster format extension understood by the `image` crate.
    pub extension: String,
    /// Hand trace images to a dedicated writer thread.
    pub background_writes: bool,
    /// Directory for preview surfaces; previews are off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_dir: Option<PathBuf>,
    /// Write previews every n-th tick.
    pub preview_every: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("traces"),
            extension: "bmp".to_string(),
            background_writes: true,
            preview_dir: None,
            preview_every: 30,
        }
    }
}

/// Top-level capture configuration.
///
/// Every knob has a default matching the reference capture rig (Kinect v2
/// infrared at 30 fps). Load overrides from JSON with
/// [`CaptureConfig::from_json_file`]; unknown sections fall back to defaults.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Normalized intensities below this are zeroed before segmentation.
    pub threshold: u8,
    pub segmenter: SegmenterConfig,
    pub blob: BlobConfig,
    pub trace: TraceConfig,
    pub queue: QueueConfig,
    pub source: SourceConfig,
    pub output: OutputConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            threshold: Self::DEFAULT_THRESHOLD,
            segmenter: SegmenterConfig::default(),
            blob: BlobConfig::default(),
            trace: TraceConfig::default(),
            queue: QueueConfig::default(),
            source: SourceConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl CaptureConfig {
    pub const DEFAULT_THRESHOLD: u8 = 150;

    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every knob. Called once at startup, never at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.trace.velocity.validate()?;
        check_duration("trace.keypoint_timeout_s", self.trace.keypoint_timeout_s)?;
        check_duration("trace.warmup_delay_s", self.trace.warmup_delay_s)?;
        if self.trace.stroke_thickness_px == 0 {
            return Err(ConfigError::Zero {
                name: "trace.stroke_thickness_px",
            });
        }

        self.segmenter.validate()?;
        self.blob.validate()?;

        if self.queue.capacity == 0 {
            return Err(ConfigError::Zero {
                name: "queue.capacity",
            });
        }
        check_duration("queue.push_timeout_s", self.queue.push_timeout_s)?;
        check_duration("queue.pop_timeout_s", self.queue.pop_timeout_s)?;
        check_duration("source.frame_timeout_s", self.source.frame_timeout_s)?;

        if self.output.preview_every == 0 {
            return Err(ConfigError::Zero {
                name: "output.preview_every",
            });
        }
        Ok(())
    }
}

fn check_duration(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidDuration { name, value })
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = CaptureConfig::new();
        assert_eq!(cfg.threshold, 150);
        assert_eq!(cfg.trace.min_points, 20);
        assert_eq!(cfg.trace.keypoint_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.trace.warmup_delay(), Duration::from_millis(1500));
        assert_eq!(cfg.queue.pop_timeout(), Duration::from_secs(3));
        cfg.validate().unwrap();
    }

    #[test]
    fn inverted_velocity_bounds_fail_fast() {
        let mut cfg = CaptureConfig::new();
        cfg.trace.velocity = VelocityBounds {
            lower_px: 50.0,
            upper_px: 10.0,
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvertedVelocityBounds { .. })
        ));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let mut cfg = CaptureConfig::new();
        cfg.trace.keypoint_timeout_s = -1.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidDuration {
                name: "trace.keypoint_timeout_s",
                ..
            })
        ));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut cfg = CaptureConfig::new();
        cfg.queue.capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.json");
        std::fs::write(
            &path,
            r#"{ "threshold": 120, "trace": { "min_points": 5 }, "queue": { "on_starvation": "continue" } }"#,
        )
        .unwrap();

        let cfg = CaptureConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.threshold, 120);
        assert_eq!(cfg.trace.min_points, 5);
        assert_eq!(cfg.trace.velocity.upper_px, 120.0);
        assert_eq!(cfg.queue.on_starvation, StarvationPolicy::Continue);
        assert_eq!(cfg.segmenter.history, 10);
    }

    #[test]
    fn invalid_json_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.json");
        std::fs::write(
            &path,
            r#"{ "trace": { "velocity": { "lower_px": 200.0, "upper_px": 100.0 } } }"#,
        )
        .unwrap();
        assert!(CaptureConfig::from_json_file(&path).is_err());
    }
}
