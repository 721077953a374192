//! Frame sources that need no sensor: directory replay and a synthetic
//! gesture scene.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::{ImageFormat, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::SourceError;
use crate::frame::{Frame, IrImage};
use crate::session::FrameSource;

fn frame_time(index: u64, fps: f64) -> Duration {
    Duration::try_from_secs_f64(index as f64 / fps).unwrap_or(Duration::ZERO)
}

/// Sleep until `timestamp` has elapsed since `origin`.
fn pace(origin: Instant, timestamp: Duration) {
    let due = origin + timestamp;
    let now = Instant::now();
    if due > now {
        std::thread::sleep(due - now);
    }
}

/// Plays back a directory of recorded infrared frames.
///
/// Every file whose extension names a raster format is a frame; frames play
/// in lexical file-name order and are converted to float luminance in [0, 1].
#[derive(Debug)]
pub struct ReplaySource {
    dir: PathBuf,
    fps: f64,
    realtime: bool,
    files: Vec<PathBuf>,
    next: usize,
    origin: Option<Instant>,
}

impl ReplaySource {
    pub fn new(dir: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            dir: dir.into(),
            fps: if fps > 0.0 { fps } else { 30.0 },
            realtime: false,
            files: Vec::new(),
            next: 0,
            origin: None,
        }
    }

    /// Deliver frames no faster than their timestamps.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Frames found by the last `start`.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn list(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
        let list_err = |source| SourceError::List {
            path: dir.to_path_buf(),
            source,
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(list_err)? {
            let path = entry.map_err(list_err)?.path();
            if path.is_file() && ImageFormat::from_path(&path).is_ok() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl FrameSource for ReplaySource {
    fn start(&mut self) -> Result<(), SourceError> {
        if self.origin.is_none() {
            self.files = Self::list(&self.dir)?;
            self.next = 0;
            tracing::info!("replaying {} frames from {}", self.files.len(), self.dir.display());
        }
        self.origin = Some(Instant::now());
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Option<Frame>, SourceError> {
        let origin = self.origin.ok_or(SourceError::NotStarted)?;
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        let image = image::open(path)
            .map_err(|source| SourceError::Read {
                path: path.clone(),
                source,
            })?
            .to_luma32f();

        let sequence = self.next as u64;
        let timestamp = frame_time(sequence, self.fps);
        if self.realtime {
            pace(origin, timestamp);
        }
        self.next += 1;
        Ok(Some(Frame::new(sequence, timestamp, image)))
    }

    fn restart(&mut self) -> Result<(), SourceError> {
        tracing::debug!("replay restart resumes at frame {}", self.next);
        self.origin = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Scene rendered by [`SyntheticSource`].
///
/// A noise floor, a static bright reflector in the top-right corner, and a
/// spot that travels around a circle for `gesture_frames`, then vanishes for
/// `idle_frames`, repeating after an initial `lead_in_frames` of empty scene.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub seed: u64,
    /// Upper bound of the uniform noise floor.
    pub noise: f32,
    /// Spot intensity; the reflector is always 1.0.
    pub spot_level: f32,
    pub spot_radius: f32,
    /// Radius of the circular gesture around the image center (pixels).
    pub orbit_radius: f32,
    /// Angle advanced per frame (radians).
    pub angular_step: f32,
    pub lead_in_frames: u64,
    pub gesture_frames: u64,
    pub idle_frames: u64,
    /// End the stream after this many frames.
    pub frame_limit: Option<u64>,
}

impl Default for SyntheticScene {
    fn default() -> Self {
        Self {
            width: 512,
            height: 424,
            fps: 30.0,
            seed: 7,
            noise: 0.05,
            spot_level: 0.9,
            spot_radius: 4.0,
            orbit_radius: 80.0,
            angular_step: 0.25,
            lead_in_frames: 50,
            gesture_frames: 40,
            idle_frames: 40,
            frame_limit: None,
        }
    }
}

impl SyntheticScene {
    /// Spot center in frame `index`, if the spot is visible.
    pub fn spot_at(&self, index: u64) -> Option<[f32; 2]> {
        let k = index.checked_sub(self.lead_in_frames)?;
        let period = (self.gesture_frames + self.idle_frames).max(1);
        let phase = k % period;
        if phase >= self.gesture_frames {
            return None;
        }
        let angle = phase as f32 * self.angular_step;
        let cx = self.width as f32 * 0.5 + self.orbit_radius * angle.cos();
        let cy = self.height as f32 * 0.5 + self.orbit_radius * angle.sin();
        Some([cx, cy])
    }
}

/// Deterministic synthetic infrared stream.
#[derive(Debug)]
pub struct SyntheticSource {
    scene: SyntheticScene,
    rng: StdRng,
    index: u64,
    realtime: bool,
    origin: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(scene: SyntheticScene) -> Self {
        Self {
            rng: StdRng::seed_from_u64(scene.seed),
            scene,
            index: 0,
            realtime: false,
            origin: None,
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn scene(&self) -> &SyntheticScene {
        &self.scene
    }

    fn render(&mut self, index: u64) -> IrImage {
        let s = &self.scene;
        let mut img = IrImage::from_fn(s.width, s.height, |_, _| Luma([0.0]));
        if s.noise > 0.0 {
            for v in img.iter_mut() {
                *v = self.rng.gen_range(0.0..s.noise);
            }
        }

        let block = (s.width.min(s.height) / 16).max(2);
        let x0 = s.width.saturating_sub(2 * block);
        for y in block..(2 * block).min(s.height) {
            for x in x0..(x0 + block).min(s.width) {
                img.put_pixel(x, y, Luma([1.0]));
            }
        }

        if let Some([cx, cy]) = s.spot_at(index) {
            let r = s.spot_radius;
            let y_lo = (cy - r).floor().max(0.0) as u32;
            let x_lo = (cx - r).floor().max(0.0) as u32;
            let y_hi = ((cy + r).ceil().max(0.0) as u32).min(s.height.saturating_sub(1));
            let x_hi = ((cx + r).ceil().max(0.0) as u32).min(s.width.saturating_sub(1));
            for y in y_lo..=y_hi {
                for x in x_lo..=x_hi {
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    if dx * dx + dy * dy <= r * r {
                        img.put_pixel(x, y, Luma([s.spot_level]));
                    }
                }
            }
        }
        img
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self) -> Result<(), SourceError> {
        if self.origin.is_none() {
            tracing::info!(
                "synthetic scene {}x{} at {} fps",
                self.scene.width,
                self.scene.height,
                self.scene.fps
            );
        }
        self.origin = Some(Instant::now());
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Option<Frame>, SourceError> {
        let origin = self.origin.ok_or(SourceError::NotStarted)?;
        if self.scene.frame_limit.is_some_and(|limit| self.index >= limit) {
            return Ok(None);
        }
        let index = self.index;
        let image = self.render(index);
        let timestamp = frame_time(index, self.scene.fps);
        if self.realtime {
            pace(origin, timestamp);
        }
        self.index += 1;
        Ok(Some(Frame::new(index, timestamp, image)))
    }

    fn stop(&mut self) {}
}
