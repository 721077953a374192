//! Debug surfaces for a processed tick.
//!
//! Three views are produced: keypoints over black, keypoints over the
//! normalized frame, and the trace canvas. [`PreviewDumper`] writes them to
//! disk every n-th tick; window management is left to the embedding app.

use std::path::PathBuf;

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_circle_mut;

use crate::blob::Keypoint;
use crate::engine::TickReport;

/// Marker color for keypoints.
pub const KEYPOINT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Everything an observer may look at after a tick.
#[derive(Debug, Clone, Copy)]
pub struct TickView<'a> {
    pub report: &'a TickReport,
    /// Normalized frame, before the dim-noise threshold.
    pub frame: &'a GrayImage,
    pub mask: &'a GrayImage,
    pub canvas: Option<&'a GrayImage>,
}

/// Called by the engine at the end of every processed tick.
pub trait TickObserver: Send {
    fn observe(&mut self, view: &TickView<'_>);
}

fn draw_keypoints(img: &mut RgbImage, keypoints: &[Keypoint]) {
    for kp in keypoints {
        let radius = (kp.size * 0.5).round().max(3.0) as i32;
        let center = (kp.x.round() as i32, kp.y.round() as i32);
        draw_hollow_circle_mut(img, center, radius, KEYPOINT_COLOR);
    }
}

/// Keypoints drawn over a black `width × height` surface.
pub fn render_keypoints(width: u32, height: u32, keypoints: &[Keypoint]) -> RgbImage {
    let mut img = RgbImage::new(width, height);
    draw_keypoints(&mut img, keypoints);
    img
}

/// Keypoints drawn over `frame`.
pub fn render_overlay(frame: &GrayImage, keypoints: &[Keypoint]) -> RgbImage {
    let mut img = RgbImage::from_fn(frame.width(), frame.height(), |x, y| {
        let v = frame.get_pixel(x, y)[0];
        Rgb([v, v, v])
    });
    draw_keypoints(&mut img, keypoints);
    img
}

/// Writes the three preview surfaces as PNG every `every` ticks.
#[derive(Debug, Clone)]
pub struct PreviewDumper {
    dir: PathBuf,
    every: usize,
    ticks: usize,
}

impl PreviewDumper {
    pub fn new(dir: impl Into<PathBuf>, every: usize) -> Self {
        Self {
            dir: dir.into(),
            every: every.max(1),
            ticks: 0,
        }
    }

    fn dump(&self, view: &TickView<'_>) -> Result<(), image::ImageError> {
        std::fs::create_dir_all(&self.dir)?;
        let seq = view.report.sequence;
        let (w, h) = view.frame.dimensions();
        render_keypoints(w, h, &view.report.keypoints)
            .save(self.dir.join(format!("{seq:08}_keypoints.png")))?;
        render_overlay(view.frame, &view.report.keypoints)
            .save(self.dir.join(format!("{seq:08}_overlay.png")))?;
        if let Some(canvas) = view.canvas {
            canvas.save(self.dir.join(format!("{seq:08}_trace.png")))?;
        }
        Ok(())
    }
}

impl TickObserver for PreviewDumper {
    fn observe(&mut self, view: &TickView<'_>) {
        self.ticks += 1;
        if self.ticks % self.every != 0 {
            return;
        }
        if let Err(err) = self.dump(view) {
            tracing::warn!("preview dump to {} failed: {}", self.dir.display(), err);
        }
    }
}
