//! Shared helpers for image-based unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{GrayImage, Luma};

use crate::error::PersistError;
use crate::frame::{Frame, IrImage};
use crate::persist::{TraceId, TraceSink};

/// Image filled with a single value.
pub(crate) fn uniform(w: u32, h: u32, value: u8) -> GrayImage {
    GrayImage::from_pixel(w, h, Luma([value]))
}

/// Paint every pixel within `radius` of `center` with `value`.
pub(crate) fn draw_disc(img: &mut GrayImage, center: [f32; 2], radius: f32, value: u8) {
    let (w, h) = img.dimensions();
    for y in 0..h {
        for x in 0..w {
            let dx = x as f32 - center[0];
            let dy = y as f32 - center[1];
            if dx * dx + dy * dy <= radius * radius {
                img.put_pixel(x, y, Luma([value]));
            }
        }
    }
}

/// Paint the axis-aligned rectangle `[x, x + w) × [y, y + h)`, clipped.
pub(crate) fn draw_rect(img: &mut GrayImage, x: u32, y: u32, w: u32, h: u32, value: u8) {
    let (iw, ih) = img.dimensions();
    for yy in y..(y + h).min(ih) {
        for xx in x..(x + w).min(iw) {
            img.put_pixel(xx, yy, Luma([value]));
        }
    }
}

/// Float infrared frame from an 8-bit picture (`v / 255`).
pub(crate) fn ir_frame(sequence: u64, timestamp: Duration, gray: &GrayImage) -> Frame {
    let (w, h) = gray.dimensions();
    let data = gray.as_raw().iter().map(|&v| f32::from(v) / 255.0).collect();
    let image = IrImage::from_raw(w, h, data).expect("buffer length matches dimensions");
    Frame::new(sequence, timestamp, image)
}

/// One trace handed to a [`RecordingSink`].
#[derive(Debug, Clone)]
pub(crate) struct Persisted {
    pub id: TraceId,
    pub points: usize,
    pub canvas: GrayImage,
}

/// Sink that keeps every persisted trace in memory.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingSink {
    pub traces: Arc<Mutex<Vec<Persisted>>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.traces.lock().unwrap().len()
    }

    pub fn points(&self) -> Vec<usize> {
        self.traces.lock().unwrap().iter().map(|t| t.points).collect()
    }
}

impl TraceSink for RecordingSink {
    fn persist(
        &mut self,
        canvas: GrayImage,
        id: TraceId,
        points: usize,
    ) -> Result<(), PersistError> {
        self.traces.lock().unwrap().push(Persisted { id, points, canvas });
        Ok(())
    }
}

/// Sink whose every write fails.
#[derive(Debug, Default)]
pub(crate) struct FailingSink;

impl TraceSink for FailingSink {
    fn persist(
        &mut self,
        _canvas: GrayImage,
        _id: TraceId,
        _points: usize,
    ) -> Result<(), PersistError> {
        Err(PersistError::WriterGone)
    }
}
