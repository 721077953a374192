//! Accumulated ink trace: accepted points plus the stroke canvas.

use std::time::Duration;

use image::{GrayImage, Luma};
use imageproc::drawing::draw_line_segment_mut;
use nalgebra::Point2;

use crate::error::ConfigError;

/// Stroke intensity on the trace canvas.
pub const INK: u8 = 255;

/// Accepted band for the distance between consecutive trace points.
///
/// Both ends are inclusive: a candidate exactly `lower_px` or `upper_px` away
/// from the last accepted point is accepted.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct VelocityBounds {
    /// Smaller steps are jitter (pixels).
    pub lower_px: f32,
    /// Larger steps are a different object (pixels).
    pub upper_px: f32,
}

impl Default for VelocityBounds {
    fn default() -> Self {
        Self {
            lower_px: 10.0,
            upper_px: 120.0,
        }
    }
}

impl VelocityBounds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = self.lower_px.is_finite() && self.upper_px.is_finite();
        if !finite || self.lower_px < 0.0 {
            return Err(ConfigError::InvalidVelocityBounds {
                lower: self.lower_px,
                upper: self.upper_px,
            });
        }
        if self.lower_px > self.upper_px {
            return Err(ConfigError::InvertedVelocityBounds {
                lower: self.lower_px,
                upper: self.upper_px,
            });
        }
        Ok(())
    }

    /// Classify a step of `distance` pixels.
    pub fn classify(&self, distance: f32) -> Offer {
        if distance < self.lower_px {
            Offer::TooClose
        } else if distance > self.upper_px {
            Offer::TooFar
        } else {
            Offer::Accepted
        }
    }
}

/// Result of offering a candidate point to a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// Closer than the lower velocity bound to the last point.
    TooClose,
    /// Farther than the upper velocity bound from the last point.
    TooFar,
    /// Outside the canvas.
    OutOfBounds,
}

/// One gesture in progress.
///
/// Accepting a point never draws. The engine calls [`Trace::stroke_last`]
/// once per tick, so the canvas carries strokes exactly when at least two
/// points were accepted.
#[derive(Debug, Clone)]
pub struct Trace {
    points: Vec<Point2<f32>>,
    canvas: GrayImage,
    last_point_at: Option<Duration>,
    reset_at: Duration,
}

impl Trace {
    /// Empty trace with a zeroed `width × height` canvas, reset at `now`.
    pub fn new(width: u32, height: u32, now: Duration) -> Self {
        Self {
            points: Vec::new(),
            canvas: GrayImage::new(width, height),
            last_point_at: None,
            reset_at: now,
        }
    }

    pub fn points(&self) -> &[Point2<f32>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn canvas(&self) -> &GrayImage {
        &self.canvas
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.canvas.dimensions()
    }

    pub fn last_point_at(&self) -> Option<Duration> {
        self.last_point_at
    }

    pub fn reset_at(&self) -> Duration {
        self.reset_at
    }

    pub fn has_strokes(&self) -> bool {
        self.canvas.as_raw().iter().any(|&v| v != 0)
    }

    /// True once `warmup` has elapsed since the reset.
    pub fn is_ready(&self, now: Duration, warmup: Duration) -> bool {
        now.saturating_sub(self.reset_at) >= warmup
    }

    /// True when the last accepted point is at least `timeout` old.
    /// A trace without points never goes stale.
    pub fn is_stale(&self, now: Duration, timeout: Duration) -> bool {
        self.last_point_at
            .is_some_and(|last| now.saturating_sub(last) >= timeout)
    }

    /// Offer `candidate` observed at `now`.
    ///
    /// The first in-bounds point is always accepted; later ones must fall in
    /// the velocity band around the last accepted point.
    pub fn offer(
        &mut self,
        candidate: Point2<f32>,
        now: Duration,
        bounds: &VelocityBounds,
    ) -> Offer {
        if !self.contains(candidate) {
            return Offer::OutOfBounds;
        }
        if let Some(&last) = self.points.last() {
            let verdict = bounds.classify((candidate - last).norm());
            if verdict != Offer::Accepted {
                return verdict;
            }
        }
        self.points.push(candidate);
        self.last_point_at = Some(now);
        Offer::Accepted
    }

    /// Draw the segment between the last two accepted points. Returns false
    /// when there are fewer than two.
    pub fn stroke_last(&mut self, thickness: u32) -> bool {
        let [.., from, to] = self.points.as_slice() else {
            return false;
        };
        draw_stroke(&mut self.canvas, *from, *to, thickness);
        true
    }

    /// Give up the canvas, e.g. to hand it to a writer.
    pub fn into_canvas(self) -> GrayImage {
        self.canvas
    }

    fn contains(&self, p: Point2<f32>) -> bool {
        let (w, h) = self.canvas.dimensions();
        p.x.is_finite()
            && p.y.is_finite()
            && p.x >= 0.0
            && p.y >= 0.0
            && p.x < w as f32
            && p.y < h as f32
    }
}

/// Draw a segment with a square brush `thickness` pixels wide.
fn draw_stroke(canvas: &mut GrayImage, from: Point2<f32>, to: Point2<f32>, thickness: u32) {
    let t = thickness.max(1) as i32;
    let lo = -(t - 1) / 2;
    for oy in lo..lo + t {
        for ox in lo..lo + t {
            let (dx, dy) = (ox as f32, oy as f32);
            draw_line_segment_mut(
                canvas,
                (from.x + dx, from.y + dy),
                (to.x + dx, to.y + dy),
                Luma([INK]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn offer(trace: &mut Trace, x: f32, y: f32) -> Offer {
        trace.offer(Point2::new(x, y), at(0), &VelocityBounds::default())
    }

    #[test]
    fn first_point_is_always_accepted_without_stroke() {
        let mut trace = Trace::new(64, 64, at(0));
        assert_eq!(offer(&mut trace, 30.0, 30.0), Offer::Accepted);
        assert_eq!(trace.len(), 1);
        assert!(!trace.has_strokes());
        assert_eq!(trace.last_point_at(), Some(at(0)));
    }

    #[test]
    fn velocity_band_is_inclusive() {
        let mut trace = Trace::new(256, 64, at(0));
        assert_eq!(offer(&mut trace, 0.0, 0.0), Offer::Accepted);
        assert_eq!(offer(&mut trace, 9.99, 0.0), Offer::TooClose);
        assert_eq!(offer(&mut trace, 10.0, 0.0), Offer::Accepted);
        assert_eq!(offer(&mut trace, 130.01, 0.0), Offer::TooFar);
        assert_eq!(offer(&mut trace, 130.0, 0.0), Offer::Accepted);
        assert_eq!(trace.len(), 3);
    }

    #[test]
    fn teleport_is_rejected() {
        let mut trace = Trace::new(512, 512, at(0));
        offer(&mut trace, 0.0, 0.0);
        assert_eq!(offer(&mut trace, 500.0, 500.0), Offer::TooFar);
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn strokes_exist_iff_two_points() {
        let mut trace = Trace::new(128, 128, at(0));
        assert!(!trace.stroke_last(2));
        offer(&mut trace, 20.0, 20.0);
        assert!(!trace.stroke_last(2));
        assert!(!trace.has_strokes());
        offer(&mut trace, 60.0, 20.0);
        assert!(!trace.has_strokes());
        assert!(trace.stroke_last(2));
        let canvas = trace.canvas();
        assert_eq!(canvas.get_pixel(40, 20)[0], INK);
        assert_eq!(canvas.get_pixel(40, 60)[0], 0);
    }

    #[test]
    fn stroke_joins_only_the_last_two_points() {
        let mut trace = Trace::new(128, 128, at(0));
        offer(&mut trace, 10.0, 10.0);
        offer(&mut trace, 40.0, 10.0);
        offer(&mut trace, 70.0, 10.0);
        assert!(trace.stroke_last(1));
        assert_eq!(trace.canvas().get_pixel(25, 10)[0], 0);
        assert_eq!(trace.canvas().get_pixel(55, 10)[0], INK);
    }

    #[test]
    fn rejected_candidates_leave_trace_unchanged() {
        let mut trace = Trace::new(64, 64, at(0));
        assert_eq!(offer(&mut trace, -1.0, 3.0), Offer::OutOfBounds);
        assert_eq!(offer(&mut trace, 64.0, 3.0), Offer::OutOfBounds);
        assert_eq!(offer(&mut trace, f32::NAN, 3.0), Offer::OutOfBounds);
        assert!(trace.is_empty());
        assert_eq!(trace.last_point_at(), None);
    }

    #[test]
    fn readiness_and_staleness_are_inclusive() {
        let mut trace = Trace::new(32, 32, at(1000));
        let warmup = at(1500);
        assert!(!trace.is_ready(at(2000), warmup));
        assert!(trace.is_ready(at(2500), warmup));

        let timeout = at(1000);
        assert!(!trace.is_stale(at(9000), timeout));
        trace.offer(Point2::new(5.0, 5.0), at(3000), &VelocityBounds::default());
        assert!(!trace.is_stale(at(3999), timeout));
        assert!(trace.is_stale(at(4000), timeout));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let bounds = VelocityBounds {
            lower_px: 30.0,
            upper_px: 20.0,
        };
        assert!(matches!(
            bounds.validate(),
            Err(ConfigError::InvertedVelocityBounds { .. })
        ));
        let negative = VelocityBounds {
            lower_px: -1.0,
            upper_px: 20.0,
        };
        assert!(negative.validate().is_err());
    }
}
