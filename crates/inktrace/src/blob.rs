//! Point-like blob extraction from a foreground mask.
//!
//! Outer borders of connected foreground regions are traced, measured with
//! polygon moments, and filtered by color at the centroid, area, circularity
//! (`4π·A / P²`) and convexity (`A / hull area`). Inertia is not filtered.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometry::{arc_length, convex_hull};
use imageproc::point::Point;

use crate::error::ConfigError;

/// Blob filter configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Mask value a blob centroid must land on.
    pub blob_color: u8,
    /// Minimum contour area (pixels²).
    pub min_area: f32,
    /// Maximum contour area (pixels²).
    pub max_area: f32,
    /// Minimum circularity in [0, 1].
    pub min_circularity: f32,
    /// Minimum convexity in [0, 1].
    pub min_convexity: f32,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            blob_color: 255,
            min_area: 0.01,
            max_area: 100.0,
            min_circularity: 0.1,
            min_convexity: 0.1,
        }
    }
}

impl BlobConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = self.min_area.is_finite() && self.max_area.is_finite();
        if !finite || self.min_area < 0.0 || self.min_area > self.max_area {
            return Err(ConfigError::InvertedAreaRange {
                min: self.min_area,
                max: self.max_area,
            });
        }
        for (name, value) in [
            ("blob.min_circularity", self.min_circularity),
            ("blob.min_convexity", self.min_convexity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfUnitRange { name, value });
            }
        }
        Ok(())
    }
}

/// A detected blob centroid.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Keypoint {
    /// X coordinate (pixels).
    pub x: f32,
    /// Y coordinate (pixels).
    pub y: f32,
    /// Blob diameter (pixels).
    pub size: f32,
    /// Contour area (pixels²).
    pub area: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            size: 0.0,
            area: 0.0,
        }
    }

    pub fn position(&self) -> nalgebra::Point2<f32> {
        nalgebra::Point2::new(self.x, self.y)
    }
}

/// Moments of a closed contour polygon.
#[derive(Debug, Clone, Copy)]
struct Shape {
    area: f64,
    cx: f64,
    cy: f64,
}

/// Area and centroid from the shoelace formula. `None` for degenerate contours.
fn polygon_shape(points: &[Point<i32>]) -> Option<Shape> {
    if points.len() < 3 {
        return None;
    }
    let mut a2 = 0.0f64;
    let mut sx = 0.0f64;
    let mut sy = 0.0f64;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        let (x0, y0) = (p.x as f64, p.y as f64);
        let (x1, y1) = (q.x as f64, q.y as f64);
        let cross = x0 * y1 - x1 * y0;
        a2 += cross;
        sx += (x0 + x1) * cross;
        sy += (y0 + y1) * cross;
    }
    if a2.abs() < 1e-12 {
        return None;
    }
    Some(Shape {
        area: 0.5 * a2.abs(),
        cx: sx / (3.0 * a2),
        cy: sy / (3.0 * a2),
    })
}

fn polygon_area(points: &[Point<i32>]) -> f64 {
    polygon_shape(points).map_or(0.0, |s| s.area)
}

fn median_radius(points: &[Point<i32>], cx: f64, cy: f64) -> f64 {
    let mut dists: Vec<f64> = points
        .iter()
        .map(|p| ((p.x as f64 - cx).powi(2) + (p.y as f64 - cy).powi(2)).sqrt())
        .collect();
    dists.sort_by(f64::total_cmp);
    dists[dists.len() / 2]
}

/// Extracts keypoints from binary foreground masks.
#[derive(Debug, Clone, Default)]
pub struct BlobDetector {
    config: BlobConfig,
}

impl BlobDetector {
    pub fn new(config: BlobConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BlobConfig {
        &self.config
    }

    /// Detect blobs in `mask`. Every region passing the filters is reported,
    /// in contour order. Deterministic for identical input.
    pub fn detect(&self, mask: &GrayImage) -> Vec<Keypoint> {
        let (w, h) = mask.dimensions();
        if w == 0 || h == 0 {
            return Vec::new();
        }
        let cfg = &self.config;
        let mut keypoints = Vec::new();

        for contour in find_contours::<i32>(mask) {
            if !matches!(contour.border_type, BorderType::Outer) {
                continue;
            }
            let Some(shape) = polygon_shape(&contour.points) else {
                continue;
            };

            let px = (shape.cx.round().max(0.0) as u32).min(w - 1);
            let py = (shape.cy.round().max(0.0) as u32).min(h - 1);
            if mask.get_pixel(px, py)[0] != cfg.blob_color {
                continue;
            }

            let area = shape.area as f32;
            if area < cfg.min_area || area > cfg.max_area {
                continue;
            }

            let perimeter = arc_length(&contour.points, true);
            if perimeter <= 0.0 {
                continue;
            }
            let circularity =
                (4.0 * std::f64::consts::PI * shape.area / (perimeter * perimeter)) as f32;
            if circularity < cfg.min_circularity {
                continue;
            }

            let hull = convex_hull(contour.points.as_slice());
            let hull_area = polygon_area(&hull);
            if hull_area <= 0.0 {
                continue;
            }
            let convexity = (shape.area / hull_area) as f32;
            if convexity < cfg.min_convexity {
                continue;
            }

            keypoints.push(Keypoint {
                x: shape.cx as f32,
                y: shape.cy as f32,
                size: 2.0 * median_radius(&contour.points, shape.cx, shape.cy) as f32,
                area,
            });
        }

        tracing::trace!("{} blobs", keypoints.len());
        keypoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{draw_disc, draw_rect, uniform};

    fn detector() -> BlobDetector {
        BlobDetector::new(BlobConfig::default())
    }

    #[test]
    fn finds_small_disc_center() {
        let mut mask = uniform(48, 48, 0);
        draw_disc(&mut mask, [20.0, 27.0], 4.0, 255);

        let kps = detector().detect(&mask);
        assert_eq!(kps.len(), 1);
        let kp = kps[0];
        assert!((kp.x - 20.0).abs() < 0.5, "x = {}", kp.x);
        assert!((kp.y - 27.0).abs() < 0.5, "y = {}", kp.y);
        assert!(kp.area > 20.0 && kp.area <= 100.0, "area = {}", kp.area);
        assert!(kp.size > 4.0, "size = {}", kp.size);
    }

    #[test]
    fn oversized_region_is_rejected() {
        let mut mask = uniform(64, 64, 0);
        draw_rect(&mut mask, 10, 10, 30, 30, 255);
        assert!(detector().detect(&mask).is_empty());
    }

    #[test]
    fn ring_centroid_on_background_fails_color_filter() {
        let mut mask = uniform(48, 48, 0);
        draw_disc(&mut mask, [24.0, 24.0], 5.0, 255);
        draw_disc(&mut mask, [24.0, 24.0], 2.5, 0);
        assert!(detector().detect(&mask).is_empty());
    }

    #[test]
    fn concave_shape_fails_convexity_filter() {
        let mut mask = uniform(48, 48, 0);
        // plus sign centered on (24, 24)
        draw_rect(&mut mask, 17, 22, 15, 5, 255);
        draw_rect(&mut mask, 22, 17, 5, 15, 255);
        let loose = BlobConfig {
            max_area: 1000.0,
            min_circularity: 0.0,
            min_convexity: 0.0,
            ..BlobConfig::default()
        };
        assert_eq!(BlobDetector::new(loose.clone()).detect(&mask).len(), 1);

        let strict = BlobDetector::new(BlobConfig {
            min_convexity: 0.9,
            ..loose
        });
        assert!(strict.detect(&mask).is_empty());
    }

    #[test]
    fn close_blobs_are_both_reported() {
        let mut mask = uniform(48, 48, 0);
        draw_disc(&mut mask, [20.0, 20.0], 4.0, 255);
        draw_disc(&mut mask, [27.0, 27.0], 2.0, 255);
        let mut kps = detector().detect(&mask);
        assert_eq!(kps.len(), 2);
        kps.sort_by(|a, b| a.x.total_cmp(&b.x));
        assert!((kps[0].x - 20.0).abs() < 0.5);
        assert!((kps[1].x - 27.0).abs() < 0.5);
    }

    #[test]
    fn separate_blobs_are_all_reported_deterministically() {
        let mut mask = uniform(96, 48, 0);
        draw_disc(&mut mask, [15.0, 20.0], 3.0, 255);
        draw_disc(&mut mask, [50.0, 20.0], 4.0, 255);
        draw_disc(&mut mask, [80.0, 30.0], 3.0, 255);
        let det = detector();
        let a = det.detect(&mask);
        let b = det.detect(&mask);
        assert_eq!(a.len(), 3);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_mask_has_no_blobs() {
        assert!(detector().detect(&uniform(32, 32, 0)).is_empty());
        assert!(detector().detect(&GrayImage::new(0, 0)).is_empty());
    }

    #[test]
    fn inverted_area_range_is_rejected() {
        let cfg = BlobConfig {
            min_area: 50.0,
            max_area: 10.0,
            ..BlobConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvertedAreaRange { .. })
        ));
    }
}
