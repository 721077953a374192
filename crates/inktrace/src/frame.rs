//! Infrared frames and their conversion to 8-bit intensity.
//!
//! Frames arrive from the sensor as 32-bit float luminance. The delivery
//! thread optionally rescales each frame by its peak sample; the worker then
//! converts to [`GrayImage`] and zeroes dim noise before segmentation.

use std::time::Duration;

use image::{GrayImage, ImageBuffer, Luma};

use crate::error::FrameError;

/// Raw infrared image: one float sample per pixel, nominally in [0, 1].
pub type IrImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// One captured infrared frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic frame counter assigned by the source.
    pub sequence: u64,
    /// Capture time relative to the start of the session.
    pub timestamp: Duration,
    pub image: IrImage,
}

impl Frame {
    pub fn new(sequence: u64, timestamp: Duration, image: IrImage) -> Self {
        Self {
            sequence,
            timestamp,
            image,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Divide every sample by the frame's peak value, in place.
///
/// Frames whose peak is zero (or not finite) are left untouched.
pub fn normalize_peak(image: &mut IrImage) {
    let peak = image
        .as_raw()
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(0.0f32, f32::max);
    if peak <= 0.0 {
        return;
    }
    for v in image.iter_mut() {
        *v /= peak;
    }
}

/// Convert a float infrared frame to 8-bit intensity (`trunc(v * 255)`).
///
/// Samples are clamped to [0, 1] first. The source buffer is not modified.
pub fn to_gray(image: &IrImage) -> Result<GrayImage, FrameError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(FrameError::Empty { width, height });
    }

    let mut data = Vec::with_capacity(image.as_raw().len());
    for (idx, &v) in image.as_raw().iter().enumerate() {
        if !v.is_finite() {
            let idx = idx as u32;
            return Err(FrameError::NonFinite {
                x: idx % width,
                y: idx / width,
            });
        }
        data.push((v.clamp(0.0, 1.0) * 255.0) as u8);
    }
    Ok(GrayImage::from_raw(width, height, data).expect("buffer length matches dimensions"))
}

/// Zero every sample below `threshold`, in place.
pub fn threshold_dim(gray: &mut GrayImage, threshold: u8) {
    for v in gray.iter_mut() {
        if *v < threshold {
            *v = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ir(width: u32, height: u32, samples: &[f32]) -> IrImage {
        IrImage::from_raw(width, height, samples.to_vec()).unwrap()
    }

    #[test]
    fn to_gray_scales_and_truncates() {
        let img = ir(4, 1, &[0.0, 0.5, 0.999, 1.0]);
        let gray = to_gray(&img).unwrap();
        assert_eq!(gray.as_raw(), &vec![0u8, 127, 254, 255]);
        // Source is untouched.
        assert_eq!(img.get_pixel(1, 0)[0], 0.5);
    }

    #[test]
    fn to_gray_clamps_out_of_range() {
        let gray = to_gray(&ir(2, 1, &[-0.3, 7.0])).unwrap();
        assert_eq!(gray.as_raw(), &vec![0u8, 255]);
    }

    #[test]
    fn empty_frame_fails_fast() {
        let err = to_gray(&IrImage::new(0, 0)).unwrap_err();
        assert!(matches!(err, FrameError::Empty { .. }));
    }

    #[test]
    fn non_finite_sample_is_reported_with_position() {
        let err = to_gray(&ir(3, 2, &[0.0, 0.0, 0.0, 0.0, f32::NAN, 0.0])).unwrap_err();
        assert!(matches!(err, FrameError::NonFinite { x: 1, y: 1 }));
    }

    #[test]
    fn peak_normalization_maps_max_to_one() {
        let mut img = ir(3, 1, &[100.0, 400.0, 800.0]);
        normalize_peak(&mut img);
        assert_eq!(img.as_raw(), &vec![0.125, 0.5, 1.0]);

        let mut dark = ir(2, 1, &[0.0, 0.0]);
        normalize_peak(&mut dark);
        assert_eq!(dark.as_raw(), &vec![0.0, 0.0]);
    }

    #[test]
    fn threshold_zeroes_dim_samples_only() {
        let mut gray = GrayImage::from_raw(4, 1, vec![10, 149, 150, 255]).unwrap();
        threshold_dim(&mut gray, 150);
        assert_eq!(gray.as_raw(), &vec![0u8, 0, 150, 255]);
    }
}
