//! Adaptive mixture-of-Gaussians background subtraction.
//!
//! Every pixel keeps up to `n_mixtures` Gaussian modes (weight, mean,
//! variance), sorted by weight. A sample is background when it lies within
//! `var_threshold` squared standard deviations of one of the leading modes
//! whose cumulative weight stays below `background_ratio`. The model learns
//! with rate `1 / min(2n, history)` until it has seen `history` frames, then
//! settles at `1 / history` unless a fixed `learning_rate` is configured.
//!
//! The model is plain owned state with no interior synchronization; the
//! trace worker is its only user.

use image::GrayImage;

use crate::error::ConfigError;

/// Parameters of the background model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Number of frames the model effectively averages over.
    pub history: u32,
    /// Squared Mahalanobis distance below which a sample counts as background.
    pub var_threshold: f32,
    /// Maximum Gaussian modes per pixel.
    pub n_mixtures: usize,
    /// Cumulative mode weight considered to model the background.
    pub background_ratio: f32,
    /// Squared Mahalanobis distance below which a sample updates a mode.
    pub var_threshold_gen: f32,
    /// Variance assigned to newly created modes.
    pub var_init: f32,
    pub var_min: f32,
    pub var_max: f32,
    /// Weight decay that prunes modes without support.
    pub complexity_reduction: f32,
    /// Fixed learning rate; `None` uses the history-based schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f32>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            history: 10,
            var_threshold: 500.0,
            n_mixtures: 5,
            background_ratio: 0.9,
            var_threshold_gen: 9.0,
            var_init: 15.0,
            var_min: 4.0,
            var_max: 75.0,
            complexity_reduction: 0.05,
            learning_rate: None,
        }
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history == 0 {
            return Err(ConfigError::Zero {
                name: "segmenter.history",
            });
        }
        if self.n_mixtures == 0 {
            return Err(ConfigError::Zero {
                name: "segmenter.n_mixtures",
            });
        }
        if !(self.var_threshold > 0.0) {
            return Err(ConfigError::Zero {
                name: "segmenter.var_threshold",
            });
        }
        if !(self.var_threshold_gen > 0.0) {
            return Err(ConfigError::Zero {
                name: "segmenter.var_threshold_gen",
            });
        }
        unit("segmenter.background_ratio", self.background_ratio)?;
        unit("segmenter.complexity_reduction", self.complexity_reduction)?;
        if let Some(rate) = self.learning_rate {
            unit("segmenter.learning_rate", rate)?;
        }
        let ordered = self.var_min > 0.0
            && self.var_min <= self.var_init
            && self.var_init <= self.var_max
            && self.var_max.is_finite();
        if !ordered {
            return Err(ConfigError::InvalidVariance {
                min: self.var_min,
                init: self.var_init,
                max: self.var_max,
            });
        }
        Ok(())
    }
}

fn unit(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { name, value })
    }
}

/// Mask value for foreground pixels.
pub const FOREGROUND: u8 = 255;
/// Mask value for background pixels.
pub const BACKGROUND: u8 = 0;

#[derive(Debug, Clone, Copy, Default)]
struct Mode {
    weight: f32,
    mean: f32,
    var: f32,
}

/// Per-pixel Gaussian mixture background model.
pub struct MotionSegmenter {
    config: SegmenterConfig,
    width: u32,
    height: u32,
    /// `n_mixtures` slots per pixel; the first `used[i]` are live.
    modes: Vec<Mode>,
    used: Vec<usize>,
    frames_seen: u64,
}

impl MotionSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            width: 0,
            height: 0,
            modes: Vec::new(),
            used: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Number of frames applied since the model was (re)initialized.
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// True once the model has absorbed `history` frames.
    pub fn is_seeded(&self) -> bool {
        self.frames_seen >= u64::from(self.config.history)
    }

    /// Drop all learned state.
    pub fn reset(&mut self) {
        self.width = 0;
        self.height = 0;
        self.modes.clear();
        self.used.clear();
        self.frames_seen = 0;
    }

    fn learning_rate(&self) -> f32 {
        match self.config.learning_rate {
            Some(rate) if self.frames_seen > 1 => rate,
            _ => {
                let n = (2 * self.frames_seen).min(u64::from(self.config.history));
                1.0 / n.max(1) as f32
            }
        }
    }

    fn ensure_shape(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height && !self.used.is_empty() {
            return;
        }
        if self.frames_seen > 0 {
            tracing::warn!(
                "frame size changed from {}x{} to {}x{}; reinitializing background model",
                self.width,
                self.height,
                width,
                height
            );
        }
        let n = width as usize * height as usize;
        self.width = width;
        self.height = height;
        self.modes = vec![Mode::default(); n * self.config.n_mixtures];
        self.used = vec![0; n];
        self.frames_seen = 0;
    }

    /// Update the model with `frame` and return its foreground mask.
    pub fn apply(&mut self, frame: &GrayImage) -> GrayImage {
        let (width, height) = frame.dimensions();
        self.ensure_shape(width, height);
        self.frames_seen += 1;

        let alpha = self.learning_rate();
        let k = self.config.n_mixtures;
        let mut mask = vec![BACKGROUND; frame.as_raw().len()];

        for (idx, &sample) in frame.as_raw().iter().enumerate() {
            let slots = &mut self.modes[idx * k..(idx + 1) * k];
            let used = &mut self.used[idx];
            if !update_pixel(&self.config, slots, used, f32::from(sample), alpha) {
                mask[idx] = FOREGROUND;
            }
        }

        GrayImage::from_raw(width, height, mask).expect("mask dimensions match frame")
    }
}

/// Update one pixel's mixture with `x`. Returns true when `x` is background.
fn update_pixel(
    cfg: &SegmenterConfig,
    slots: &mut [Mode],
    used: &mut usize,
    x: f32,
    alpha: f32,
) -> bool {
    let prune = -alpha * cfg.complexity_reduction;
    let decay = 1.0 - alpha;
    let mut n = *used;
    let mut background = false;
    let mut fits = false;
    let mut cumulative = 0.0f32;

    for mode in slots.iter_mut().take(n) {
        let mut weight = decay * mode.weight + prune;
        if !fits {
            let d = mode.mean - x;
            let dist2 = d * d;
            if cumulative < cfg.background_ratio && dist2 < cfg.var_threshold * mode.var {
                background = true;
            }
            if dist2 < cfg.var_threshold_gen * mode.var {
                fits = true;
                weight += alpha;
                let k = alpha / weight;
                mode.mean -= k * d;
                mode.var = (mode.var + k * (dist2 - mode.var)).clamp(cfg.var_min, cfg.var_max);
            }
        }
        // Background membership uses last frame's weights.
        cumulative += mode.weight;
        mode.weight = weight.max(0.0);
    }

    // Drop modes that lost all support and restore weight order.
    let live = &mut slots[..n];
    live.sort_by(|a, b| b.weight.total_cmp(&a.weight));
    while n > 0 && slots[n - 1].weight <= 0.0 {
        n -= 1;
    }

    if !fits {
        let slot = if n == slots.len() { n - 1 } else { n };
        if slot == n {
            n += 1;
        }
        for mode in slots.iter_mut().take(n) {
            mode.weight *= decay;
        }
        slots[slot] = Mode {
            weight: if n == 1 { 1.0 } else { alpha },
            mean: x,
            var: cfg.var_init,
        };
        slots[..n].sort_by(|a, b| b.weight.total_cmp(&a.weight));
    }

    let total: f32 = slots[..n].iter().map(|m| m.weight).sum();
    if total > 0.0 {
        for mode in slots.iter_mut().take(n) {
            mode.weight /= total;
        }
    }

    *used = n;
    background
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{draw_disc, uniform};

    fn segmenter() -> MotionSegmenter {
        MotionSegmenter::new(SegmenterConfig::default())
    }

    #[test]
    fn first_frame_is_all_foreground() {
        let mut seg = segmenter();
        let mask = seg.apply(&uniform(16, 12, 0));
        assert!(mask.as_raw().iter().all(|&v| v == FOREGROUND));
        assert_eq!(seg.frames_seen(), 1);
        assert!(!seg.is_seeded());
    }

    #[test]
    fn static_scene_becomes_background() {
        let mut seg = segmenter();
        let mut scene = uniform(32, 32, 0);
        draw_disc(&mut scene, [8.0, 8.0], 3.0, 200);
        let mask = (0..12).map(|_| seg.apply(&scene)).last().unwrap();
        assert!(seg.is_seeded());
        assert!(mask.as_raw().iter().all(|&v| v == BACKGROUND));
    }

    #[test]
    fn new_bright_object_is_foreground() {
        let mut seg = segmenter();
        let dark = uniform(40, 40, 0);
        for _ in 0..15 {
            seg.apply(&dark);
        }
        let mut lit = dark.clone();
        draw_disc(&mut lit, [20.0, 20.0], 4.0, 255);
        let mask = seg.apply(&lit);

        assert_eq!(mask.get_pixel(20, 20)[0], FOREGROUND);
        assert_eq!(mask.get_pixel(2, 2)[0], BACKGROUND);
        let fg = mask.as_raw().iter().filter(|&&v| v == FOREGROUND).count();
        let lit_px = lit.as_raw().iter().filter(|&&v| v == 255).count();
        assert_eq!(fg, lit_px);
    }

    #[test]
    fn moving_object_leaves_no_ghost() {
        let mut seg = segmenter();
        let dark = uniform(64, 32, 0);
        for _ in 0..15 {
            seg.apply(&dark);
        }
        let mut first = dark.clone();
        draw_disc(&mut first, [10.0, 16.0], 4.0, 255);
        seg.apply(&first);

        let mut second = dark.clone();
        draw_disc(&mut second, [40.0, 16.0], 4.0, 255);
        let mask = seg.apply(&second);
        assert_eq!(mask.get_pixel(10, 16)[0], BACKGROUND);
        assert_eq!(mask.get_pixel(40, 16)[0], FOREGROUND);
    }

    #[test]
    fn learning_rate_schedule_seeds_from_history() {
        let mut seg = segmenter();
        let frame = uniform(2, 2, 0);
        seg.apply(&frame);
        assert!((seg.learning_rate() - 0.5).abs() < 1e-6);
        for _ in 0..9 {
            seg.apply(&frame);
        }
        assert!(seg.is_seeded());
        assert!((seg.learning_rate() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn size_change_reinitializes() {
        let mut seg = segmenter();
        for _ in 0..5 {
            seg.apply(&uniform(8, 8, 0));
        }
        let mask = seg.apply(&uniform(4, 4, 0));
        assert_eq!(mask.dimensions(), (4, 4));
        assert_eq!(seg.frames_seen(), 1);
    }

    #[test]
    fn rejects_inconsistent_variances() {
        let cfg = SegmenterConfig {
            var_min: 20.0,
            ..SegmenterConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidVariance { .. })
        ));
    }
}
