// THEORY:
// The `BackgroundModel` is the temporal analysis layer of the recorder. It owns
// one small statistical memory per pixel and answers a single question for
// every new frame: "which pixels do not look like the scene I have learned?"
//
// Key architectural principles:
// 1.  **Per-Pixel Mixture**: Each pixel keeps up to `max_modes` Gaussian modes
//     (RGB mean, scalar variance, weight). A pixel that flickers between two
//     stable looks (a blinking LED, leaves in wind) can learn both of them.
// 2.  **Online Adaptation**: Modes are updated with a learning rate of
//     `1 / min(2 * frames_seen, history)`, so slow illumination changes are
//     absorbed into the background instead of registering as motion.
// 3.  **Background Test**: Modes are kept sorted by weight. A pixel is
//     background when it matches one of the leading modes whose cumulative
//     weight is still below `background_ratio`. Matching means a squared
//     distance below `var_threshold * variance`.
// 4.  **No Shadows**: Shadow detection is intentionally absent; shadows are
//     either matched as background or reported as plain foreground.
// 5.  **Ephemeral**: State lives in memory only and starts over on restart or
//     when the frame size changes. The first frame seeds the model and yields
//     an empty mask.

use crate::config::DetectionConfig;
use image::{GrayImage, Luma, RgbImage};
use tracing::warn;

/// Foreground value in a mask. Background pixels are 0.
pub const FOREGROUND: u8 = 255;

/// A binary mask where `FOREGROUND` marks pixels that differ from the learned background.
pub type ForegroundMask = GrayImage;

const VAR_INIT: f32 = 15.0 * 15.0;
const VAR_MIN: f32 = 4.0;
const VAR_MAX: f32 = 5.0 * VAR_INIT;
/// Threshold (in variances) for a sample to update an existing mode.
const VAR_THRESHOLD_GEN: f32 = 9.0;
/// Prior that pushes rarely-used modes towards removal.
const COMPLEXITY_REDUCTION: f32 = 0.05;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Mode {
    weight: f32,
    mean: [f32; 3],
    variance: f32,
}

impl Mode {
    fn seeded(sample: [f32; 3], weight: f32) -> Self {
        Self {
            weight,
            mean: sample,
            variance: VAR_INIT,
        }
    }

    fn distance_sq(&self, sample: &[f32; 3]) -> f32 {
        let dr = sample[0] - self.mean[0];
        let dg = sample[1] - self.mean[1];
        let db = sample[2] - self.mean[2];
        dr * dr + dg * dg + db * db
    }
}

/// Tunables extracted from `DetectionConfig` at construction time.
#[derive(Debug, Clone, Copy)]
struct Params {
    history: usize,
    var_threshold: f32,
    background_ratio: f32,
    max_modes: usize,
}

/// Adaptive per-pixel background model.
pub struct BackgroundModel {
    params: Params,
    width: u32,
    height: u32,
    /// Flattened `width * height * max_modes` mode table, sorted by weight per pixel.
    modes: Vec<Mode>,
    /// Number of live modes for each pixel.
    mode_counts: Vec<u8>,
    frames_seen: u64,
}

impl BackgroundModel {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            params: Params {
                history: config.history.max(1),
                var_threshold: config.var_threshold,
                background_ratio: config.background_ratio,
                max_modes: config.max_modes.clamp(1, u8::MAX as usize),
            },
            width: 0,
            height: 0,
            modes: Vec::new(),
            mode_counts: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Forgets everything learned so far.
    pub fn reset(&mut self) {
        self.width = 0;
        self.height = 0;
        self.modes.clear();
        self.mode_counts.clear();
        self.frames_seen = 0;
    }

    /// The learning rate that will be applied to the next frame.
    fn learning_rate(&self) -> f32 {
        let effective = (2 * self.frames_seen).min(self.params.history as u64).max(1);
        1.0 / effective as f32
    }

    /// Feeds a frame into the model and returns its foreground mask.
    pub fn update(&mut self, image: &RgbImage) -> ForegroundMask {
        let (width, height) = image.dimensions();
        if self.frames_seen > 0 && (width, height) != (self.width, self.height) {
            warn!(
                old_width = self.width,
                old_height = self.height,
                width,
                height,
                "frame size changed, resetting background model"
            );
            self.reset();
        }

        let mut mask = GrayImage::new(width, height);

        if self.frames_seen == 0 {
            self.seed(image);
            return mask;
        }

        self.frames_seen += 1;
        let alpha = self.learning_rate();
        let params = self.params;

        for (index, pixel) in image.pixels().enumerate() {
            let sample = [pixel[0] as f32, pixel[1] as f32, pixel[2] as f32];
            let start = index * params.max_modes;
            let count = self.mode_counts[index] as usize;
            let modes = &mut self.modes[start..start + params.max_modes];

            let (is_background, new_count) = update_pixel(modes, count, &sample, alpha, &params);
            self.mode_counts[index] = new_count as u8;

            if !is_background {
                let x = index as u32 % width;
                let y = index as u32 / width;
                mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }

        mask
    }

    fn seed(&mut self, image: &RgbImage) {
        let (width, height) = image.dimensions();
        let pixel_count = (width * height) as usize;
        self.width = width;
        self.height = height;
        self.modes = vec![Mode::default(); pixel_count * self.params.max_modes];
        self.mode_counts = vec![1; pixel_count];

        for (index, pixel) in image.pixels().enumerate() {
            let sample = [pixel[0] as f32, pixel[1] as f32, pixel[2] as f32];
            self.modes[index * self.params.max_modes] = Mode::seeded(sample, 1.0);
        }
        self.frames_seen = 1;
    }
}

/// Classifies one sample against its pixel's modes and adapts them.
/// Returns whether the sample is background and the new number of live modes.
fn update_pixel(
    modes: &mut [Mode],
    count: usize,
    sample: &[f32; 3],
    alpha: f32,
    params: &Params,
) -> (bool, usize) {
    // --- 1. Background test against the modes as learned so far ---
    let mut is_background = false;
    let mut cumulative = 0.0;
    for mode in &modes[..count] {
        if cumulative >= params.background_ratio {
            break;
        }
        if mode.distance_sq(sample) < params.var_threshold * mode.variance {
            is_background = true;
            break;
        }
        cumulative += mode.weight;
    }

    // --- 2. Online update ---
    let prune = -alpha * COMPLEXITY_REDUCTION;
    let mut matched = false;
    let mut live = 0;
    for i in 0..count {
        let mut mode = modes[i];
        mode.weight = (1.0 - alpha) * mode.weight + prune;

        if !matched {
            let dist_sq = mode.distance_sq(sample);
            if dist_sq < VAR_THRESHOLD_GEN * mode.variance {
                matched = true;
                mode.weight += alpha;
                let k = alpha / mode.weight.max(f32::EPSILON);
                for c in 0..3 {
                    mode.mean[c] += k * (sample[c] - mode.mean[c]);
                }
                mode.variance = (mode.variance + k * (dist_sq - mode.variance)).clamp(VAR_MIN, VAR_MAX);
            }
        }

        if mode.weight > 0.0 {
            modes[live] = mode;
            live += 1;
        }
    }

    // --- 3. Unexplained sample: start a new mode, replacing the weakest one ---
    if !matched {
        let seeded = Mode::seeded(*sample, if live == 0 { 1.0 } else { alpha });
        if live < modes.len() {
            modes[live] = seeded;
            live += 1;
        } else {
            modes[live - 1] = seeded;
        }
    }

    // --- 4. Renormalize and keep the strongest modes first ---
    let total: f32 = modes[..live].iter().map(|m| m.weight).sum();
    if total > 0.0 {
        for mode in &mut modes[..live] {
            mode.weight /= total;
        }
    }
    modes[..live].sort_by(|a, b| b.weight.total_cmp(&a.weight));

    (is_background, live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn flat(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    fn with_square(mut image: RgbImage, x0: u32, y0: u32, side: u32, value: u8) -> RgbImage {
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                image.put_pixel(x, y, Rgb([value, value, value]));
            }
        }
        image
    }

    fn foreground_count(mask: &ForegroundMask) -> usize {
        mask.pixels().filter(|p| p[0] == FOREGROUND).count()
    }

    #[test]
    fn first_frame_seeds_and_is_quiet() {
        let mut model = BackgroundModel::new(&DetectionConfig::default());
        let mask = model.update(&with_square(flat(32, 32, 40), 4, 4, 8, 220));
        assert_eq!(foreground_count(&mask), 0);
        assert_eq!(model.frames_seen(), 1);
    }

    #[test]
    fn static_scene_stays_background() {
        let mut model = BackgroundModel::new(&DetectionConfig::default());
        for _ in 0..50 {
            let mask = model.update(&flat(32, 24, 90));
            assert_eq!(foreground_count(&mask), 0);
        }
    }

    #[test]
    fn new_object_is_foreground() {
        let mut model = BackgroundModel::new(&DetectionConfig::default());
        for _ in 0..30 {
            model.update(&flat(40, 40, 40));
        }
        let mask = model.update(&with_square(flat(40, 40, 40), 10, 10, 12, 230));
        assert_eq!(foreground_count(&mask), 144);
        assert_eq!(mask.get_pixel(10, 10)[0], FOREGROUND);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn slow_illumination_drift_is_absorbed() {
        let mut model = BackgroundModel::new(&DetectionConfig::default());
        for step in 0..120u32 {
            let value = 60 + (step / 4) as u8;
            let mask = model.update(&flat(16, 16, value));
            assert_eq!(foreground_count(&mask), 0, "drift step {step} flagged as motion");
        }
    }

    #[test]
    fn parked_object_is_eventually_learned() {
        let mut model = BackgroundModel::new(&DetectionConfig::default());
        for _ in 0..60 {
            model.update(&flat(20, 20, 50));
        }
        let parked = with_square(flat(20, 20, 50), 5, 5, 6, 200);
        let first = model.update(&parked);
        assert!(foreground_count(&first) > 0);

        let mut last = first;
        for _ in 0..200 {
            last = model.update(&parked);
        }
        assert_eq!(foreground_count(&last), 0);
    }

    #[test]
    fn size_change_resets_model() {
        let mut model = BackgroundModel::new(&DetectionConfig::default());
        for _ in 0..5 {
            model.update(&flat(16, 16, 50));
        }
        let mask = model.update(&flat(8, 8, 200));
        assert_eq!(mask.dimensions(), (8, 8));
        assert_eq!(foreground_count(&mask), 0);
        assert_eq!(model.frames_seen(), 1);
    }

    #[test]
    fn learning_rate_follows_history() {
        let config = DetectionConfig {
            history: 10,
            ..DetectionConfig::default()
        };
        let mut model = BackgroundModel::new(&config);
        model.update(&flat(2, 2, 0));
        assert_eq!(model.learning_rate(), 0.5);
        for _ in 0..20 {
            model.update(&flat(2, 2, 0));
        }
        assert!((model.learning_rate() - 0.1).abs() < 1e-6);
    }
}
