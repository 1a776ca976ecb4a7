// THEORY:
// A single `SentryConfig` carries every tunable of the recorder. It is loaded
// from TOML, every field has a default so an empty file is valid, and
// `validate` rejects values that would make a component misbehave before the
// worker ever starts.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SentryConfig {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub recording: RecordingConfig,
    pub event_log: EventLogConfig,
    pub stream: StreamConfig,
}

/// Capture settings requested from the frame source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device index handed to the capture backend.
    pub device: u32,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: 0,
            width: 640,
            height: 480,
            fps: 20.0,
        }
    }
}

/// Tunables for the background model, mask refiner, region extractor and
/// motion state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Number of frames the background model effectively remembers.
    pub history: usize,
    /// Squared Mahalanobis distance above which a pixel is foreground.
    pub var_threshold: f32,
    /// Portion of the mixture weight that counts as background.
    pub background_ratio: f32,
    /// Maximum Gaussian modes kept per pixel.
    pub max_modes: usize,
    /// Side of the square structuring element. Must be odd.
    pub kernel_size: u32,
    pub erode_iterations: u32,
    pub dilate_iterations: u32,
    /// A region must cover strictly more pixels than this to count as motion.
    pub min_region_area: u32,
    /// Consecutive motion-free frames needed to close an episode.
    pub close_after_empty_frames: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            history: 100,
            var_threshold: 50.0,
            background_ratio: 0.9,
            max_modes: 5,
            kernel_size: 5,
            erode_iterations: 1,
            dilate_iterations: 2,
            min_region_area: 500,
            close_after_empty_frames: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub directory: PathBuf,
    pub fps: f64,
    /// Recording frame size. `None` falls back to the camera size.
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Clips smaller than this are deleted when the episode closes.
    pub min_clip_bytes: u64,
    /// Record the annotated frame (bounding boxes, status badge) instead of the raw one.
    pub annotate: bool,
    /// JPEG quality used by the Motion-JPEG backend.
    pub jpeg_quality: u8,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("recordings"),
            fps: 20.0,
            width: None,
            height: None,
            min_clip_bytes: 100 * 1024,
            annotate: true,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    /// Keep prior runs, rotate once the file grows past `max_bytes`.
    Append,
    /// Start every run with a fresh file.
    Truncate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub path: PathBuf,
    pub mode: LogMode,
    pub max_bytes: u64,
    pub keep_rotated: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs/motion_log.txt"),
            mode: LogMode::Append,
            max_bytes: 1024 * 1024,
            keep_rotated: 3,
        }
    }
}

/// Settings for the display stream handed to the web layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub display_height: u32,
    pub jpeg_quality: u8,
    pub bus_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            display_height: 480,
            jpeg_quality: 80,
            bus_capacity: 2,
        }
    }
}

impl RecordingConfig {
    /// The frame size clips are written at.
    pub fn frame_size(&self, camera: &CameraConfig) -> (u32, u32) {
        (
            self.width.unwrap_or(camera.width),
            self.height.unwrap_or(camera.height),
        )
    }
}

impl SentryConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SentryConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::invalid("camera", "frame size must be non-zero"));
        }
        if !(self.camera.fps > 0.0) {
            return Err(ConfigError::invalid("camera.fps", "must be positive"));
        }

        let d = &self.detection;
        if d.history == 0 {
            return Err(ConfigError::invalid("detection.history", "must be at least 1"));
        }
        if !(d.var_threshold > 0.0) {
            return Err(ConfigError::invalid("detection.var_threshold", "must be positive"));
        }
        if !(d.background_ratio > 0.0 && d.background_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                "detection.background_ratio",
                "must be in (0, 1]",
            ));
        }
        if d.max_modes == 0 {
            return Err(ConfigError::invalid("detection.max_modes", "must be at least 1"));
        }
        if d.kernel_size == 0 || d.kernel_size % 2 == 0 {
            return Err(ConfigError::invalid(
                "detection.kernel_size",
                format!("must be odd and non-zero, got {}", d.kernel_size),
            ));
        }
        if d.close_after_empty_frames == 0 {
            return Err(ConfigError::invalid(
                "detection.close_after_empty_frames",
                "must be at least 1",
            ));
        }

        let r = &self.recording;
        if !(r.fps > 0.0) {
            return Err(ConfigError::invalid("recording.fps", "must be positive"));
        }
        let (width, height) = r.frame_size(&self.camera);
        if width == 0 || height == 0 {
            return Err(ConfigError::invalid("recording", "frame size must be non-zero"));
        }
        check_quality("recording.jpeg_quality", r.jpeg_quality)?;

        if self.stream.display_height == 0 {
            return Err(ConfigError::invalid("stream.display_height", "must be non-zero"));
        }
        if self.stream.bus_capacity == 0 {
            return Err(ConfigError::invalid("stream.bus_capacity", "must be at least 1"));
        }
        check_quality("stream.jpeg_quality", self.stream.jpeg_quality)?;

        Ok(())
    }
}

fn check_quality(field: &'static str, quality: u8) -> Result<(), ConfigError> {
    if (1..=100).contains(&quality) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be within 1..=100, got {quality}")))
    }
}
