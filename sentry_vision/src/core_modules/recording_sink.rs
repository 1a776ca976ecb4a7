// THEORY:
// The recording sink owns the lifecycle of one video artifact per motion
// episode. It is split in three pieces:
//
// 1.  **`ClipBackend` / `ClipWriter`**: how frames become bytes on disk. The
//     built-in `MjpegBackend` writes a Motion-JPEG stream (one JPEG per frame,
//     back to back). With the `opencv` feature an mp4 backend is available too.
// 2.  **`RecordingSink`**: knows the recordings directory, the fixed frame rate
//     and frame size, and how artifacts are named: `motion_<YYYYMMDD_HHMMSS>`
//     plus the backend extension. It also serves the "list" and "fetch" queries.
// 3.  **`RecordingHandle`**: one open artifact. `write` is a no-op once the
//     handle is closed or after the writer failed. `end` releases the writer and
//     then applies the discard rule: no frames, or fewer than `min_clip_bytes`
//     on disk, means the file is deleted. Cleanup errors are swallowed. `end` is
//     idempotent and runs automatically on drop.
//
// While open, an artifact lives under a hidden working name (`.motion_...`)
// and only a kept artifact is renamed to its final name. Listing and fetching
// therefore never see a clip that may still be discarded.
//
// Storage faults never escape this module as panics. `begin` returns an error
// the detector logs; everything after that degrades to "no frames written".

use crate::config::SentryConfig;
use crate::core_modules::motion_state::MotionEpisode;
use crate::error::{RecordingError, SentryError};
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const ARTIFACT_PREFIX: &str = "motion_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const WORKING_PREFIX: char = '.';

/// Writes the frames of one artifact.
pub trait ClipWriter: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), RecordingError>;

    /// Flushes and releases the underlying file.
    fn finish(self: Box<Self>) -> Result<(), RecordingError>;
}

/// Opens `ClipWriter`s for a particular container format.
pub trait ClipBackend: Send + Sync {
    /// File extension without the leading dot.
    fn extension(&self) -> &str;

    fn open(
        &self,
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn ClipWriter>, RecordingError>;
}

/// Motion-JPEG elementary stream: concatenated baseline JPEG frames.
#[derive(Debug, Clone)]
pub struct MjpegBackend {
    quality: u8,
}

impl MjpegBackend {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl ClipBackend for MjpegBackend {
    fn extension(&self) -> &str {
        "mjpeg"
    }

    fn open(
        &self,
        path: &Path,
        _fps: f64,
        _width: u32,
        _height: u32,
    ) -> Result<Box<dyn ClipWriter>, RecordingError> {
        let file = File::create(path).map_err(|e| RecordingError::io(path, e))?;
        Ok(Box::new(MjpegWriter {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            quality: self.quality,
        }))
    }
}

struct MjpegWriter {
    path: PathBuf,
    out: BufWriter<File>,
    quality: u8,
}

impl ClipWriter for MjpegWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), RecordingError> {
        let mut encoder = JpegEncoder::new_with_quality(&mut self.out, self.quality);
        encoder.encode_image(frame)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), RecordingError> {
        let MjpegWriter { path, out, .. } = *self;
        let file = out
            .into_inner()
            .map_err(|e| RecordingError::io(&path, e.into_error()))?;
        file.sync_all().map_err(|e| RecordingError::io(&path, e))?;
        Ok(())
    }
}

/// Why a closed artifact was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    NoFrames,
    TooSmall { bytes: u64 },
    /// The artifact could not be moved to its final name.
    NotPublished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingOutcome {
    Kept {
        file_name: String,
        frames: u64,
        bytes: u64,
    },
    Discarded {
        file_name: String,
        frames: u64,
        reason: DiscardReason,
    },
    AlreadyClosed,
}

/// Creates, names, lists and serves recording artifacts.
pub struct RecordingSink {
    directory: PathBuf,
    backend: Arc<dyn ClipBackend>,
    fps: f64,
    width: u32,
    height: u32,
    min_clip_bytes: u64,
}

impl RecordingSink {
    pub fn new(config: &SentryConfig) -> Self {
        Self::with_backend(config, Arc::new(MjpegBackend::new(config.recording.jpeg_quality)))
    }

    pub fn with_backend(config: &SentryConfig, backend: Arc<dyn ClipBackend>) -> Self {
        let (width, height) = config.recording.frame_size(&config.camera);
        Self {
            directory: config.recording.directory.clone(),
            backend,
            fps: config.recording.fps,
            width,
            height,
            min_clip_bytes: config.recording.min_clip_bytes,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn extension(&self) -> &str {
        self.backend.extension()
    }

    /// Opens a new artifact for `episode`, named after its start time.
    pub fn begin(&self, episode: &MotionEpisode) -> Result<RecordingHandle, RecordingError> {
        std::fs::create_dir_all(&self.directory)
            .map_err(|e| RecordingError::io(&self.directory, e))?;

        let stamp = episode.started_at.format(TIMESTAMP_FORMAT).to_string();
        let extension = self.backend.extension();
        let mut file_name = format!("{ARTIFACT_PREFIX}{stamp}.{extension}");
        let mut suffix = 1;
        while self.directory.join(&file_name).exists()
            || self.directory.join(working_name(&file_name)).exists()
        {
            file_name = format!("{ARTIFACT_PREFIX}{stamp}_{suffix}.{extension}");
            suffix += 1;
        }

        let path = self.directory.join(&file_name);
        let working_path = self.directory.join(working_name(&file_name));
        let writer = self.backend.open(&working_path, self.fps, self.width, self.height)?;
        info!(episode = episode.id, path = %path.display(), "recording started");

        Ok(RecordingHandle {
            file_name,
            path,
            working_path,
            writer: Some(writer),
            width: self.width,
            height: self.height,
            min_clip_bytes: self.min_clip_bytes,
            frames_written: 0,
            closed: false,
            warned_resize: false,
        })
    }

    /// Names of retained artifacts, newest first.
    pub fn list(&self) -> std::io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_artifact_name(name, self.extension()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort_unstable_by(|a, b| artifact_order(b).cmp(&artifact_order(a)));
        Ok(names)
    }

    /// Raw bytes of a retained artifact.
    pub fn read(&self, file_name: &str) -> Result<Vec<u8>, SentryError> {
        if !is_artifact_name(file_name, self.extension()) {
            return Err(SentryError::UnknownRecording(file_name.to_string()));
        }
        match std::fs::read(self.directory.join(file_name)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SentryError::UnknownRecording(file_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn working_name(file_name: &str) -> String {
    format!("{WORKING_PREFIX}{file_name}")
}

/// Sort key of a valid artifact name: start timestamp, then collision suffix.
fn artifact_order(name: &str) -> (&str, u64) {
    let stem = name.strip_prefix(ARTIFACT_PREFIX).unwrap_or(name);
    let stamp = stem.get(..15).unwrap_or(stem);
    let suffix = stem
        .get(15..)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.split('.').next())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0);
    (stamp, suffix)
}

/// Matches `motion_YYYYMMDD_HHMMSS[_N].<extension>` and nothing else.
pub fn is_artifact_name(name: &str, extension: &str) -> bool {
    let Some(rest) = name.strip_prefix(ARTIFACT_PREFIX) else {
        return false;
    };
    let Some(stem) = rest
        .strip_suffix(extension)
        .and_then(|stem| stem.strip_suffix('.'))
    else {
        return false;
    };

    let bytes = stem.as_bytes();
    if bytes.len() < 15 {
        return false;
    }
    let stamp_ok = bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[8] == b'_'
        && bytes[9..15].iter().all(u8::is_ascii_digit);
    let suffix = &bytes[15..];
    let suffix_ok = suffix.is_empty()
        || (suffix.len() > 1 && suffix[0] == b'_' && suffix[1..].iter().all(u8::is_ascii_digit));
    stamp_ok && suffix_ok
}

/// One open recording artifact.
pub struct RecordingHandle {
    file_name: String,
    path: PathBuf,
    working_path: PathBuf,
    writer: Option<Box<dyn ClipWriter>>,
    width: u32,
    height: u32,
    min_clip_bytes: u64,
    frames_written: u64,
    closed: bool,
    warned_resize: bool,
}

impl RecordingHandle {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Where the artifact ends up if it is kept.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where frames are written while the artifact is open.
    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Appends a frame. Returns whether the frame was persisted.
    pub fn write(&mut self, frame: &RgbImage) -> bool {
        if self.closed {
            return false;
        }
        let Some(writer) = self.writer.as_mut() else {
            return false;
        };

        let result = if frame.dimensions() == (self.width, self.height) {
            writer.write_frame(frame)
        } else {
            if !self.warned_resize {
                warn!(
                    path = %self.path.display(),
                    frame_width = frame.width(),
                    frame_height = frame.height(),
                    width = self.width,
                    height = self.height,
                    "frame size differs from recording size, resizing"
                );
                self.warned_resize = true;
            }
            let resized = imageops::resize(frame, self.width, self.height, FilterType::Triangle);
            writer.write_frame(&resized)
        };

        match result {
            Ok(()) => {
                self.frames_written += 1;
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "recording write failed, dropping writer");
                self.writer = None;
                false
            }
        }
    }

    /// Releases the artifact and deletes it if it is degenerate. Safe to call twice.
    pub fn end(&mut self) -> RecordingOutcome {
        if self.closed {
            return RecordingOutcome::AlreadyClosed;
        }
        self.closed = true;

        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finish() {
                warn!(path = %self.path.display(), error = %e, "failed to finalize recording");
            }
        }

        let bytes = std::fs::metadata(&self.working_path).map(|m| m.len()).unwrap_or(0);
        let mut reason = if self.frames_written == 0 {
            Some(DiscardReason::NoFrames)
        } else if bytes < self.min_clip_bytes {
            Some(DiscardReason::TooSmall { bytes })
        } else {
            None
        };

        if reason.is_none() {
            if let Err(e) = std::fs::rename(&self.working_path, &self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to publish recording");
                reason = Some(DiscardReason::NotPublished);
            }
        }

        match reason {
            Some(reason) => {
                if let Err(e) = std::fs::remove_file(&self.working_path) {
                    debug!(path = %self.path.display(), error = %e, "discard cleanup failed");
                }
                info!(path = %self.path.display(), frames = self.frames_written, ?reason, "recording discarded");
                RecordingOutcome::Discarded {
                    file_name: self.file_name.clone(),
                    frames: self.frames_written,
                    reason,
                }
            }
            None => {
                info!(path = %self.path.display(), frames = self.frames_written, bytes, "recording kept");
                RecordingOutcome::Kept {
                    file_name: self.file_name.clone(),
                    frames: self.frames_written,
                    bytes,
                }
            }
        }
    }
}

impl Drop for RecordingHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::motion_state::{MotionStateMachine, Transition};
    use chrono::{Local, TimeZone};
    use image::Rgb;

    fn config_in(dir: &Path, min_clip_bytes: u64) -> SentryConfig {
        let mut config = SentryConfig::default();
        config.camera.width = 64;
        config.camera.height = 48;
        config.recording.directory = dir.join("recordings");
        config.recording.min_clip_bytes = min_clip_bytes;
        config
    }

    fn episode_at(hour: u32, minute: u32, second: u32) -> MotionEpisode {
        let start = Local
            .with_ymd_and_hms(2024, 3, 9, hour, minute, second)
            .single()
            .expect("unambiguous local time");
        let mut machine = MotionStateMachine::new(1);
        match machine.observe(true, start) {
            Transition::Started(episode) => episode,
            other => panic!("expected Started, got {other:?}"),
        }
    }

    /// High-frequency texture so JPEG frames do not compress to nothing.
    fn textured(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = ((x ^ y) & 0x3f) as u8 * 4;
            Rgb([v, 255 - v, (x * 7 + y * 3) as u8])
        })
    }

    #[test]
    fn names_artifacts_after_episode_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 0));
        let mut handle = sink.begin(&episode_at(8, 5, 9)).expect("begin");
        assert_eq!(handle.file_name(), "motion_20240309_080509.mjpeg");
        assert_eq!(
            handle.working_path().file_name().and_then(|n| n.to_str()),
            Some(".motion_20240309_080509.mjpeg")
        );
        assert!(handle.working_path().exists());
        assert!(!handle.path().exists());
        handle.end();
    }

    #[test]
    fn same_second_episodes_get_a_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 0));
        let mut first = sink.begin(&episode_at(8, 5, 9)).expect("begin");
        let mut second = sink.begin(&episode_at(8, 5, 9)).expect("begin");
        assert_eq!(second.file_name(), "motion_20240309_080509_1.mjpeg");
        first.end();
        second.end();
    }

    #[test]
    fn zero_frame_artifact_is_removed_and_end_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 0));
        let mut handle = sink.begin(&episode_at(9, 0, 0)).expect("begin");
        let path = handle.working_path().to_path_buf();

        let outcome = handle.end();
        assert!(matches!(
            outcome,
            RecordingOutcome::Discarded { reason: DiscardReason::NoFrames, .. }
        ));
        assert!(!path.exists());
        assert_eq!(handle.end(), RecordingOutcome::AlreadyClosed);
        assert!(!handle.write(&textured(64, 48)));
    }

    #[test]
    fn small_artifact_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 100 * 1024));
        let mut handle = sink.begin(&episode_at(9, 0, 1)).expect("begin");
        assert!(handle.write(&textured(64, 48)));
        let path = handle.working_path().to_path_buf();

        match handle.end() {
            RecordingOutcome::Discarded { reason: DiscardReason::TooSmall { bytes }, frames, .. } => {
                assert!(bytes > 0 && bytes < 100 * 1024);
                assert_eq!(frames, 1);
            }
            other => panic!("expected TooSmall discard, got {other:?}"),
        }
        assert!(!path.exists());
    }

    #[test]
    fn large_enough_artifact_is_kept_and_listed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 1));
        let mut handle = sink.begin(&episode_at(10, 30, 0)).expect("begin");
        for _ in 0..3 {
            assert!(handle.write(&textured(64, 48)));
        }
        let outcome = handle.end();
        let RecordingOutcome::Kept { file_name, frames, bytes } = outcome else {
            panic!("expected Kept, got {outcome:?}");
        };
        assert_eq!(frames, 3);
        assert!(bytes > 0);

        assert_eq!(sink.list().expect("list"), vec![file_name.clone()]);
        let data = sink.read(&file_name).expect("read");
        assert_eq!(data.len() as u64, bytes);
        // Each frame is a complete JPEG starting with SOI.
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn open_artifact_is_neither_listed_nor_served() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 1));
        let mut handle = sink.begin(&episode_at(8, 0, 1)).expect("begin");
        assert!(handle.write(&textured(64, 48)));

        assert!(sink.list().expect("list").is_empty());
        assert!(matches!(
            sink.read(handle.file_name()),
            Err(SentryError::UnknownRecording(_))
        ));

        assert!(matches!(handle.end(), RecordingOutcome::Kept { .. }));
        assert!(!handle.working_path().exists());
        assert_eq!(sink.list().expect("list"), vec!["motion_20240309_080001.mjpeg".to_string()]);
    }

    #[test]
    fn open_artifact_reserves_its_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 1));
        let mut open = sink.begin(&episode_at(8, 0, 2)).expect("begin");
        let mut next = sink.begin(&episode_at(8, 0, 2)).expect("begin");
        assert_eq!(next.file_name(), "motion_20240309_080002_1.mjpeg");
        open.end();
        next.end();
    }

    #[test]
    fn mismatched_frames_are_resized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 1));
        let mut handle = sink.begin(&episode_at(11, 0, 0)).expect("begin");
        assert!(handle.write(&textured(128, 96)));
        assert_eq!(handle.frames_written(), 1);
        assert!(matches!(handle.end(), RecordingOutcome::Kept { .. }));

        let bytes = sink.read("motion_20240309_110000.mjpeg").expect("read");
        let decoded = image::load_from_memory(&bytes).expect("first frame decodes");
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn dropping_an_open_handle_ends_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 0));
        let path = {
            let handle = sink.begin(&episode_at(12, 0, 0)).expect("begin");
            handle.working_path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(sink.directory()).expect("dir").count(), 0);
    }

    #[test]
    fn listing_ignores_foreign_files_and_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 0));
        assert!(sink.list().expect("missing dir lists empty").is_empty());

        std::fs::create_dir_all(sink.directory()).expect("mkdir");
        for name in [
            "motion_20240101_101010.mjpeg",
            "motion_20240102_101010_2.mjpeg",
            "motion_20240102_101010_10.mjpeg",
            "motion_20240102_101010.mjpeg",
            ".motion_20240103_101010.mjpeg",
            "motion_20240101_101010.mp4",
            "notes.txt",
            "motion_latest.mjpeg",
        ] {
            std::fs::write(sink.directory().join(name), b"x").expect("write");
        }
        assert_eq!(
            sink.list().expect("list"),
            vec![
                "motion_20240102_101010_10.mjpeg".to_string(),
                "motion_20240102_101010_2.mjpeg".to_string(),
                "motion_20240102_101010.mjpeg".to_string(),
                "motion_20240101_101010.mjpeg".to_string(),
            ]
        );
    }

    #[test]
    fn read_rejects_traversal_and_unknown_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = RecordingSink::new(&config_in(dir.path(), 0));
        assert!(matches!(
            sink.read("../secrets.mjpeg"),
            Err(SentryError::UnknownRecording(_))
        ));
        assert!(matches!(
            sink.read("motion_20240101_101010.mjpeg"),
            Err(SentryError::UnknownRecording(_))
        ));
    }

    #[test]
    fn artifact_name_pattern() {
        assert!(is_artifact_name("motion_20240101_235959.mp4", "mp4"));
        assert!(is_artifact_name("motion_20240101_235959_12.mp4", "mp4"));
        assert!(!is_artifact_name("motion_20240101_235959_.mp4", "mp4"));
        assert!(!is_artifact_name("motion_2024010_235959.mp4", "mp4"));
        assert!(!is_artifact_name("motion_20240101_235959.mp4", "mjpeg"));
        assert!(!is_artifact_name("../motion_20240101_235959.mp4", "mp4"));
    }
}
