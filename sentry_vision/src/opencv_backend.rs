// THEORY:
// OpenCV-backed camera capture and mp4 recording, compiled only with the
// `opencv` feature. Both convert at the boundary: OpenCV works in BGR `Mat`s,
// the rest of the crate in RGB `image` buffers.

use crate::config::CameraConfig;
use crate::core_modules::frame::{Frame, FrameSource};
use crate::core_modules::recording_sink::{ClipBackend, ClipWriter};
use crate::error::{RecordingError, SourceError};
use chrono::{DateTime, Duration, Local};
use image::RgbImage;
use opencv::{
    core::{self, Mat, Scalar},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use std::path::Path;
use tracing::{debug, info, warn};

/// Frames from OpenCV: a live camera opened by device index, or a video file.
pub struct CameraSource {
    capture: Option<VideoCapture>,
    label: String,
    /// A file runs out of frames; a camera that stops delivering has failed.
    is_file: bool,
    opened_at: DateTime<Local>,
    frame: Mat,
}

impl CameraSource {
    pub fn open(config: &CameraConfig) -> Result<Self, SourceError> {
        let label = format!("camera {}", config.device);
        let capture = VideoCapture::new(config.device as i32, videoio::CAP_ANY)
            .map_err(|e| open_error(&label, e.to_string()))?;
        let mut source = Self::from_capture(capture, label, false)?;

        // Drivers may ignore these; frames that come back at another size are
        // resized by the recording sink.
        if let Some(capture) = source.capture.as_mut() {
            for (prop, value) in [
                (videoio::CAP_PROP_FRAME_WIDTH, config.width as f64),
                (videoio::CAP_PROP_FRAME_HEIGHT, config.height as f64),
                (videoio::CAP_PROP_FPS, config.fps),
            ] {
                if let Err(e) = capture.set(prop, value) {
                    warn!(prop, value, error = %e, "camera rejected capture property");
                }
            }
        }
        Ok(source)
    }

    /// Replays a video file. Frames are stamped with their position in the file,
    /// counted from the moment the file was opened.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let label = path.display().to_string();
        let capture = VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)
            .map_err(|e| open_error(&label, e.to_string()))?;
        Self::from_capture(capture, label, true)
    }

    fn from_capture(capture: VideoCapture, label: String, is_file: bool) -> Result<Self, SourceError> {
        if !capture.is_opened().map_err(|e| open_error(&label, e.to_string()))? {
            return Err(open_error(&label, "could not be opened".to_string()));
        }
        info!(source = %label, "capture opened");
        Ok(Self {
            capture: Some(capture),
            label,
            is_file,
            opened_at: Local::now(),
            frame: Mat::default(),
        })
    }
}

fn open_error(label: &str, reason: String) -> SourceError {
    SourceError::Open {
        source_name: label.to_string(),
        reason,
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(None);
        };
        let read_error = |e: opencv::Error| SourceError::Read(e.to_string());

        if !capture.read(&mut self.frame).map_err(read_error)? || self.frame.empty() {
            if self.is_file {
                debug!(source = %self.label, "end of video file");
                return Ok(None);
            }
            return Err(SourceError::Read(format!("{} returned no frame", self.label)));
        }
        let captured_at = if self.is_file {
            let position_ms = capture.get(videoio::CAP_PROP_POS_MSEC).map_err(read_error)?;
            self.opened_at + Duration::milliseconds(position_ms.max(0.0) as i64)
        } else {
            Local::now()
        };

        let mut rgb = Mat::default();
        imgproc::cvt_color(&self.frame, &mut rgb, imgproc::COLOR_BGR2RGB, 0).map_err(read_error)?;
        let width = rgb.cols() as u32;
        let height = rgb.rows() as u32;
        let data = rgb.data_bytes().map_err(read_error)?.to_vec();

        let image = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| SourceError::Read("frame buffer size mismatch".to_string()))?;
        Ok(Some(Frame::new(image, captured_at)))
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                warn!(source = %self.label, error = %e, "failed to release capture");
            } else {
                info!(source = %self.label, "capture released");
            }
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// mp4 container with the `mp4v` codec.
#[derive(Debug, Clone, Default)]
pub struct Mp4Backend;

impl ClipBackend for Mp4Backend {
    fn extension(&self) -> &str {
        "mp4"
    }

    fn open(
        &self,
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn ClipWriter>, RecordingError> {
        let backend_error = |e: opencv::Error| RecordingError::Backend(e.to_string());
        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v').map_err(backend_error)?;
        let writer = VideoWriter::new(
            &path.to_string_lossy(),
            fourcc,
            fps,
            core::Size::new(width as i32, height as i32),
            true,
        )
        .map_err(backend_error)?;
        if !writer.is_opened().map_err(backend_error)? {
            return Err(RecordingError::Backend(format!(
                "could not open video writer for {}",
                path.display()
            )));
        }

        let bgr = Mat::new_rows_cols_with_default(
            height as i32,
            width as i32,
            core::CV_8UC3,
            Scalar::all(0.0),
        )
        .map_err(backend_error)?;
        Ok(Box::new(Mp4Writer { writer, bgr }))
    }
}

struct Mp4Writer {
    writer: VideoWriter,
    bgr: Mat,
}

impl ClipWriter for Mp4Writer {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), RecordingError> {
        let backend_error = |e: opencv::Error| RecordingError::Backend(e.to_string());
        let mut rgb = Mat::new_rows_cols_with_default(
            frame.height() as i32,
            frame.width() as i32,
            core::CV_8UC3,
            Scalar::all(0.0),
        )
        .map_err(backend_error)?;
        rgb.data_bytes_mut()
            .map_err(backend_error)?
            .copy_from_slice(frame.as_raw());

        imgproc::cvt_color(&rgb, &mut self.bgr, imgproc::COLOR_RGB2BGR, 0).map_err(backend_error)?;
        self.writer.write(&self.bgr).map_err(backend_error)
    }

    fn finish(mut self: Box<Self>) -> Result<(), RecordingError> {
        self.writer
            .release()
            .map_err(|e| RecordingError::Backend(e.to_string()))
    }
}
