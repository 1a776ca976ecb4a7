// THEORY:
// The `Frame` is the most fundamental unit of the recorder: an RGB image plus
// the moment it was captured. Like the rest of the data containers in
// `core_modules` it is "dumb": it knows nothing about motion. Every later stage
// reads it, none mutates it. Annotation for display always works on a copy.
//
// A `FrameSource` is the only suspension point of the frame loop. It either
// yields the next frame, reports end-of-stream (`Ok(None)`), or fails with a
// device fault that ends the loop.

use crate::error::SourceError;
use chrono::{DateTime, Duration, Local};
use image::RgbImage;
use std::path::{Path, PathBuf};

/// An immutable captured image tagged with its capture time.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
    captured_at: DateTime<Local>,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: DateTime<Local>) -> Self {
        Self { image, captured_at }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Supplies frames to the detector worker.
///
/// Implementations own the capture device; `release` must be idempotent and
/// implementations should also release on drop.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    fn release(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        (**self).next_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Replays frames from any iterator. Useful for tests and pre-recorded input.
pub struct IterSource<I> {
    frames: Option<I>,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Frame> + Send,
{
    pub fn new(frames: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            frames: Some(frames.into_iter()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.frames.is_none()
    }
}

impl<I> FrameSource for IterSource<I>
where
    I: Iterator<Item = Frame> + Send,
{
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        Ok(self.frames.as_mut().and_then(|frames| frames.next()))
    }

    fn release(&mut self) {
        self.frames = None;
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "ppm"];

/// Reads a directory of still images in file-name order, stamping each one
/// as if it had been captured at `fps`.
pub struct ImageSequenceSource {
    paths: std::vec::IntoIter<PathBuf>,
    started_at: DateTime<Local>,
    frame_interval: Duration,
    index: i32,
}

impl ImageSequenceSource {
    pub fn open(directory: impl AsRef<Path>, fps: f64) -> Result<Self, SourceError> {
        let directory = directory.as_ref();
        let entries = std::fs::read_dir(directory).map_err(|e| SourceError::Open {
            source_name: directory.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            return Err(SourceError::Open {
                source_name: directory.display().to_string(),
                reason: "directory contains no images".to_string(),
            });
        }

        let fps = if fps > 0.0 { fps } else { 1.0 };
        Ok(Self {
            paths: paths.into_iter(),
            started_at: Local::now(),
            frame_interval: Duration::microseconds((1_000_000.0 / fps) as i64),
            index: 0,
        })
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.paths.next() else {
            return Ok(None);
        };
        let image = image::open(&path)?.to_rgb8();
        let captured_at = self.started_at + self.frame_interval * self.index;
        self.index += 1;
        Ok(Some(Frame::new(image, captured_at)))
    }

    fn release(&mut self) {
        self.paths = Vec::new().into_iter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn iter_source_ends_and_releases() {
        let now = Local::now();
        let frames = (0..3).map(move |i| Frame::new(RgbImage::new(4, 4), now + Duration::milliseconds(i * 50)));
        let mut source = IterSource::new(frames);

        let mut count = 0;
        while let Some(frame) = source.next_frame().expect("iterator never fails") {
            assert_eq!(frame.width(), 4);
            count += 1;
        }
        assert_eq!(count, 3);

        source.release();
        assert!(source.is_released());
        assert!(source.next_frame().expect("released source").is_none());
    }

    #[test]
    fn image_sequence_reads_in_name_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, value) in [("b.png", 20u8), ("a.png", 10u8), ("notes.txt", 0u8)] {
            let path = dir.path().join(name);
            if name.ends_with(".png") {
                RgbImage::from_pixel(8, 6, Rgb([value, value, value]))
                    .save(&path)
                    .expect("write png");
            } else {
                std::fs::write(&path, b"not an image").expect("write txt");
            }
        }

        let mut source = ImageSequenceSource::open(dir.path(), 20.0).expect("open sequence");
        assert_eq!(source.remaining(), 2);

        let first = source.next_frame().expect("read").expect("first frame");
        let second = source.next_frame().expect("read").expect("second frame");
        assert_eq!(first.image().get_pixel(0, 0)[0], 10);
        assert_eq!(second.image().get_pixel(0, 0)[0], 20);
        assert_eq!(
            (second.captured_at() - first.captured_at()).num_milliseconds(),
            50
        );
        assert!(source.next_frame().expect("read").is_none());
    }

    #[test]
    fn empty_directory_is_an_open_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ImageSequenceSource::open(dir.path(), 20.0).err().expect("should fail");
        assert!(matches!(err, SourceError::Open { .. }));
    }
}
