// THEORY:
// `Sentry` is the surface the web/auth layer talks to. It answers the five
// inbound requests (stream, status, list recordings, fetch recording, release
// camera) and never exposes the detector itself.
//
// The camera is opened lazily: the first `stream` call builds a fresh detector,
// opens the source through the factory and spawns the worker. Later calls
// reuse the running worker. A worker that ended on its own (end of stream or
// device fault) is reaped and replaced on the next `stream` call.
// `release_camera` stops the worker and waits until the device is released.
//
// Status survives worker restarts because the facade owns the publisher and
// hands clones of it to each detector it builds.

use crate::config::{CameraConfig, SentryConfig};
use crate::core_modules::event_logger::read_log_lines;
use crate::core_modules::frame::FrameSource;
use crate::core_modules::recording_sink::{ClipBackend, MjpegBackend, RecordingSink};
use crate::core_modules::status::{StatusHandle, StatusPublisher, StatusSnapshot};
use crate::error::{Result, SourceError};
use crate::pipeline::MotionDetector;
use crate::stream::{FrameBus, FramePacket, frame_stream};
use crate::worker::{WorkerExit, WorkerHandle, spawn_worker};
use futures::Stream;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Opens the capture device for a new worker run.
pub type SourceFactory =
    Box<dyn Fn(&CameraConfig) -> std::result::Result<Box<dyn FrameSource>, SourceError> + Send + Sync>;

/// Boxes a closure as a `SourceFactory`.
pub fn source_factory<F>(open: F) -> SourceFactory
where
    F: Fn(&CameraConfig) -> std::result::Result<Box<dyn FrameSource>, SourceError> + Send + Sync + 'static,
{
    Box::new(open)
}

struct Running {
    worker: WorkerHandle,
    bus: FrameBus,
}

pub struct Sentry {
    config: SentryConfig,
    source_factory: SourceFactory,
    backend: Arc<dyn ClipBackend>,
    sink: RecordingSink,
    status: StatusPublisher,
    running: Mutex<Option<Running>>,
}

impl Sentry {
    pub fn new(config: SentryConfig, source_factory: SourceFactory) -> Result<Self> {
        config.validate()?;
        let backend: Arc<dyn ClipBackend> = Arc::new(MjpegBackend::new(config.recording.jpeg_quality));
        Ok(Self {
            sink: RecordingSink::with_backend(&config, backend.clone()),
            backend,
            source_factory,
            status: StatusPublisher::new(),
            running: Mutex::new(None),
            config,
        })
    }

    /// Records clips with `backend` instead of Motion-JPEG.
    pub fn with_backend(mut self, backend: Arc<dyn ClipBackend>) -> Self {
        self.sink = RecordingSink::with_backend(&self.config, backend.clone());
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &SentryConfig {
        &self.config
    }

    /// Display frames until the caller drops the stream or the worker stops.
    pub async fn stream(&self) -> Result<impl Stream<Item = FramePacket> + Send + 'static> {
        let mut running = self.running.lock().await;

        if let Some(current) = running.take() {
            if current.worker.is_finished() {
                let exit = current.worker.join().await;
                info!(frames = exit.frames, reason = ?exit.reason, "previous worker ended, restarting");
            } else {
                let stream = frame_stream(&current.bus);
                *running = Some(current);
                return Ok(stream);
            }
        }

        let source = (self.source_factory)(&self.config.camera)?;
        let detector = MotionDetector::new(self.config.clone())?
            .with_status(self.status.clone())
            .with_backend(self.backend.clone());

        let bus = FrameBus::new(self.config.stream.bus_capacity);
        let stream = frame_stream(&bus);
        let worker = spawn_worker(detector, source, bus.clone());
        *running = Some(Running { worker, bus });
        info!("camera opened, detector worker running");
        Ok(stream)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.current()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.subscribe()
    }

    /// Retained recordings, newest first.
    pub fn list_recordings(&self) -> Result<Vec<String>> {
        Ok(self.sink.list()?)
    }

    pub fn read_recording(&self, file_name: &str) -> Result<Vec<u8>> {
        self.sink.read(file_name)
    }

    pub fn event_log_lines(&self) -> Result<Vec<String>> {
        Ok(read_log_lines(&self.config.event_log.path)?)
    }

    /// Stops the worker and waits until the camera is released. `None` when idle.
    pub async fn release_camera(&self) -> Option<WorkerExit> {
        let current = self.running.lock().await.take()?;
        current.worker.stop();
        let exit = current.worker.join().await;
        info!(frames = exit.frames, reason = ?exit.reason, "camera released");
        Some(exit)
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|current| !current.worker.is_finished())
    }
}

impl Drop for Sentry {
    fn drop(&mut self) {
        if let Some(current) = self.running.get_mut().as_ref() {
            current.worker.stop();
        }
    }
}
