// THEORY:
// The worker is the single, pull-driven frame loop. It owns the detector and
// the frame source exclusively and runs on a blocking tokio thread, because
// both capture and detection are synchronous CPU/IO work. One frame is fully
// processed (detect, record, log, publish) before the next is requested.
//
// Control flows in through a `watch` channel (the stop flag), data flows out
// through the `FrameBus` and the status channel held by the detector. On every
// exit path, a panic included, the detector is shut down and the source
// released, in that order, before the bus is closed.

use crate::core_modules::frame::{Frame, FrameSource};
use crate::core_modules::render::render;
use crate::pipeline::{FrameReport, MotionDetector};
use crate::stream::{FrameBus, FrameFormat, FramePacket};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The source ran out of frames.
    EndOfStream,
    /// `stop` was requested.
    Stopped,
    /// The source failed. The loop does not retry.
    DeviceFault(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub frames: u64,
    pub reason: ExitReason,
}

pub struct WorkerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    /// Asks the loop to stop after the frame it is currently processing.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> WorkerExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(error = %e, "detector worker panicked");
                WorkerExit {
                    frames: 0,
                    reason: ExitReason::DeviceFault(format!("worker failed: {e}")),
                }
            }
        }
    }
}

/// Starts the frame loop on a blocking thread of the current runtime.
pub fn spawn_worker<S>(detector: MotionDetector, source: S, bus: FrameBus) -> WorkerHandle
where
    S: FrameSource + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::task::spawn_blocking(move || run_loop(detector, source, bus, stop_rx));
    WorkerHandle { stop_tx, task }
}

/// Everything the loop owns. Dropping it shuts the detector down, releases the
/// source and closes the bus, in that order, also while unwinding from a panic.
struct LoopResources<S: FrameSource> {
    detector: MotionDetector,
    source: S,
    bus: FrameBus,
}

impl<S: FrameSource> Drop for LoopResources<S> {
    fn drop(&mut self) {
        self.detector.shutdown();
        self.source.release();
        self.bus.close();
    }
}

fn run_loop<S: FrameSource>(
    detector: MotionDetector,
    source: S,
    bus: FrameBus,
    stop_rx: watch::Receiver<bool>,
) -> WorkerExit {
    info!("detector worker started");
    let mut frames = 0u64;
    let mut resources = LoopResources { detector, source, bus };

    let reason = loop {
        if *stop_rx.borrow() {
            break ExitReason::Stopped;
        }
        match resources.source.next_frame() {
            Ok(Some(frame)) => {
                frames += 1;
                let report = resources.detector.process(&frame);
                if resources.bus.has_subscribers() {
                    publish_display_frame(&resources.detector, &resources.bus, &frame, &report);
                }
            }
            Ok(None) => break ExitReason::EndOfStream,
            Err(e) => {
                error!(error = %e, "frame source failed");
                break ExitReason::DeviceFault(e.to_string());
            }
        }
    };

    drop(resources);
    info!(frames, ?reason, "detector worker stopped");
    WorkerExit { frames, reason }
}

fn publish_display_frame(detector: &MotionDetector, bus: &FrameBus, frame: &Frame, report: &FrameReport) {
    let stream = &detector.config().stream;
    let annotated = render::annotate(frame.image(), &report.regions, report.recording);
    let display = render::side_by_side(&annotated, &report.mask, stream.display_height);

    match render::encode_jpeg(&display, stream.jpeg_quality) {
        Ok(data) => {
            let packet = FramePacket {
                ts_millis: frame.captured_at().timestamp_millis().max(0) as u64,
                width: display.width(),
                height: display.height(),
                format: FrameFormat::Jpeg,
                data: Arc::from(data.into_boxed_slice()),
            };
            let viewers = bus.publish(packet);
            debug!(viewers, "display frame published");
        }
        Err(e) => warn!(error = %e, "failed to encode display frame"),
    }
}
