// THEORY:
// The `pipeline` module is the detector context: one explicitly owned object
// holding everything the frame loop mutates. It is created by the service,
// moved into the worker, and dropped there. Nothing else touches the
// background model, the open episode or the recording handle.
//
// Per frame, `MotionDetector::process` runs the stages in a fixed order:
//   1. Background model: frame -> raw foreground mask.
//   2. Mask refiner: erosion then dilation.
//   3. Region extractor: connected components above the area threshold.
//   4. Motion state machine: regions present? -> transition.
//   5. Side effects of the transition: recording sink, event log, status.
//   6. While an episode is active, the frame goes into the recording.
//
// Storage faults in step 5 and 6 are logged and swallowed; detection carries
// on. `shutdown` force-closes an open episode through the same path as a
// normal close, and `Drop` calls it too, so an artifact and its log entry are
// finalized on every exit path, panics included.

use crate::config::SentryConfig;
use crate::core_modules::background_model::{BackgroundModel, ForegroundMask};
use crate::core_modules::event_logger::EventLogger;
use crate::core_modules::frame::Frame;
use crate::core_modules::mask_refiner::mask_refiner;
use crate::core_modules::motion_region::MotionRegion;
use crate::core_modules::motion_state::{MotionEpisode, MotionState, MotionStateMachine, Transition};
use crate::core_modules::recording_sink::{ClipBackend, RecordingHandle, RecordingOutcome, RecordingSink};
use crate::core_modules::region_extractor::region_extractor;
use crate::core_modules::render::render;
use crate::core_modules::status::{StatusHandle, StatusPublisher};
use crate::error::ConfigError;
use chrono::{DateTime, Local};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the detector saw and did for one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    /// The refined foreground mask.
    pub mask: ForegroundMask,
    pub regions: Vec<MotionRegion>,
    pub transition: Transition,
    /// Whether an episode is open after this frame.
    pub recording: bool,
    /// Whether this frame was persisted into the current recording.
    pub frame_recorded: bool,
}

impl FrameReport {
    pub fn motion_detected(&self) -> bool {
        !self.regions.is_empty()
    }
}

pub struct MotionDetector {
    config: SentryConfig,
    model: BackgroundModel,
    state: MotionStateMachine,
    sink: RecordingSink,
    recording: Option<RecordingHandle>,
    event_log: Option<EventLogger>,
    status: StatusPublisher,
    last_frame_at: Option<DateTime<Local>>,
}

impl MotionDetector {
    pub fn new(config: SentryConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let event_log = match EventLogger::open(&config.event_log) {
            Ok(logger) => Some(logger),
            Err(e) => {
                warn!(error = %e, "event log unavailable, motion events will not be logged");
                None
            }
        };

        Ok(Self {
            model: BackgroundModel::new(&config.detection),
            state: MotionStateMachine::new(config.detection.close_after_empty_frames),
            sink: RecordingSink::new(&config),
            recording: None,
            event_log,
            status: StatusPublisher::new(),
            last_frame_at: None,
            config,
        })
    }

    /// Publishes status through an existing channel instead of a private one.
    pub fn with_status(mut self, status: StatusPublisher) -> Self {
        self.status = status;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn ClipBackend>) -> Self {
        self.sink = RecordingSink::with_backend(&self.config, backend);
        self
    }

    pub fn config(&self) -> &SentryConfig {
        &self.config
    }

    pub fn state(&self) -> MotionState {
        self.state.state()
    }

    pub fn open_episode(&self) -> Option<&MotionEpisode> {
        self.state.open_episode()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.subscribe()
    }

    pub fn sink(&self) -> &RecordingSink {
        &self.sink
    }

    pub fn process(&mut self, frame: &Frame) -> FrameReport {
        let at = frame.captured_at();
        self.last_frame_at = Some(at);

        // Stage 1-3: Detection
        let raw = self.model.update(frame.image());
        let mask = mask_refiner::refine(&raw, &self.config.detection);
        let regions = region_extractor::extract(&mask, self.config.detection.min_region_area);

        // Stage 4: Temporal decision
        let transition = match self.state.observe(!regions.is_empty(), at) {
            Transition::Started(episode) => Transition::Started(self.on_episode_started(episode)),
            Transition::Ended(episode) => Transition::Ended(self.on_episode_ended(episode)),
            Transition::None => Transition::None,
        };

        // Stage 5: Recording
        let recording = self.state.state() == MotionState::Active;
        let frame_recorded = recording && self.record(frame, &regions);

        FrameReport {
            mask,
            regions,
            transition,
            recording,
            frame_recorded,
        }
    }

    /// Closes an open episode as if motion had ended now. Does nothing when idle.
    pub fn shutdown(&mut self) -> Option<MotionEpisode> {
        let at = self.last_frame_at.unwrap_or_else(Local::now);
        match self.state.force_close(at) {
            Transition::Ended(episode) => {
                info!(episode = episode.id, "closing open episode on shutdown");
                Some(self.on_episode_ended(episode))
            }
            _ => None,
        }
    }

    fn on_episode_started(&mut self, mut episode: MotionEpisode) -> MotionEpisode {
        info!(episode = episode.id, started_at = %episode.started_at, "motion started");
        self.status.motion_started(episode.started_at);

        if let Some(log) = self.event_log.as_mut() {
            if let Err(e) = log.log_start(episode.started_at) {
                warn!(error = %e, "failed to log motion start");
            }
        }

        match self.sink.begin(&episode) {
            Ok(handle) => {
                let name = handle.file_name().to_string();
                if let Some(open) = self.state.open_episode_mut() {
                    open.recording = Some(name.clone());
                }
                episode.recording = Some(name);
                self.recording = Some(handle);
            }
            Err(e) => warn!(episode = episode.id, error = %e, "failed to start recording"),
        }
        episode
    }

    fn on_episode_ended(&mut self, mut episode: MotionEpisode) -> MotionEpisode {
        if let Some(mut handle) = self.recording.take() {
            if let RecordingOutcome::Discarded { .. } = handle.end() {
                episode.recording = None;
            }
        }

        let ended_at = episode.ended_at.unwrap_or(episode.started_at);
        if let Some(log) = self.event_log.as_mut() {
            if let Err(e) = log.log_end(episode.started_at, ended_at) {
                warn!(error = %e, "failed to log motion end");
            }
        }

        self.status.motion_ended();
        info!(
            episode = episode.id,
            duration_secs = episode.duration_secs(),
            frames = episode.frames_written,
            "motion ended"
        );
        episode
    }

    fn record(&mut self, frame: &Frame, regions: &[MotionRegion]) -> bool {
        let Some(handle) = self.recording.as_mut() else {
            return false;
        };

        let written = if self.config.recording.annotate {
            handle.write(&render::annotate(frame.image(), regions, true))
        } else {
            handle.write(frame.image())
        };

        if written {
            if let Some(open) = self.state.open_episode_mut() {
                open.frames_written += 1;
            }
        } else {
            debug!("frame not persisted");
        }
        written
    }
}

impl Drop for MotionDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
