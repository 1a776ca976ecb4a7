// THEORY:
// The `motion_state` module is the temporal core of the recorder. It turns the
// per-frame "did the extractor find anything?" answer into discrete
// `MotionEpisode`s with a start and an end.
//
// Key architectural principles:
// 1.  **Two States**: `Idle` and `Active`. At most one episode is open at any
//     time. This holds because there is a single producer calling `observe`,
//     not because of locking.
// 2.  **Pure Decisions**: `MotionStateMachine::observe` only returns a
//     `Transition`. Opening recordings, writing the event log and publishing
//     status are the detector's job, which keeps this module free of I/O.
// 3.  **Debounce**: An episode closes after `close_after_empty_frames`
//     consecutive motion-free frames. The default of 1 closes on the first
//     empty frame. The close timestamp is the first empty frame of the run.
// 4.  **Lifecycle**: An episode is born on `Idle -> Active`, accumulates
//     recording bookkeeping while active, and is completed on
//     `Active -> Idle` or by `force_close` during shutdown.

use chrono::{DateTime, Local};

/// One contiguous period of detected motion.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionEpisode {
    /// Sequential id, unique for the lifetime of the process.
    pub id: u64,
    pub started_at: DateTime<Local>,
    /// Unset while the episode is active.
    pub ended_at: Option<DateTime<Local>>,
    /// File name of the recording artifact, once one has been opened.
    pub recording: Option<String>,
    /// Number of frames successfully handed to the recording.
    pub frames_written: u64,
}

impl MotionEpisode {
    fn new(id: u64, started_at: DateTime<Local>) -> Self {
        Self {
            id,
            started_at,
            ended_at: None,
            recording: None,
            frames_written: 0,
        }
    }

    fn complete(&mut self, ended_at: DateTime<Local>) {
        self.ended_at = Some(ended_at);
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Whether any frame was actually persisted for this episode.
    pub fn frame_written(&self) -> bool {
        self.frames_written > 0
    }

    /// Episode length in seconds. Zero while the episode is still open, and
    /// never negative when the clock stepped back during the episode.
    pub fn duration_secs(&self) -> f64 {
        match self.ended_at {
            Some(end) => ((end - self.started_at).num_milliseconds() as f64 / 1000.0).max(0.0),
            None => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    Active,
}

/// What a single observation changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    None,
    Started(MotionEpisode),
    Ended(MotionEpisode),
}

/// Tracks whether motion is active and produces episode transitions.
pub struct MotionStateMachine {
    close_after_empty_frames: u32,
    open_episode: Option<MotionEpisode>,
    empty_run: u32,
    /// Timestamp of the first motion-free frame of the current empty run.
    first_empty_at: Option<DateTime<Local>>,
    next_id: u64,
}

impl MotionStateMachine {
    pub fn new(close_after_empty_frames: u32) -> Self {
        Self {
            close_after_empty_frames: close_after_empty_frames.max(1),
            open_episode: None,
            empty_run: 0,
            first_empty_at: None,
            next_id: 1,
        }
    }

    pub fn state(&self) -> MotionState {
        if self.open_episode.is_some() {
            MotionState::Active
        } else {
            MotionState::Idle
        }
    }

    pub fn open_episode(&self) -> Option<&MotionEpisode> {
        self.open_episode.as_ref()
    }

    pub fn open_episode_mut(&mut self) -> Option<&mut MotionEpisode> {
        self.open_episode.as_mut()
    }

    /// Feeds one frame's detection result into the machine.
    pub fn observe(&mut self, motion_detected: bool, at: DateTime<Local>) -> Transition {
        match (self.open_episode.is_some(), motion_detected) {
            (false, true) => {
                let episode = MotionEpisode::new(self.next_id, at);
                self.next_id += 1;
                self.empty_run = 0;
                self.first_empty_at = None;
                self.open_episode = Some(episode.clone());
                Transition::Started(episode)
            }
            (true, true) => {
                self.empty_run = 0;
                self.first_empty_at = None;
                Transition::None
            }
            (true, false) => {
                self.empty_run += 1;
                let first_empty = *self.first_empty_at.get_or_insert(at);
                if self.empty_run >= self.close_after_empty_frames {
                    self.close(first_empty)
                } else {
                    Transition::None
                }
            }
            (false, false) => Transition::None,
        }
    }

    /// Closes the open episode regardless of detections, e.g. on shutdown.
    pub fn force_close(&mut self, at: DateTime<Local>) -> Transition {
        if self.open_episode.is_none() {
            return Transition::None;
        }
        self.close(at)
    }

    fn close(&mut self, at: DateTime<Local>) -> Transition {
        self.empty_run = 0;
        self.first_empty_at = None;
        match self.open_episode.take() {
            Some(mut episode) => {
                episode.complete(at);
                Transition::Ended(episode)
            }
            None => Transition::None,
        }
    }
}
