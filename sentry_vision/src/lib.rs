// THEORY:
// This file is the entry point of the `sentry_vision` library crate, the core of
// a motion-triggered surveillance recorder. It exports three layers:
//
// 1.  `core_modules`: the individual stages (background model, mask refiner,
//     region extractor, motion state machine, recording sink, event logger,
//     rendering, status) as small, separately testable units.
// 2.  `pipeline::MotionDetector`: the detector context that chains the stages
//     for one frame at a time.
// 3.  `service::Sentry`: the facade an outer web/auth layer calls. It runs the
//     detector on a dedicated worker (`worker`) and hands out display frames
//     (`stream`) and status snapshots.
//
// Authentication, HTTP routing and the transport encoding of the display stream
// belong to the outer layer and are not part of this crate.

pub mod config;
pub mod core_modules;
pub mod error;
#[cfg(feature = "opencv")]
pub mod opencv_backend;
pub mod pipeline;
pub mod service;
pub mod stream;
pub mod worker;

pub use config::{LogMode, SentryConfig};
pub use core_modules::frame::{Frame, FrameSource, ImageSequenceSource, IterSource};
pub use core_modules::motion_region::MotionRegion;
pub use core_modules::motion_state::{MotionEpisode, MotionState, Transition};
pub use core_modules::recording_sink::{ClipBackend, ClipWriter, MjpegBackend, RecordingOutcome};
pub use core_modules::status::{StatusHandle, StatusSnapshot};
pub use error::{Result, SentryError};
pub use pipeline::{FrameReport, MotionDetector};
pub use service::{Sentry, SourceFactory, source_factory};
pub use stream::{FrameBus, FrameFormat, FramePacket, frame_stream};
pub use worker::{ExitReason, WorkerExit, WorkerHandle, spawn_worker};
