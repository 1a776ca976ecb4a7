// THEORY:
// Errors are grouped by who can recover from them. A device fault ends the
// frame loop. Storage faults (recording, event log) stay inside the component
// that hit them and are only logged, so detection keeps running. Configuration
// faults are caught before the worker starts.

use std::path::PathBuf;
use thiserror::Error;

/// Camera or frame-source failure. Terminates the frame loop.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open frame source {source_name}: {reason}")]
    Open { source_name: String, reason: String },

    #[error("failed to read frame: {0}")]
    Read(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while creating, writing or finalizing a recording artifact.
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("recording IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("frame encode error: {0}")]
    Encode(#[from] image::ImageError),

    #[error("video backend error: {0}")]
    Backend(String),
}

impl RecordingError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RecordingError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure while appending to the motion event log.
#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("event log IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the service facade to the web/auth layer.
#[derive(Error, Debug)]
pub enum SentryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown recording: {0}")]
    UnknownRecording(String),
}

pub type Result<T, E = SentryError> = std::result::Result<T, E>;
