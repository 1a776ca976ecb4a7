// THEORY:
// The event logger keeps a human-readable history of motion episodes in a
// plain text file:
//
//     Motion Detection Log
//     ===================
//
//     Motion Detected - 2024-03-09 08:05:09
//     Motion Ended - Duration: 3.50 seconds
//     --------------------------------------------------
//
// Every event is one `write_all` on a file opened in append mode, so a reader
// never sees half an entry. In `Append` mode prior runs are kept and the file
// is rotated to `<path>.1`, `<path>.2`, ... once it grows past `max_bytes`.
// `Truncate` mode starts every run with a fresh file.
//
// Write failures are reported to the caller as `EventLogError`; the detector
// logs them and carries on.

use crate::config::{EventLogConfig, LogMode};
use crate::error::EventLogError;
use chrono::{DateTime, Local};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const HEADER: &str = "Motion Detection Log\n===================\n\n";
const SEPARATOR_WIDTH: usize = 50;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct EventLogger {
    path: PathBuf,
    max_bytes: u64,
    keep_rotated: usize,
}

impl EventLogger {
    /// Prepares the log file according to the configured mode.
    pub fn open(config: &EventLogConfig) -> Result<Self, EventLogError> {
        let logger = Self {
            path: config.path.clone(),
            max_bytes: config.max_bytes,
            keep_rotated: config.keep_rotated,
        };

        if let Some(parent) = logger.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| logger.io_error(e))?;
        }

        match config.mode {
            LogMode::Truncate => {
                std::fs::write(&logger.path, HEADER).map_err(|e| logger.io_error(e))?;
            }
            LogMode::Append => logger.prepare_for_append()?,
        }
        info!(path = %logger.path.display(), mode = ?config.mode, "event log ready");
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_start(&mut self, started_at: DateTime<Local>) -> Result<(), EventLogError> {
        let entry = format!("Motion Detected - {}\n", started_at.format(TIMESTAMP_FORMAT));
        self.append(&entry)
    }

    /// Writes the closing entry. The duration is measured from `started_at`.
    pub fn log_end(
        &mut self,
        started_at: DateTime<Local>,
        ended_at: DateTime<Local>,
    ) -> Result<(), EventLogError> {
        let entry = format!(
            "Motion Ended - Duration: {:.2} seconds\n{}\n",
            duration_secs(started_at, ended_at),
            "-".repeat(SEPARATOR_WIDTH)
        );
        self.append(&entry)
    }

    pub fn read_lines(&self) -> Result<Vec<String>, EventLogError> {
        read_log_lines(&self.path)
    }

    fn append(&mut self, entry: &str) -> Result<(), EventLogError> {
        self.prepare_for_append()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(entry.as_bytes()).map_err(|e| self.io_error(e))
    }

    /// Rotates an oversized file and writes the header into a new or empty one.
    fn prepare_for_append(&self) -> Result<(), EventLogError> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(self.io_error(e)),
        };

        if size > self.max_bytes {
            self.rotate()?;
            return std::fs::write(&self.path, HEADER).map_err(|e| self.io_error(e));
        }
        if size == 0 {
            return std::fs::write(&self.path, HEADER).map_err(|e| self.io_error(e));
        }
        Ok(())
    }

    fn rotate(&self) -> Result<(), EventLogError> {
        if self.keep_rotated == 0 {
            debug!(path = %self.path.display(), "event log over size, truncating");
            return Ok(());
        }

        let oldest = rotated_path(&self.path, self.keep_rotated);
        if oldest.exists() {
            std::fs::remove_file(&oldest).map_err(|e| self.io_error(e))?;
        }
        for index in (1..self.keep_rotated).rev() {
            let from = rotated_path(&self.path, index);
            if from.exists() {
                std::fs::rename(&from, rotated_path(&self.path, index + 1))
                    .map_err(|e| self.io_error(e))?;
            }
        }
        std::fs::rename(&self.path, rotated_path(&self.path, 1)).map_err(|e| self.io_error(e))?;
        info!(path = %self.path.display(), keep = self.keep_rotated, "event log rotated");
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> EventLogError {
        EventLogError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Lines of the log at `path`. A missing file reads as empty.
pub fn read_log_lines(path: &Path) -> Result<Vec<String>, EventLogError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(EventLogError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn rotated_path(path: &Path, index: usize) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn duration_secs(started_at: DateTime<Local>, ended_at: DateTime<Local>) -> f64 {
    ((ended_at - started_at).num_milliseconds() as f64 / 1000.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn config_in(dir: &Path, mode: LogMode) -> EventLogConfig {
        EventLogConfig {
            path: dir.join("logs").join("motion_log.txt"),
            mode,
            ..EventLogConfig::default()
        }
    }

    fn at(second: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 9, 8, 5, second)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn writes_header_and_paired_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut logger = EventLogger::open(&config_in(dir.path(), LogMode::Append)).expect("open");

        logger.log_start(at(9)).expect("start");
        logger
            .log_end(at(9), at(9) + Duration::milliseconds(3500))
            .expect("end");

        assert_eq!(
            logger.read_lines().expect("read"),
            vec![
                "Motion Detection Log",
                "===================",
                "",
                "Motion Detected - 2024-03-09 08:05:09",
                "Motion Ended - Duration: 3.50 seconds",
                "--------------------------------------------------",
            ]
        );
    }

    #[test]
    fn append_mode_keeps_previous_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path(), LogMode::Append);
        {
            let mut logger = EventLogger::open(&config).expect("open");
            logger.log_start(at(1)).expect("start");
        }
        let logger = EventLogger::open(&config).expect("reopen");
        let lines = logger.read_lines().expect("read");
        assert_eq!(lines.iter().filter(|l| l.starts_with("Motion Detection Log")).count(), 1);
        assert!(lines.contains(&"Motion Detected - 2024-03-09 08:05:01".to_string()));
    }

    #[test]
    fn truncate_mode_discards_previous_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path(), LogMode::Truncate);
        {
            let mut logger = EventLogger::open(&config).expect("open");
            logger.log_start(at(1)).expect("start");
        }
        let logger = EventLogger::open(&config).expect("reopen");
        assert_eq!(
            logger.read_lines().expect("read"),
            vec!["Motion Detection Log", "===================", ""]
        );
    }

    #[test]
    fn oversized_log_is_rotated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EventLogConfig {
            max_bytes: 120,
            keep_rotated: 2,
            ..config_in(dir.path(), LogMode::Append)
        };
        let mut logger = EventLogger::open(&config).expect("open");
        for second in 0..6 {
            logger.log_start(at(second)).expect("start");
            logger.log_end(at(second), at(second + 1)).expect("end");
        }

        assert!(rotated_path(&config.path, 1).exists());
        assert!(rotated_path(&config.path, 2).exists());
        assert!(!rotated_path(&config.path, 3).exists());

        let current = std::fs::read_to_string(&config.path).expect("current log");
        assert!(current.starts_with(HEADER));
        assert!(current.len() as u64 <= config.max_bytes + 200);
    }

    #[test]
    fn negative_duration_clamps_to_zero() {
        assert_eq!(duration_secs(at(5), at(4)), 0.0);
        assert_eq!(format!("{:.2}", duration_secs(at(4), at(5))), "1.00");
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(read_log_lines(&dir.path().join("nope.txt")).expect("read").is_empty());
    }
}
