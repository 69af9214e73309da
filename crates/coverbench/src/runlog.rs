//! Timestamped run log of skips and failures.
//!
//! One line per event, appended to `<results>/<tool>/<run-tag>/run.log`:
//!
//! ```text
//! 2026-03-14T09:26:53.589+00:00 WARN  [max3] case c7 failed unexpectedly: panic: overflow
//! ```
//!
//! Every entry is mirrored to `tracing`.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use tracing::{error, info, warn};

/// Severity of a run log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLogLevel {
    /// Progress
    Info,
    /// Skips and recoverable failures
    Warn,
    /// Fatal conditions
    Error,
}

impl fmt::Display for RunLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        write!(f, "{name:<5}")
    }
}

/// Append-only run log shared by every snippet of a run
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    /// Open (or create) the log at `path`
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Log file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry for `snippet`
    pub fn record(&self, level: RunLogLevel, snippet: &str, message: &str) {
        match level {
            RunLogLevel::Info => info!(snippet, "{message}"),
            RunLogLevel::Warn => warn!(snippet, "{message}"),
            RunLogLevel::Error => error!(snippet, "{message}"),
        }
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, false);
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let written = writeln!(file, "{stamp} {level} [{snippet}] {message}").and_then(|()| file.flush());
        if let Err(err) = written {
            error!(path = %self.path.display(), error = %err, "failed to append to run log");
        }
    }

    /// Append an info entry
    pub fn info(&self, snippet: &str, message: &str) {
        self.record(RunLogLevel::Info, snippet, message);
    }

    /// Append a warning entry
    pub fn warn(&self, snippet: &str, message: &str) {
        self.record(RunLogLevel::Warn, snippet, message);
    }

    /// Append an error entry
    pub fn error(&self, snippet: &str, message: &str) {
        self.record(RunLogLevel::Error, snippet, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_timestamped_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool/tag/run.log");
        {
            let log = RunLog::open(&path).unwrap();
            log.warn("s1", "skipped: no suite");
        }
        let log = RunLog::open(&path).unwrap();
        log.error("s2", "agent killed");

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("WARN  [s1] skipped: no suite"));
        assert!(lines[1].contains("ERROR [s2] agent killed"));
        let stamp = lines[0].split(' ').next().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }
}
