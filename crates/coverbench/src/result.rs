//! Result and error types for Coverbench.

use std::path::PathBuf;

use thiserror::Error;

use crate::coverage::ClassifyError;
use crate::instrument::LoadError;

/// Result type for Coverbench operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Why a fork agent run was rejected by the parent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentFailure {
    /// The agent program could not be started
    #[error("could not be started: {message}")]
    SpawnFailed {
        /// OS error message
        message: String,
    },
    /// The process outlived the process-level timeout and was killed
    #[error("killed after {after_ms}ms timeout")]
    TimedOut {
        /// Timeout that was exceeded, in milliseconds
        after_ms: u64,
    },
    /// The process exited unsuccessfully (`None` when killed by a signal)
    #[error("{}", exit_status(.code.as_ref()))]
    NonZeroExit {
        /// Exit code, if the process exited normally
        code: Option<i32>,
    },
    /// Stdout never contained the coverage indicator line
    #[error("coverage indicator line missing from stdout")]
    MissingIndicator,
    /// The document after the indicator was not valid coverage JSON
    #[error("malformed coverage document: {message}")]
    MalformedCoverage {
        /// Parser message
        message: String,
    },
}

fn exit_status(code: Option<&i32>) -> String {
    match code {
        Some(code) => format!("exited with status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Errors that can occur while evaluating a snippet
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Loading or instrumenting a code unit failed
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Coverage classification failed
    #[error(transparent)]
    Classify(#[from] ClassifyError),

    /// No test body registered for a generated test
    #[error("No test registered for {unit}::{method}")]
    UnknownTest {
        /// Test unit name
        unit: String,
        /// Test method name
        method: String,
    },

    /// A stopped case still holds threads or sockets after every retry
    #[error("Reclamation of case {case} did not converge after {attempts} attempts: {leftover}")]
    ReclamationFailed {
        /// Case identifier
        case: String,
        /// Attempts made
        attempts: u32,
        /// Resources still alive
        leftover: String,
    },

    /// The fork agent for a case failed
    #[error(
        "Fork agent for case {case} {failure}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}"
    )]
    Agent {
        /// Case identifier
        case: String,
        /// What went wrong
        failure: AgentFailure,
        /// Captured stdout, verbatim
        stdout: String,
        /// Captured stderr, verbatim
        stderr: String,
    },

    /// A snippet descriptor or generated suite could not be read
    #[error("Invalid descriptor {path}: {message}")]
    Descriptor {
        /// File that was being read
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl HarnessError {
    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a descriptor error
    #[must_use]
    pub fn descriptor(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Descriptor {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Errors after which no further snippet may be evaluated
    #[must_use]
    pub const fn is_run_fatal(&self) -> bool {
        matches!(self, Self::ReclamationFailed { .. })
    }

    /// Errors that abort the snippet without scoring it
    #[must_use]
    pub const fn is_snippet_abort(&self) -> bool {
        matches!(self, Self::Agent { .. })
    }
}
