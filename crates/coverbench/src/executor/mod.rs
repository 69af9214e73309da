//! Test case execution.
//!
//! Two strategies share the types in this module:
//!
//! - [`BoundedExecutor`] runs cases on a worker thread of this process and
//!   reclaims whatever a runaway case leaked.
//! - [`IsolatedExecutor`] runs each case in a disposable fork agent process.

mod bounded;
mod isolated;

pub use bounded::{BoundedExecutor, ExecutionLimits};
pub use isolated::{process_timeout, AgentCommand, AgentTarget, IsolatedExecutor, MIN_PROCESS_GRACE};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::ToSocketAddrs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instrument::{CodeLoader, CodeObject, LoadError};
use crate::snippet::TestCase;
use crate::tracker::{self, ResourceTracker, TrackedListener, TrackedStream};

/// Category of a test failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An assertion in the test or the snippet failed
    Assertion,
    /// An index or range was out of bounds
    IndexOutOfBounds,
    /// A required value was absent
    MissingValue,
    /// Any other panic
    Panic,
    /// An error returned by the test body
    Error,
    /// The case was stopped after its timeout
    Stopped,
}

impl FailureKind {
    /// Failures attributable to the snippet under test
    #[must_use]
    pub const fn is_benign(self) -> bool {
        matches!(
            self,
            Self::Assertion | Self::IndexOutOfBounds | Self::MissingValue
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Assertion => "assertion",
            Self::IndexOutOfBounds => "index_out_of_bounds",
            Self::MissingValue => "missing_value",
            Self::Panic => "panic",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A failed test case
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TestFailure {
    /// Failure category
    pub kind: FailureKind,
    /// Failure message
    pub message: String,
}

impl TestFailure {
    /// Create a failure of the given kind
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an assertion failure
    #[must_use]
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Assertion, message)
    }

    /// Create an error failure
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Error, message)
    }

    /// Classify a panic message
    #[must_use]
    pub fn from_panic_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(classify_panic(&message), message)
    }
}

impl From<LoadError> for TestFailure {
    fn from(err: LoadError) -> Self {
        Self::error(err.to_string())
    }
}

impl From<io::Error> for TestFailure {
    fn from(err: io::Error) -> Self {
        Self::error(err.to_string())
    }
}

fn panic_patterns() -> &'static [(Regex, FailureKind)] {
    static PATTERNS: OnceLock<Vec<(Regex, FailureKind)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"index out of bounds|out of range for slice|out of bounds", FailureKind::IndexOutOfBounds),
            (r"called `(Option|Result)::unwrap\(\)` on a `(None|Err)` value", FailureKind::MissingValue),
            (r"^assertion", FailureKind::Assertion),
        ]
        .into_iter()
        .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
        .collect()
    })
}

fn classify_panic(message: &str) -> FailureKind {
    panic_patterns()
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map_or(FailureKind::Panic, |(_, kind)| *kind)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Body of a generated test
pub type TestBody = Arc<dyn Fn(&TestContext) -> Result<(), TestFailure> + Send + Sync>;

/// Compiled-in generated tests, keyed by unit and method
#[derive(Default, Clone)]
pub struct TestRegistry {
    bodies: HashMap<(String, String), TestBody>,
}

impl fmt::Debug for TestRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.bodies.keys().collect();
        keys.sort();
        f.debug_struct("TestRegistry").field("tests", &keys).finish()
    }
}

impl TestRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a test body
    pub fn register<F>(&mut self, unit: impl Into<String>, method: impl Into<String>, body: F)
    where
        F: Fn(&TestContext) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.bodies.insert((unit.into(), method.into()), Arc::new(body));
    }

    /// Register a test body (builder form)
    #[must_use]
    pub fn with_test<F>(mut self, unit: impl Into<String>, method: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TestContext) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.register(unit, method, body);
        self
    }

    /// Look up a test body
    #[must_use]
    pub fn get(&self, unit: &str, method: &str) -> Option<TestBody> {
        self.bodies
            .get(&(unit.to_string(), method.to_string()))
            .cloned()
    }

    /// Number of registered tests
    #[must_use]
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

/// What a running test body can reach
#[derive(Debug, Clone)]
pub struct TestContext {
    case: TestCase,
    loader: Arc<dyn CodeLoader>,
    tracker: Arc<ResourceTracker>,
    load_error: Arc<Mutex<Option<LoadError>>>,
}

impl TestContext {
    /// Create a context for one case
    #[must_use]
    pub fn new(case: TestCase, loader: Arc<dyn CodeLoader>, tracker: Arc<ResourceTracker>) -> Self {
        Self {
            case,
            loader,
            tracker,
            load_error: Arc::new(Mutex::new(None)),
        }
    }

    /// The running case
    #[must_use]
    pub fn case(&self) -> &TestCase {
        &self.case
    }

    /// Parameter `index`, if present
    #[must_use]
    pub fn param(&self, index: usize) -> Option<&serde_json::Value> {
        self.case.params.get(index)
    }

    /// Parameter `index` as an integer
    pub fn param_i64(&self, index: usize) -> Result<i64, TestFailure> {
        self.param(index)
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| TestFailure::error(format!("parameter {index} is not an integer")))
    }

    /// Load a code unit through the snippet's loader.
    ///
    /// A load failure fails the case and is reported as fatal for the snippet.
    pub fn load(&self, name: &str) -> Result<Arc<CodeObject>, TestFailure> {
        self.loader.load(name).map_err(|err| {
            let failure = TestFailure::from(&err);
            let mut slot = self.load_error.lock().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert(err);
            failure
        })
    }

    /// Spawn a tracked thread
    pub fn spawn<F, T>(&self, name: &str, f: F) -> Result<JoinHandle<T>, TestFailure>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.tracker.spawn(Some(name.to_string()), f)?)
    }

    /// Sleep, stopping early if the case is stopped
    pub fn sleep(&self, duration: Duration) {
        tracker::interruptible_sleep(duration);
    }

    /// Open a tracked TCP connection
    pub fn connect(&self, addr: impl ToSocketAddrs) -> Result<TrackedStream, TestFailure> {
        Ok(self.tracker.connect(addr)?)
    }

    /// Bind a tracked TCP listener
    pub fn bind(&self, addr: impl ToSocketAddrs) -> Result<TrackedListener, TestFailure> {
        Ok(self.tracker.bind(addr)?)
    }

    /// Explicit safepoint for bodies that loop without touching probes
    pub fn checkpoint(&self) {
        tracker::safepoint();
    }

    pub(crate) fn take_load_error(&self) -> Option<LoadError> {
        self.load_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl From<&LoadError> for TestFailure {
    fn from(err: &LoadError) -> Self {
        Self::error(err.to_string())
    }
}

/// Phase of one case in the bounded executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasePhase {
    /// Created, not yet started
    Init,
    /// Body running on the worker
    Running,
    /// Body returned before the timeout
    Completed,
    /// Timeout elapsed, stop requested
    TimedOut,
    /// Leaked resources released
    Reclaimed,
}

/// Result of one case
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    /// The case passed, or failed the way it was expected to
    Passed,
    /// The case failed
    Failed {
        /// What went wrong
        failure: TestFailure,
        /// Attributable to the snippet rather than the harness
        benign: bool,
    },
    /// The case was stopped after its timeout and reclaimed
    TimedOut {
        /// Reclamation passes needed
        reclaim_attempts: u32,
    },
}

impl CaseOutcome {
    /// Outcome of a finished body, given the expected failure kind
    #[must_use]
    pub fn judge(result: Result<(), TestFailure>, expected: Option<FailureKind>) -> Self {
        match (result, expected) {
            (Ok(()), None) => Self::Passed,
            (Ok(()), Some(kind)) => Self::Failed {
                failure: TestFailure::assertion(format!("expected {kind} failure did not occur")),
                benign: true,
            },
            (Err(failure), Some(kind)) if failure.kind == kind => Self::Passed,
            (Err(failure), _) => Self::Failed {
                benign: failure.kind.is_benign(),
                failure,
            },
        }
    }

    /// Whether the case passed
    #[must_use]
    pub const fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Report of one executed case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseReport {
    /// Case identifier
    pub case: String,
    /// Last phase reached
    pub phase: CasePhase,
    /// Outcome
    pub outcome: CaseOutcome,
    /// Wall time spent, including reclamation
    pub duration: Duration,
}

/// Run a body, converting panics into failures.
///
/// A forced stop surfaces as [`FailureKind::Stopped`].
pub fn run_body(body: &TestBody, ctx: &TestContext) -> Result<(), TestFailure> {
    match panic::catch_unwind(AssertUnwindSafe(|| body(ctx))) {
        Ok(result) => result,
        Err(payload) if tracker::is_forced_stop(payload.as_ref()) => Err(TestFailure::new(
            FailureKind::Stopped,
            "stopped at safepoint",
        )),
        Err(payload) => Err(TestFailure::from_panic_message(panic_message(payload.as_ref()))),
    }
}
