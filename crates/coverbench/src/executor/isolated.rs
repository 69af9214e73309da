//! Process-isolated execution through fork agents.
//!
//! Every case runs in a fresh agent process. The agent prints the coverage
//! indicator line and one JSON document on success; the parent kills it if
//! it outlives the process timeout. Any failure aborts the snippet.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::coverage::{wire, CoverageAggregator, CoverageInfo};
use crate::result::{AgentFailure, HarnessError, HarnessResult};
use crate::snippet::{SnippetLayout, TestCase};

/// Lower bound of the grace period added to the case timeout
pub const MIN_PROCESS_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for output readers once the agent has exited
const READER_DRAIN: Duration = Duration::from_secs(5);

/// How long to wait for output readers after killing the agent
const KILLED_READER_DRAIN: Duration = Duration::from_millis(500);

/// Process-level timeout: `case_timeout + max(min_grace, case_timeout / 10)`
#[must_use]
pub fn process_timeout(case_timeout: Duration, min_grace: Duration) -> Duration {
    case_timeout + min_grace.max(case_timeout / 10)
}

/// Program and leading arguments that start a fork agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    /// Program to execute
    pub program: PathBuf,
    /// Arguments placed before the protocol arguments
    pub prefix_args: Vec<String>,
}

impl AgentCommand {
    /// Create a command running `program`
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    /// Add a leading argument
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.prefix_args.push(arg.into());
        self
    }

    /// Add leading arguments
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Where a fork agent finds the snippet it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTarget {
    layout: SnippetLayout,
    snippet: String,
}

impl AgentTarget {
    /// Target snippet `snippet` of the run described by `layout`
    #[must_use]
    pub fn new(layout: SnippetLayout, snippet: impl Into<String>) -> Self {
        Self {
            layout,
            snippet: snippet.into(),
        }
    }

    /// Protocol arguments for `case`: project, results root, tool, run tag,
    /// snippet, test unit, test method
    #[must_use]
    pub fn protocol_args(&self, case: &TestCase) -> Vec<String> {
        vec![
            self.layout.project_dir().to_string_lossy().into_owned(),
            self.layout.results_root().to_string_lossy().into_owned(),
            self.layout.tool().to_string(),
            self.layout.run_tag().to_string(),
            self.snippet.clone(),
            case.unit.clone(),
            case.method.clone(),
        ]
    }
}

/// Stdout or stderr of an agent, collected on a reader thread
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl Capture {
    fn start<R: Read + Send + 'static>(mut source: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let reader = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buffer, reader }
    }

    /// Text read so far, waiting up to `drain` for the reader to reach EOF.
    /// A grandchild holding the pipe open must not hang the parent.
    fn finish(self, drain: Duration) -> String {
        let deadline = Instant::now() + drain;
        while !self.reader.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if self.reader.is_finished() {
            let _ = self.reader.join();
        }
        let bytes = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Runs each case of a snippet in its own fork agent process
#[derive(Debug, Clone)]
pub struct IsolatedExecutor {
    command: AgentCommand,
    case_timeout: Duration,
    min_grace: Duration,
}

impl IsolatedExecutor {
    /// Create an executor
    #[must_use]
    pub fn new(command: AgentCommand, case_timeout: Duration) -> Self {
        Self {
            command,
            case_timeout,
            min_grace: MIN_PROCESS_GRACE,
        }
    }

    /// Override the lower bound of the grace period
    #[must_use]
    pub const fn with_minimum_grace(mut self, grace: Duration) -> Self {
        self.min_grace = grace;
        self
    }

    /// Timeout enforced on each agent process
    #[must_use]
    pub fn timeout(&self) -> Duration {
        process_timeout(self.case_timeout, self.min_grace)
    }

    fn spawn(&self, target: &AgentTarget, case: &TestCase) -> HarnessResult<Child> {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.prefix_args)
            .args(target.protocol_args(case))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(case = %case.id, program = %self.command.program.display(), "spawning fork agent");
        command.spawn().map_err(|err| HarnessError::Agent {
            case: case.id.clone(),
            failure: AgentFailure::SpawnFailed {
                message: format!("{}: {err}", self.command.program.display()),
            },
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    /// Run one case; any protocol violation is an [`HarnessError::Agent`]
    pub fn run_case(&self, target: &AgentTarget, case: &TestCase) -> HarnessResult<CoverageInfo> {
        let mut child = self.spawn(target, case)?;
        let stdout = child.stdout.take().map(Capture::start);
        let stderr = child.stderr.take().map(Capture::start);

        let limit = self.timeout();
        let waited = match child.wait_timeout(limit) {
            Ok(waited) => waited,
            Err(err) => {
                drop(child.kill());
                drop(child.wait());
                return Err(err.into());
            }
        };
        let (failure, drain) = match waited {
            Some(status) if status.success() => (None, READER_DRAIN),
            Some(status) => (Some(AgentFailure::NonZeroExit { code: status.code() }), READER_DRAIN),
            None => {
                warn!(case = %case.id, timeout_ms = limit.as_millis(), "fork agent timed out, killing");
                drop(child.kill());
                drop(child.wait());
                let after_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                (Some(AgentFailure::TimedOut { after_ms }), KILLED_READER_DRAIN)
            }
        };

        let stdout = stdout.map(|c| c.finish(drain)).unwrap_or_default();
        let stderr = stderr.map(|c| c.finish(drain)).unwrap_or_default();
        let failure = match failure {
            Some(failure) => failure,
            None => match wire::parse_agent_stdout(&stdout) {
                Ok(coverage) => return Ok(coverage),
                Err(failure) => failure,
            },
        };
        Err(HarnessError::Agent {
            case: case.id.clone(),
            failure,
            stdout,
            stderr,
        })
    }

    /// Run every case, merging coverage; the first failure aborts the batch
    pub fn run_batch(
        &self,
        target: &AgentTarget,
        cases: &[TestCase],
        aggregator: &mut CoverageAggregator,
    ) -> HarnessResult<()> {
        for case in cases {
            let coverage = self.run_case(target, case)?;
            aggregator.fold(&coverage);
            info!(case = %case.id, files = coverage.files().count(), "fork agent finished");
        }
        Ok(())
    }
}
