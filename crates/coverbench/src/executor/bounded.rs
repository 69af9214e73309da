//! In-process execution under a per-case timeout.
//!
//! Each case runs on a fresh worker thread. If the body has not returned
//! when the timeout elapses, the case is stopped at its next safepoint and
//! everything it opened since it started is reclaimed. Reclamation that
//! cannot converge is fatal for the whole run: an unbounded hang is worse
//! than a loud failure.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{run_body, CaseOutcome, CasePhase, CaseReport, FailureKind, TestContext, TestFailure, TestRegistry};
use crate::coverage::CoverageAggregator;
use crate::instrument::{CodeLoader, InstrumentingLoader};
use crate::result::{HarnessError, HarnessResult};
use crate::snippet::TestCase;
use crate::tracker::{CaseScope, Checkpoint, ResourceTracker};

/// Default per-case timeout
pub const DEFAULT_CASE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default number of reclamation passes
pub const DEFAULT_RECLAIM_ATTEMPTS: u32 = 5;

/// Default pause between reclamation passes
pub const DEFAULT_RECLAIM_PAUSE: Duration = Duration::from_millis(100);

/// Time and retry budget of the bounded executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// How long a case may run before it is stopped
    pub case_timeout: Duration,
    /// Reclamation passes before escalating
    pub reclaim_attempts: u32,
    /// Pause between passes
    pub reclaim_pause: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            case_timeout: DEFAULT_CASE_TIMEOUT,
            reclaim_attempts: DEFAULT_RECLAIM_ATTEMPTS,
            reclaim_pause: DEFAULT_RECLAIM_PAUSE,
        }
    }
}

impl ExecutionLimits {
    /// Set the case timeout
    #[must_use]
    pub const fn with_case_timeout(mut self, timeout: Duration) -> Self {
        self.case_timeout = timeout;
        self
    }

    /// Set the reclamation passes
    #[must_use]
    pub const fn with_reclaim_attempts(mut self, attempts: u32) -> Self {
        self.reclaim_attempts = attempts;
        self
    }

    /// Set the pause between passes
    #[must_use]
    pub const fn with_reclaim_pause(mut self, pause: Duration) -> Self {
        self.reclaim_pause = pause;
        self
    }
}

/// Runs the cases of one snippet inside this process
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    tracker: Arc<ResourceTracker>,
    registry: Arc<TestRegistry>,
    limits: ExecutionLimits,
}

impl BoundedExecutor {
    /// Create an executor
    #[must_use]
    pub fn new(tracker: Arc<ResourceTracker>, registry: Arc<TestRegistry>, limits: ExecutionLimits) -> Self {
        Self {
            tracker,
            registry,
            limits,
        }
    }

    /// Limits in effect
    #[must_use]
    pub const fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Run every case in order, folding coverage after each one.
    ///
    /// Case failures and timeouts are recorded and the batch continues.
    /// Load errors and unknown tests end the batch; coverage folded so far
    /// stays in `aggregator`.
    pub fn run_batch(
        &self,
        cases: &[TestCase],
        loader: &Arc<InstrumentingLoader>,
        aggregator: &mut CoverageAggregator,
    ) -> HarnessResult<Vec<CaseReport>> {
        let code_loader: Arc<dyn CodeLoader> = Arc::clone(loader) as Arc<dyn CodeLoader>;
        let mut reports = Vec::with_capacity(cases.len());
        for case in cases {
            let report = self.run_case(case, &code_loader);
            aggregator.observe(loader.runtime());
            reports.push(report?);
        }
        Ok(reports)
    }

    /// Run one case through `INIT → RUNNING → (COMPLETED | TIMED_OUT) → RECLAIMED`
    pub fn run_case(&self, case: &TestCase, loader: &Arc<dyn CodeLoader>) -> HarnessResult<CaseReport> {
        let body = self
            .registry
            .get(&case.unit, &case.method)
            .ok_or_else(|| HarnessError::UnknownTest {
                unit: case.unit.clone(),
                method: case.method.clone(),
            })?;

        let started = Instant::now();
        let mut phase = CasePhase::Init;
        let checkpoint = self.tracker.checkpoint();
        let scope = CaseScope::new(case.id.clone());
        let ctx = TestContext::new(case.clone(), Arc::clone(loader), Arc::clone(&self.tracker));

        let (tx, rx) = mpsc::sync_channel(1);
        let worker = {
            let scope = Arc::clone(&scope);
            let ctx = ctx.clone();
            thread::Builder::new()
                .name(format!("coverbench-case-{}", case.id))
                .spawn(move || {
                    let _scope = scope.enter();
                    let result = run_body(&body, &ctx);
                    let _ = tx.send(result);
                })?
        };
        phase = advance(&case.id, phase, CasePhase::Running);

        let outcome = match rx.recv_timeout(self.limits.case_timeout) {
            Ok(result) => {
                phase = advance(&case.id, phase, CasePhase::Completed);
                let _ = worker.join();
                // Threads the case left behind stop at their next safepoint
                scope.request_stop();
                self.tracker.interrupt_threads_since(checkpoint);
                if let Some(err) = ctx.take_load_error() {
                    self.tracker.prune();
                    return Err(err.into());
                }
                let outcome = CaseOutcome::judge(result, case.expected_failure);
                log_outcome(&case.id, &outcome);
                outcome
            }
            Err(RecvTimeoutError::Timeout) => {
                phase = advance(&case.id, phase, CasePhase::TimedOut);
                warn!(
                    case = %case.id,
                    timeout_ms = self.limits.case_timeout.as_millis(),
                    "case timed out, stopping"
                );
                scope.request_stop();
                let attempts = self.reclaim(&case.id, checkpoint, &worker)?;
                phase = advance(&case.id, phase, CasePhase::Reclaimed);
                CaseOutcome::TimedOut {
                    reclaim_attempts: attempts,
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                phase = advance(&case.id, phase, CasePhase::Completed);
                let outcome = CaseOutcome::Failed {
                    failure: TestFailure::new(FailureKind::Panic, "worker exited without a result"),
                    benign: false,
                };
                log_outcome(&case.id, &outcome);
                outcome
            }
        };

        self.tracker.prune();
        Ok(CaseReport {
            case: case.id.clone(),
            phase,
            outcome,
            duration: started.elapsed(),
        })
    }

    /// Close sockets and wake threads until nothing from the case is alive
    fn reclaim(&self, case: &str, checkpoint: Checkpoint, worker: &JoinHandle<()>) -> HarnessResult<u32> {
        let attempts = self.limits.reclaim_attempts.max(1);
        for attempt in 1..=attempts {
            let closed = self.tracker.close_sockets_since(checkpoint);
            let woken = self.tracker.interrupt_threads_since(checkpoint);
            worker.thread().unpark();
            thread::sleep(self.limits.reclaim_pause);

            let open = self.tracker.open_sockets_since(checkpoint);
            let threads = self.tracker.leaked_threads(checkpoint);
            let worker_alive = !worker.is_finished();
            debug!(case, attempt, closed, woken, open, threads = threads.len(), worker_alive, "reclamation pass");
            if open == 0 && threads.is_empty() && !worker_alive {
                info!(case, attempts = attempt, "case reclaimed");
                return Ok(attempt);
            }
        }

        let mut leftover = self.tracker.leaked_threads(checkpoint);
        if !worker.is_finished() {
            leftover.push(worker.thread().name().unwrap_or("worker").to_string());
        }
        let open = self.tracker.open_sockets_since(checkpoint);
        if open > 0 {
            leftover.push(format!("{open} open socket(s)"));
        }
        Err(HarnessError::ReclamationFailed {
            case: case.to_string(),
            attempts,
            leftover: leftover.join(", "),
        })
    }
}

fn advance(case: &str, from: CasePhase, to: CasePhase) -> CasePhase {
    debug!(case, ?from, ?to, "case phase");
    to
}

fn log_outcome(case: &str, outcome: &CaseOutcome) {
    match outcome {
        CaseOutcome::Passed => debug!(case, "case passed"),
        CaseOutcome::Failed { failure, benign: true } => {
            info!(case, kind = %failure.kind, message = %failure.message, "case failed");
        }
        CaseOutcome::Failed { failure, benign: false } => {
            warn!(case, kind = %failure.kind, message = %failure.message, "case failed unexpectedly");
        }
        CaseOutcome::TimedOut { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{EmptyLoader, ProbeRuntime, UnitImage};

    fn loader(root: &std::path::Path) -> Arc<InstrumentingLoader> {
        Arc::new(InstrumentingLoader::new(
            vec![root.to_path_buf()],
            Arc::new(EmptyLoader::new()),
            Arc::new(ProbeRuntime::new()),
        ))
    }

    fn executor(registry: TestRegistry, limits: ExecutionLimits) -> BoundedExecutor {
        BoundedExecutor::new(ResourceTracker::new(), Arc::new(registry), limits)
    }

    #[test]
    fn test_defaults() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.case_timeout, Duration::from_secs(30));
        assert_eq!(limits.reclaim_attempts, 5);
        assert_eq!(limits.reclaim_pause, Duration::from_millis(100));
    }

    #[test]
    fn test_batch_continues_after_failures() {
        let dir = tempfile::tempdir().unwrap();
        UnitImage::new("calc::Calc", "src/calc.rs")
            .with_statements([1, 2, 3])
            .write_to(dir.path())
            .unwrap();
        let registry = TestRegistry::new()
            .with_test("tests::Calc", "first", |ctx| {
                let calc = ctx.load("calc::Calc")?;
                calc.hit(0);
                Err(TestFailure::assertion("first fails"))
            })
            .with_test("tests::Calc", "second", |ctx| {
                let calc = ctx.load("calc::Calc")?;
                calc.hit(1);
                panic!("unexpected");
            });
        let exec = executor(registry, ExecutionLimits::default());
        let loader = loader(dir.path());
        let mut aggregator = CoverageAggregator::new();
        let cases = vec![
            TestCase::new("c1", "tests::Calc", "first"),
            TestCase::new("c2", "tests::Calc", "second"),
        ];

        let reports = exec.run_batch(&cases, &loader, &mut aggregator).unwrap();
        assert!(matches!(reports[0].outcome, CaseOutcome::Failed { benign: true, .. }));
        assert!(matches!(reports[1].outcome, CaseOutcome::Failed { benign: false, .. }));
        assert_eq!(reports[1].phase, CasePhase::Completed);

        let coverage = aggregator.finish();
        let file = coverage.file("src/calc.rs").unwrap();
        assert_eq!(file.full.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(file.not.iter().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_unknown_test_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(TestRegistry::new(), ExecutionLimits::default());
        let mut aggregator = CoverageAggregator::new();
        let err = exec
            .run_batch(&[TestCase::new("c1", "tests::X", "missing")], &loader(dir.path()), &mut aggregator)
            .unwrap_err();
        assert!(matches!(err, HarnessError::UnknownTest { .. }));
    }

    #[test]
    fn test_load_failure_inside_body_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TestRegistry::new().with_test("tests::X", "loads", |ctx| {
            ctx.load("absent::Unit")?;
            Ok(())
        });
        let exec = executor(registry, ExecutionLimits::default());
        let mut aggregator = CoverageAggregator::new();
        let err = exec
            .run_batch(&[TestCase::new("c1", "tests::X", "loads")], &loader(dir.path()), &mut aggregator)
            .unwrap_err();
        assert!(matches!(err, HarnessError::Load(_)));
    }

    #[test]
    fn test_sleeping_case_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TestRegistry::new().with_test("tests::X", "sleeps", |ctx| {
            ctx.sleep(Duration::from_secs(60));
            Ok(())
        });
        let limits = ExecutionLimits::default()
            .with_case_timeout(Duration::from_millis(100))
            .with_reclaim_pause(Duration::from_millis(20));
        let exec = executor(registry, limits);
        let code_loader: Arc<dyn CodeLoader> = loader(dir.path());
        let report = exec
            .run_case(&TestCase::new("c1", "tests::X", "sleeps"), &code_loader)
            .unwrap();
        assert_eq!(report.phase, CasePhase::Reclaimed);
        assert!(matches!(report.outcome, CaseOutcome::TimedOut { reclaim_attempts } if reclaim_attempts >= 1));
        assert!(report.duration < Duration::from_secs(10));
    }
}
