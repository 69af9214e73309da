//! Evaluation of one snippet, from generated suite to verdict.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::coverage::{Classification, CoverageAggregator, CoverageClassifier, CoverageInfo};
use crate::executor::{AgentTarget, BoundedExecutor, CaseOutcome, CaseReport, IsolatedExecutor, TestRegistry};
use crate::instrument::{CodeLoader, InstrumentingLoader, PlainLoader, ProbeRuntime};
use crate::report::{render_source, CoverageReport, Verdict};
use crate::result::{HarnessError, HarnessResult};
use crate::runlog::RunLog;
use crate::snippet::{GeneratedSuite, PreliminaryOutcome, Snippet, SnippetLayout};
use crate::tracker::ResourceTracker;

/// What happened to one snippet
#[derive(Debug, Clone, PartialEq)]
pub struct SnippetOutcome {
    /// Snippet identifier
    pub snippet: String,
    /// Verdict
    pub verdict: Verdict,
    /// Achieved coverage, when classified
    pub achieved: Option<f64>,
    /// Report written, if any
    pub report: Option<PathBuf>,
    /// Per-case reports of in-process runs
    pub cases: Vec<CaseReport>,
    /// Source of the target file marked by coverage status
    pub source_view: Option<String>,
}

impl SnippetOutcome {
    fn unscored(snippet: &str, verdict: Verdict, report: Option<PathBuf>) -> Self {
        Self {
            snippet: snippet.to_string(),
            verdict,
            achieved: None,
            report,
            cases: Vec::new(),
            source_view: None,
        }
    }
}

struct Scored {
    classification: Classification,
    coverage: CoverageInfo,
    cases: Vec<CaseReport>,
}

/// Runs generated suites and classifies their coverage
#[derive(Debug)]
pub struct SnippetEvaluator {
    config: HarnessConfig,
    layout: SnippetLayout,
    tracker: Arc<ResourceTracker>,
    registry: Arc<TestRegistry>,
    run_log: RunLog,
}

impl SnippetEvaluator {
    /// Create an evaluator; opens the run log
    pub fn new(config: HarnessConfig, registry: Arc<TestRegistry>) -> HarnessResult<Self> {
        config.validate()?;
        let layout = config.layout();
        let run_log = RunLog::open(layout.run_log_path())?;
        Ok(Self {
            config,
            layout,
            tracker: ResourceTracker::new(),
            registry,
            run_log,
        })
    }

    /// Share an existing resource tracker
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<ResourceTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Directory layout in use
    #[must_use]
    pub const fn layout(&self) -> &SnippetLayout {
        &self.layout
    }

    /// Run log in use
    #[must_use]
    pub const fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    /// Evaluate snippets in order. A run-fatal error stops the run.
    pub fn evaluate_all<S: AsRef<str>>(&self, snippets: &[S]) -> HarnessResult<Vec<SnippetOutcome>> {
        snippets.iter().map(|id| self.evaluate(id.as_ref())).collect()
    }

    /// Evaluate one snippet.
    ///
    /// Only run-fatal errors are returned; everything else becomes a verdict.
    pub fn evaluate(&self, id: &str) -> HarnessResult<SnippetOutcome> {
        if !Snippet::is_valid_id(id) {
            self.run_log.error(id, "exception: snippet id is not a plain file name");
            return Ok(SnippetOutcome::unscored(id, Verdict::Exception, None));
        }
        let suite_path = self.layout.suite_path(id);
        if !suite_path.exists() {
            self.run_log.warn(id, "skipped: no generated suite");
            return self.unscored(id, Verdict::Skipped, Some("no generated suite".into()));
        }
        let suite = match GeneratedSuite::load(&suite_path) {
            Ok(suite) => suite,
            Err(err) => return self.exception(id, &err),
        };
        let preliminary = match suite.outcome {
            PreliminaryOutcome::Generated => None,
            PreliminaryOutcome::NotApplicable => Some(Verdict::NotApplicable),
            PreliminaryOutcome::Skipped => Some(Verdict::Skipped),
            PreliminaryOutcome::Exception => Some(Verdict::Exception),
        };
        if let Some(verdict) = preliminary {
            let message = suite.message.clone().unwrap_or_default();
            self.run_log.warn(id, &format!("{verdict} from tool: {message}"));
            return self.unscored(id, verdict, suite.message);
        }
        let snippet = match Snippet::load(&self.layout.descriptor_path(id)) {
            Ok(snippet) => snippet,
            Err(err) => return self.exception(id, &err),
        };

        match self.score(&snippet, &suite) {
            Ok(scored) => self.scored(&snippet, scored),
            Err(err) if err.is_run_fatal() => {
                self.run_log.error(id, &format!("fatal: {err}"));
                Err(err)
            }
            Err(err) if err.is_snippet_abort() => {
                self.run_log.error(id, &format!("aborted: {err}"));
                Ok(SnippetOutcome::unscored(id, Verdict::Aborted, None))
            }
            Err(err) => self.exception(id, &err),
        }
    }

    fn score(&self, snippet: &Snippet, suite: &GeneratedSuite) -> HarnessResult<Scored> {
        let runtime = Arc::new(ProbeRuntime::new());
        let loader = Arc::new(InstrumentingLoader::new(
            self.layout.image_roots(&snippet.id),
            Arc::new(PlainLoader::new(self.layout.library_roots())),
            Arc::clone(&runtime),
        ));
        for unit in &snippet.units {
            loader.load(unit)?;
        }
        let mut aggregator = CoverageAggregator::new();
        aggregator.observe(&runtime);

        let timeout = self.config.timeout_for(snippet);
        let cases = if snippet.isolated {
            let command = self.config.agent_command().ok_or_else(|| {
                HarnessError::config(format!("snippet {} is isolated but no agent is configured", snippet.id))
            })?;
            let target = AgentTarget::new(self.layout.clone(), snippet.id.clone());
            info!(snippet = %snippet.id, cases = suite.cases.len(), "running isolated");
            IsolatedExecutor::new(command, timeout).run_batch(&target, &suite.cases, &mut aggregator)?;
            Vec::new()
        } else {
            info!(snippet = %snippet.id, cases = suite.cases.len(), "running in process");
            let limits = self.config.limits().with_case_timeout(timeout);
            let executor = BoundedExecutor::new(Arc::clone(&self.tracker), Arc::clone(&self.registry), limits);
            executor.run_batch(&suite.cases, &loader, &mut aggregator)?
        };
        for report in &cases {
            match &report.outcome {
                CaseOutcome::Passed => {}
                CaseOutcome::Failed { failure, .. } => {
                    self.run_log.warn(&snippet.id, &format!("case {} failed: {failure}", report.case));
                }
                CaseOutcome::TimedOut { reclaim_attempts } => self.run_log.warn(
                    &snippet.id,
                    &format!("case {} timed out, reclaimed after {reclaim_attempts} pass(es)", report.case),
                ),
            }
        }
        debug!(snippet = %snippet.id, defined = ?loader.defined_names(), "units instrumented");

        let coverage = aggregator.finish();
        let classification = CoverageClassifier::new(self.layout.project_dir()).classify(snippet, &coverage)?;
        Ok(Scored {
            classification,
            coverage,
            cases,
        })
    }

    fn scored(&self, snippet: &Snippet, scored: Scored) -> HarnessResult<SnippetOutcome> {
        let Scored {
            classification,
            coverage,
            cases,
        } = scored;
        let report = CoverageReport::classified(&self.config.tool, &snippet.id, &classification, &coverage);
        let path = self.layout.report_path(&snippet.id);
        report.write_json(&path)?;
        self.run_log.info(
            &snippet.id,
            &format!(
                "{} ({:.2}% of {} lines, required {}%)",
                classification.verdict,
                classification.achieved,
                classification.lines_to_cover,
                snippet.required_coverage
            ),
        );

        let primary = snippet.source_file.to_string_lossy().replace('\\', "/");
        let source_view = fs::read_to_string(self.layout.project_dir().join(&snippet.source_file))
            .ok()
            .map(|source| render_source(&source, coverage.file(&primary), self.config.color.should_color()));

        Ok(SnippetOutcome {
            snippet: snippet.id.clone(),
            verdict: classification.verdict,
            achieved: Some(classification.achieved),
            report: Some(path),
            cases,
            source_view,
        })
    }

    fn unscored(&self, id: &str, verdict: Verdict, message: Option<String>) -> HarnessResult<SnippetOutcome> {
        let path = self.layout.report_path(id);
        CoverageReport::unscored(&self.config.tool, id, verdict, message).write_json(&path)?;
        Ok(SnippetOutcome::unscored(id, verdict, Some(path)))
    }

    fn exception(&self, id: &str, err: &HarnessError) -> HarnessResult<SnippetOutcome> {
        self.run_log.error(id, &format!("exception: {err}"));
        self.unscored(id, Verdict::Exception, Some(err.to_string()))
    }
}
