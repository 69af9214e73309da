//! Fork agent: the subprocess side of isolated execution.
//!
//! A harness binary that links the generated tests calls [`run`] from its
//! `main`:
//!
//! ```no_run
//! use coverbench::{agent, TestRegistry};
//!
//! fn registry() -> TestRegistry {
//!     TestRegistry::new()
//! }
//!
//! fn main() {
//!     agent::init_agent_tracing();
//!     let code = agent::run(std::env::args_os(), &registry(), &mut std::io::stdout(), &mut std::io::stderr());
//!     std::process::exit(code);
//! }
//! ```
//!
//! The agent runs exactly one case without a timeout of its own. The parent
//! kills the whole process when it overruns.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::coverage::{wire, CoverageAggregator, CoverageInfo};
use crate::executor::{run_body, CaseOutcome, TestContext, TestRegistry};
use crate::instrument::{CodeLoader, InstrumentingLoader, PlainLoader, ProbeRuntime};
use crate::result::{HarnessError, HarnessResult};
use crate::snippet::{GeneratedSuite, Snippet, SnippetLayout};
use crate::tracker::ResourceTracker;

/// Environment variable holding the agent's log filter
pub const AGENT_LOG_ENV: &str = "COVERBENCH_LOG";

/// Exit code for unusable arguments
pub const EXIT_USAGE: i32 = 2;

/// Exit code for a case that could not be run
pub const EXIT_FAILURE: i32 = 1;

/// Protocol arguments of a fork agent
#[derive(Debug, Clone, Parser)]
#[command(name = "coverbench-agent", about = "Run one generated test case and report its coverage")]
pub struct AgentArgs {
    /// Snippet project directory
    pub project_dir: PathBuf,
    /// Results root directory
    pub results_root: PathBuf,
    /// Tool whose suite is run
    pub tool: String,
    /// Run tag
    pub run_tag: String,
    /// Snippet identifier
    pub snippet: String,
    /// Test unit name
    pub unit: String,
    /// Test method name
    pub method: String,
}

/// Log to stderr only; stdout carries the protocol
pub fn init_agent_tracing() {
    let filter = EnvFilter::try_from_env(AGENT_LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Parse `argv` (program name first), run the case and write the protocol
/// output. Returns the process exit code.
pub fn run<I, T, O, E>(argv: I, registry: &TestRegistry, stdout: &mut O, stderr: &mut E) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    O: Write,
    E: Write,
{
    let args = match AgentArgs::try_parse_from(argv) {
        Ok(args) => args,
        Err(err) => {
            let _ = write!(stderr, "{err}");
            return EXIT_USAGE;
        }
    };

    match run_case(&args, registry) {
        Ok(coverage) => match wire::write_agent_output(stdout, &coverage) {
            Ok(()) => 0,
            Err(err) => {
                let _ = writeln!(stderr, "failed to write coverage: {err}");
                EXIT_FAILURE
            }
        },
        Err(err) => {
            let _ = writeln!(stderr, "{err}");
            EXIT_FAILURE
        }
    }
}

/// Run the case named by `args` and return the coverage it produced
pub fn run_case(args: &AgentArgs, registry: &TestRegistry) -> HarnessResult<CoverageInfo> {
    let layout = SnippetLayout::new(&args.project_dir, &args.results_root, &args.tool, &args.run_tag);
    let snippet = Snippet::load(&layout.descriptor_path(&args.snippet))?;
    let suite = GeneratedSuite::load(&layout.suite_path(&snippet.id))?;
    let unknown = || HarnessError::UnknownTest {
        unit: args.unit.clone(),
        method: args.method.clone(),
    };
    let case = suite
        .cases
        .iter()
        .find(|c| c.unit == args.unit && c.method == args.method)
        .ok_or_else(unknown)?;
    let body = registry.get(&case.unit, &case.method).ok_or_else(unknown)?;

    let runtime = Arc::new(ProbeRuntime::new());
    let loader = Arc::new(InstrumentingLoader::new(
        layout.image_roots(&snippet.id),
        Arc::new(PlainLoader::new(layout.library_roots())),
        Arc::clone(&runtime),
    ));
    for unit in &snippet.units {
        loader.load(unit)?;
    }

    let ctx = TestContext::new(case.clone(), loader, ResourceTracker::new());
    debug!(snippet = %snippet.id, case = %case.id, "running case");
    let result = run_body(&body, &ctx);
    if let Some(err) = ctx.take_load_error() {
        return Err(err.into());
    }
    match CaseOutcome::judge(result, case.expected_failure) {
        CaseOutcome::Passed => info!(case = %case.id, "case passed"),
        CaseOutcome::Failed { failure, benign } => {
            if benign {
                info!(case = %case.id, kind = %failure.kind, "case failed");
            } else {
                warn!(case = %case.id, kind = %failure.kind, message = %failure.message, "case failed unexpectedly");
            }
        }
        CaseOutcome::TimedOut { .. } => {}
    }
    Ok(CoverageAggregator::snapshot(&runtime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::LineStatus;
    use crate::executor::TestFailure;
    use crate::instrument::UnitImage;
    use crate::snippet::{RoutineRef, TestCase};

    fn fixture() -> (tempfile::TempDir, Vec<String>) {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        let results = dir.path().join("results");
        let layout = SnippetLayout::new(&project, &results, "tool", "tag");

        let snippet = Snippet::new("s1", "src/lib.rs", RoutineRef::function("f")).with_unit("lib::F");
        std::fs::create_dir_all(project.join("snippets")).unwrap();
        std::fs::write(layout.descriptor_path("s1"), serde_json::to_string(&snippet).unwrap()).unwrap();
        GeneratedSuite::generated(
            "tool",
            "s1",
            vec![TestCase::new("c1", "tests::F", "covers").with_params(vec![serde_json::json!(1)])],
        )
        .save(&layout.suite_path("s1"))
        .unwrap();
        UnitImage::new("lib::F", "src/lib.rs")
            .with_statements([1, 2])
            .write_to(&project.join("target/probes"))
            .unwrap();

        let argv = [
            "agent".to_string(),
            project.to_string_lossy().into_owned(),
            results.to_string_lossy().into_owned(),
            "tool".into(),
            "tag".into(),
            "s1".into(),
            "tests::F".into(),
            "covers".into(),
        ];
        (dir, argv.to_vec())
    }

    fn registry() -> TestRegistry {
        TestRegistry::new().with_test("tests::F", "covers", |ctx| {
            let f = ctx.load("lib::F")?;
            f.hit(0);
            if ctx.param_i64(0)? == 1 {
                Ok(())
            } else {
                Err(TestFailure::assertion("param"))
            }
        })
    }

    #[test]
    fn test_run_writes_indicator_and_document() {
        let (_dir, argv) = fixture();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let code = run(argv, &registry(), &mut out, &mut err);
        assert_eq!(code, 0, "stderr: {}", String::from_utf8_lossy(&err));

        let coverage = wire::parse_agent_stdout(&String::from_utf8(out).unwrap()).unwrap();
        assert_eq!(coverage.status("src/lib.rs", 1), LineStatus::FullyCovered);
        assert_eq!(coverage.status("src/lib.rs", 2), LineStatus::NotCovered);
    }

    #[test]
    fn test_unknown_method_fails() {
        let (_dir, mut argv) = fixture();
        argv[7] = "nope".into();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        assert_eq!(run(argv, &registry(), &mut out, &mut err), EXIT_FAILURE);
        assert!(out.is_empty());
        assert!(String::from_utf8_lossy(&err).contains("No test registered"));
    }

    #[test]
    fn test_bad_argv_is_usage_error() {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        assert_eq!(run(["agent", "only-one"], &registry(), &mut out, &mut err), EXIT_USAGE);
        assert!(!err.is_empty());
    }
}
