//! Coverbench: instrumented execution and coverage scoring of generated tests
//!
//! Coverbench benchmarks automatic test-input generators. It runs the inputs
//! a generator produced for a snippet against instrumented code, merges the
//! line coverage they reach, and classifies the snippet as covered or not
//! against its required statement coverage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   COVERBENCH Architecture                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   ┌────────────┐    ┌──────────────────┐    ┌────────────┐      │
//! │   │ Generated  │    │ BoundedExecutor  │    │ Coverage   │      │
//! │   │ suite      │───►│   or             │───►│ Aggregator │      │
//! │   │ (JSON)     │    │ IsolatedExecutor │    │            │      │
//! │   └────────────┘    └────────┬─────────┘    └─────┬──────┘      │
//! │                              │                    ▼             │
//! │                     ┌────────▼──────────┐  ┌────────────┐       │
//! │                     │ Instrumenting     │  │ Coverage   │       │
//! │                     │ Loader (probes)   │  │ Classifier │──► Verdict
//! │                     └───────────────────┘  └────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Runaway cases are stopped at safepoints and their threads and sockets are
//! reclaimed through the shared [`ResourceTracker`]. Snippets marked
//! `isolated` run each case in a fork agent process instead (see [`agent`]).

#![warn(missing_docs)]
// Lints are configured in workspace Cargo.toml [workspace.lints.clippy]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod agent;
pub mod config;
pub mod coverage;
mod evaluate;
pub mod executor;
pub mod instrument;
pub mod report;
mod result;
pub mod runlog;
pub mod snippet;
pub mod tracker;

pub use config::{AgentConfig, ColorChoice, HarnessConfig};
pub use coverage::{
    Classification, ClassifyError, CoverageAggregator, CoverageClassifier, CoverageInfo, FileCoverage, LineStatus,
    COVERAGE_TOLERANCE,
};
pub use evaluate::{SnippetEvaluator, SnippetOutcome};
pub use executor::{
    AgentCommand, AgentTarget, BoundedExecutor, CaseOutcome, CasePhase, CaseReport, ExecutionLimits, FailureKind,
    IsolatedExecutor, TestBody, TestContext, TestFailure, TestRegistry,
};
pub use instrument::{CodeLoader, CodeObject, EmptyLoader, InstrumentingLoader, LoadError, PlainLoader, ProbeRuntime, UnitImage};
pub use report::{render_source, CoverageReport, FileReport, Verdict};
pub use result::{AgentFailure, HarnessError, HarnessResult};
pub use runlog::RunLog;
pub use snippet::{GeneratedSuite, PreliminaryOutcome, RoutineRef, Snippet, SnippetLayout, TestCase};
pub use tracker::{CaseScope, ResourceTracker, TrackedListener, TrackedStream};
