//! Snippet descriptors, generated suites and where they live on disk.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::executor::FailureKind;
use crate::result::{HarnessError, HarnessResult};

/// Identity of a routine in the snippet project
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutineRef {
    /// Type whose impl block holds the routine; `None` for free functions
    #[serde(default)]
    pub owner: Option<String>,
    /// Routine name. May be empty for a constructor reference, which then
    /// stands for every constructor of `owner`.
    #[serde(default)]
    pub name: String,
    /// File the routine lives in, relative to the project root
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Marks a constructor that is not named `new`
    #[serde(default)]
    pub constructor: bool,
}

impl RoutineRef {
    /// Free function `name`
    #[must_use]
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            owner: None,
            name: name.into(),
            file: None,
            constructor: false,
        }
    }

    /// Method `name` of `owner`
    #[must_use]
    pub fn method(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Self::function(name)
        }
    }

    /// Every constructor of `owner`
    #[must_use]
    pub fn constructors(owner: impl Into<String>) -> Self {
        Self {
            constructor: true,
            ..Self::method(owner, String::new())
        }
    }

    /// Pin the routine to a file
    #[must_use]
    pub fn in_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Whether this names a constructor
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.constructor || self.name == "new"
    }
}

impl std::fmt::Display for RoutineRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = if self.name.is_empty() { "<constructors>" } else { &self.name };
        match &self.owner {
            Some(owner) => write!(f, "{owner}::{name}"),
            None => f.write_str(name),
        }
    }
}

fn default_required() -> f64 {
    100.0
}

/// The function under test and how thoroughly it must be covered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    /// Snippet identifier
    pub id: String,
    /// Primary source file, relative to the project root
    pub source_file: PathBuf,
    /// Target routine
    pub target: RoutineRef,
    /// Required statement coverage in percent
    #[serde(default = "default_required")]
    pub required_coverage: f64,
    /// Helper routines whose lines also count
    #[serde(default)]
    pub includes: Vec<RoutineRef>,
    /// Code units loaded before the first case so unexecuted lines are seen
    #[serde(default)]
    pub units: Vec<String>,
    /// Run every case in a fork agent process
    #[serde(default)]
    pub isolated: bool,
    /// Per-case timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Snippet {
    /// Create a snippet requiring full coverage of `target`
    #[must_use]
    pub fn new(id: impl Into<String>, source_file: impl Into<PathBuf>, target: RoutineRef) -> Self {
        Self {
            id: id.into(),
            source_file: source_file.into(),
            target,
            required_coverage: default_required(),
            includes: Vec::new(),
            units: Vec::new(),
            isolated: false,
            timeout_ms: None,
        }
    }

    /// Set required coverage
    #[must_use]
    pub fn with_required_coverage(mut self, percent: f64) -> Self {
        self.required_coverage = percent;
        self
    }

    /// Add an included routine
    #[must_use]
    pub fn with_include(mut self, routine: RoutineRef) -> Self {
        self.includes.push(routine);
        self
    }

    /// Add a unit to preload
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.units.push(unit.into());
        self
    }

    /// Mark the snippet for process isolation
    #[must_use]
    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    /// Override the per-case timeout
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Read and validate a descriptor
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let snippet: Self = read_json(path)?;
        snippet.validate(path)?;
        Ok(snippet)
    }

    /// Whether `id` can name a snippet: non-empty and usable as a single path component
    #[must_use]
    pub fn is_valid_id(id: &str) -> bool {
        !id.is_empty() && id != "." && !id.contains("..") && !id.contains(['/', '\\'])
    }

    fn validate(&self, path: &Path) -> HarnessResult<()> {
        if self.id.is_empty() {
            return Err(HarnessError::descriptor(path, "snippet id is empty"));
        }
        if !Self::is_valid_id(&self.id) {
            return Err(HarnessError::descriptor(
                path,
                format!("snippet id {:?} is not a plain file name", self.id),
            ));
        }
        if !(0.0..=100.0).contains(&self.required_coverage) {
            return Err(HarnessError::descriptor(
                path,
                format!("required coverage {} outside 0..=100", self.required_coverage),
            ));
        }
        if self.target.name.is_empty() && !self.target.constructor {
            return Err(HarnessError::descriptor(path, "target routine has no name"));
        }
        Ok(())
    }
}

/// One generated input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Case identifier
    pub id: String,
    /// Test unit name
    pub unit: String,
    /// Test method name
    pub method: String,
    /// Parameter values
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    /// Failure the generator expects this input to raise
    #[serde(default)]
    pub expected_failure: Option<FailureKind>,
}

impl TestCase {
    /// Create a case without parameters
    #[must_use]
    pub fn new(id: impl Into<String>, unit: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            unit: unit.into(),
            method: method.into(),
            params: Vec::new(),
            expected_failure: None,
        }
    }

    /// Set parameters
    #[must_use]
    pub fn with_params(mut self, params: Vec<serde_json::Value>) -> Self {
        self.params = params;
        self
    }

    /// Expect a failure of `kind`
    #[must_use]
    pub fn expecting(mut self, kind: FailureKind) -> Self {
        self.expected_failure = Some(kind);
        self
    }
}

/// What the tool adapter concluded before anything ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreliminaryOutcome {
    /// Tests were generated and should be run
    Generated,
    /// The tool does not support this snippet
    NotApplicable,
    /// The tool was not run on this snippet
    Skipped,
    /// The tool failed on this snippet
    Exception,
}

/// One tool's output for one snippet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSuite {
    /// Tool name
    pub tool: String,
    /// Snippet identifier
    pub snippet: String,
    /// Preliminary outcome
    pub outcome: PreliminaryOutcome,
    /// Adapter message for non-generated outcomes
    #[serde(default)]
    pub message: Option<String>,
    /// Generated cases
    #[serde(default)]
    pub cases: Vec<TestCase>,
}

impl GeneratedSuite {
    /// Create a generated suite
    #[must_use]
    pub fn generated(tool: impl Into<String>, snippet: impl Into<String>, cases: Vec<TestCase>) -> Self {
        Self {
            tool: tool.into(),
            snippet: snippet.into(),
            outcome: PreliminaryOutcome::Generated,
            message: None,
            cases,
        }
    }

    /// Read a suite
    pub fn load(path: &Path) -> HarnessResult<Self> {
        read_json(path)
    }

    /// Write the suite as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> HarnessResult<T> {
    let text = fs::read_to_string(path).map_err(|e| HarnessError::descriptor(path, e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| HarnessError::descriptor(path, e.to_string()))
}

/// Directory layout of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnippetLayout {
    project_dir: PathBuf,
    results_root: PathBuf,
    tool: String,
    run_tag: String,
}

impl SnippetLayout {
    /// Create a layout
    #[must_use]
    pub fn new(
        project_dir: impl Into<PathBuf>,
        results_root: impl Into<PathBuf>,
        tool: impl Into<String>,
        run_tag: impl Into<String>,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            results_root: results_root.into(),
            tool: tool.into(),
            run_tag: run_tag.into(),
        }
    }

    /// Snippet project root
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Results root
    #[must_use]
    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    /// Tool name
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Run tag
    #[must_use]
    pub fn run_tag(&self) -> &str {
        &self.run_tag
    }

    /// `<project>/snippets/<id>.json`
    #[must_use]
    pub fn descriptor_path(&self, snippet: &str) -> PathBuf {
        self.project_dir.join("snippets").join(format!("{snippet}.json"))
    }

    /// `<results>/<tool>/<run-tag>`
    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        self.results_root.join(&self.tool).join(&self.run_tag)
    }

    /// `<results>/<tool>/<run-tag>/<id>`
    #[must_use]
    pub fn snippet_dir(&self, snippet: &str) -> PathBuf {
        self.run_dir().join(snippet)
    }

    /// Generated suite of a snippet
    #[must_use]
    pub fn suite_path(&self, snippet: &str) -> PathBuf {
        self.snippet_dir(snippet).join("suite.json")
    }

    /// Coverage report of a snippet
    #[must_use]
    pub fn report_path(&self, snippet: &str) -> PathBuf {
        self.snippet_dir(snippet).join("coverage.json")
    }

    /// Run log of the run
    #[must_use]
    pub fn run_log_path(&self) -> PathBuf {
        self.run_dir().join("run.log")
    }

    /// Probe image roots, highest priority first: generated tests, then the project
    #[must_use]
    pub fn image_roots(&self, snippet: &str) -> Vec<PathBuf> {
        vec![
            self.snippet_dir(snippet).join("bin"),
            self.project_dir.join("target").join("probes"),
        ]
    }

    /// Roots of library images loaded without probes
    #[must_use]
    pub fn library_roots(&self) -> Vec<PathBuf> {
        vec![self.project_dir.join("target").join("lib")]
    }
}
