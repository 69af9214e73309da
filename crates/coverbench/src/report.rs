//! Coverage report model and colorized source view.

use std::fmt;
use std::fs;
use std::path::Path;

use console::Style;
use serde::{Deserialize, Serialize};

use crate::coverage::{Classification, CoverageInfo, FileCoverage, LineStatus};
use crate::result::HarnessResult;

/// Final outcome of a snippet for one tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Achieved coverage met the requirement
    Covered,
    /// Achieved coverage fell short
    NotCovered,
    /// Loading, generation or classification failed
    Exception,
    /// A fork agent failed; no coverage was scored
    Aborted,
    /// The tool does not apply to the snippet
    NotApplicable,
    /// The snippet was not evaluated
    Skipped,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Covered => "COVERED",
            Self::NotCovered => "NOT_COVERED",
            Self::Exception => "EXCEPTION",
            Self::Aborted => "ABORTED",
            Self::NotApplicable => "NOT_APPLICABLE",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

/// Line lists of one file, as whitespace-separated integers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    /// Source file
    pub file: String,
    /// Fully covered lines
    pub full: String,
    /// Partly covered lines
    pub partial: String,
    /// Not covered lines
    pub not: String,
}

fn join_lines<'a>(lines: impl IntoIterator<Item = &'a u32>) -> String {
    lines
        .into_iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

impl FileReport {
    fn from_coverage(file: &str, coverage: &FileCoverage) -> Self {
        Self {
            file: file.to_string(),
            full: join_lines(&coverage.full),
            partial: join_lines(&coverage.partial),
            not: join_lines(&coverage.not),
        }
    }
}

/// Coverage report of one snippet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Tool name
    pub tool: String,
    /// Snippet identifier
    pub snippet: String,
    /// Verdict
    pub verdict: Verdict,
    /// Achieved coverage in percent, when classified
    pub achieved: Option<f64>,
    /// Why no coverage was scored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Per-file line lists
    #[serde(default)]
    pub files: Vec<FileReport>,
}

impl CoverageReport {
    /// Report of a classified snippet
    #[must_use]
    pub fn classified(
        tool: impl Into<String>,
        snippet: impl Into<String>,
        classification: &Classification,
        coverage: &CoverageInfo,
    ) -> Self {
        Self {
            tool: tool.into(),
            snippet: snippet.into(),
            verdict: classification.verdict,
            achieved: Some(classification.achieved),
            message: None,
            files: coverage
                .files()
                .map(|(file, c)| FileReport::from_coverage(file, c))
                .collect(),
        }
    }

    /// Report of a snippet that was not scored
    #[must_use]
    pub fn unscored(
        tool: impl Into<String>,
        snippet: impl Into<String>,
        verdict: Verdict,
        message: Option<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            snippet: snippet.into(),
            verdict,
            achieved: None,
            message,
            files: Vec::new(),
        }
    }

    /// Write as pretty JSON, creating parent directories
    pub fn write_json(&self, path: &Path) -> HarnessResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read a report
    pub fn load(path: &Path) -> HarnessResult<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Render `source` with each line marked by its coverage status.
///
/// Fully covered lines are green, partly covered yellow and uncovered red.
/// Without color the status is shown as a `+`, `~` or `-` gutter mark.
#[must_use]
pub fn render_source(source: &str, coverage: Option<&FileCoverage>, use_color: bool) -> String {
    let green = Style::new().green().force_styling(use_color);
    let yellow = Style::new().yellow().force_styling(use_color);
    let red = Style::new().red().force_styling(use_color);

    let mut out = String::new();
    for (index, text) in source.lines().enumerate() {
        let line = u32::try_from(index + 1).unwrap_or(u32::MAX);
        let status = coverage.map_or(LineStatus::Empty, |c| c.status(line));
        let (mark, style) = match status {
            LineStatus::FullyCovered => ('+', Some(&green)),
            LineStatus::PartlyCovered => ('~', Some(&yellow)),
            LineStatus::NotCovered => ('-', Some(&red)),
            LineStatus::Empty => (' ', None),
        };
        let body = match (use_color, style) {
            (true, Some(style)) => style.apply_to(text).to_string(),
            _ => text.to_string(),
        };
        out.push_str(&format!("{line:>5} {mark} {body}\n"));
    }
    out
}
