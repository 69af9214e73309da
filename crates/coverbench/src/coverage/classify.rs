//! Mapping merged coverage onto routine line ranges.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::{CoverageInfo, LineRange, LineStatus, RangeIndex};
use crate::report::Verdict;
use crate::snippet::{RoutineRef, Snippet};

/// Allowed shortfall below the required coverage, in percentage points
pub const COVERAGE_TOLERANCE: f64 = 0.1;

/// Errors raised while classifying a snippet
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// A source file could not be read
    #[error("Failed to read source {file}: {source}")]
    Read {
        /// Source file
        file: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A source file could not be parsed
    #[error("Failed to parse source {file}: {message}")]
    Parse {
        /// Source file
        file: PathBuf,
        /// Parser message
        message: String,
    },

    /// No probed line falls in any routine range
    #[error("Snippet {snippet} has no probed lines to cover")]
    NoLinesToCover {
        /// Snippet identifier
        snippet: String,
    },
}

/// Coverage verdict of one snippet
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Verdict
    pub verdict: Verdict,
    /// Achieved statement coverage in percent
    pub achieved: f64,
    /// Probed lines inside the ranges
    pub lines_to_cover: usize,
    /// Covered lines inside the ranges
    pub lines_covered: usize,
    /// Ranges that contributed, per file
    pub ranges: BTreeMap<String, Vec<LineRange>>,
}

/// `COVERED` when `achieved` is within tolerance of `required`
#[must_use]
pub fn verdict_for(achieved: f64, required: f64) -> Verdict {
    if achieved >= required - COVERAGE_TOLERANCE {
        Verdict::Covered
    } else {
        Verdict::NotCovered
    }
}

fn file_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Classifier for one snippet; parsed ranges are memoized across calls
#[derive(Debug)]
pub struct CoverageClassifier {
    source_root: PathBuf,
    index: RangeIndex,
}

impl CoverageClassifier {
    /// Create a classifier resolving source files against `source_root`
    #[must_use]
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            index: RangeIndex::new(),
        }
    }

    /// Range index in use
    #[must_use]
    pub const fn index(&self) -> &RangeIndex {
        &self.index
    }

    fn read(&self, file: &str) -> Result<String, ClassifyError> {
        let path = self.source_root.join(file);
        fs::read_to_string(&path).map_err(|source| ClassifyError::Read { file: path, source })
    }

    fn ranges_in(&self, file: &str, routine: &RoutineRef) -> Result<Vec<LineRange>, ClassifyError> {
        let source = self.read(file)?;
        self.index
            .find(&source, routine)
            .map_err(|e| ClassifyError::Parse {
                file: self.source_root.join(file),
                message: e.to_string(),
            })
    }

    /// Compute achieved coverage of `snippet` and its verdict
    pub fn classify(&self, snippet: &Snippet, coverage: &CoverageInfo) -> Result<Classification, ClassifyError> {
        let mut ranges: BTreeMap<String, Vec<LineRange>> = BTreeMap::new();

        let primary = file_key(snippet.target.file.as_deref().unwrap_or(&snippet.source_file));
        let found = self.ranges_in(&primary, &snippet.target)?;
        if found.is_empty() {
            debug!(snippet = %snippet.id, routine = %snippet.target, file = %primary, "target not found");
        }
        ranges.entry(primary.clone()).or_default().extend(found);

        for include in &snippet.includes {
            if let Some(file) = &include.file {
                let file = file_key(file);
                let found = self.ranges_in(&file, include)?;
                ranges.entry(file).or_default().extend(found);
                continue;
            }
            // Primary file first, then probed files in order; the first definition wins
            let others = coverage
                .files()
                .map(|(file, _)| file.to_string())
                .filter(|file| *file != primary);
            for file in std::iter::once(primary.clone()).chain(others) {
                match self.ranges_in(&file, include) {
                    Ok(found) if !found.is_empty() => {
                        ranges.entry(file).or_default().extend(found);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(snippet = %snippet.id, routine = %include, error = %err, "skipping file");
                    }
                }
            }
        }

        let mut lines_to_cover = 0;
        let mut lines_covered = 0;
        for (file, file_ranges) in &ranges {
            let lines: BTreeSet<u32> = file_ranges.iter().flat_map(|r| r.lines()).collect();
            for line in lines {
                let status = coverage.status(file, line);
                if status == LineStatus::Empty {
                    continue;
                }
                lines_to_cover += 1;
                if status.is_covered() {
                    lines_covered += 1;
                }
            }
        }
        ranges.retain(|_, r| !r.is_empty());

        if lines_to_cover == 0 {
            return Err(ClassifyError::NoLinesToCover {
                snippet: snippet.id.clone(),
            });
        }

        let achieved = 100.0 * lines_covered as f64 / lines_to_cover as f64;
        let verdict = verdict_for(achieved, snippet.required_coverage);
        debug!(
            snippet = %snippet.id,
            lines_to_cover,
            lines_covered,
            achieved,
            verdict = %verdict,
            "classified"
        );
        Ok(Classification {
            verdict,
            achieved,
            lines_to_cover,
            lines_covered,
            ranges,
        })
    }
}
