//! Line coverage model, aggregation and classification.
//!
//! # Architecture
//!
//! ```text
//! probe counters ──► CoverageAggregator ──► CoverageInfo ──► CoverageClassifier ──► Verdict
//!                                              ▲
//! fork agent stdout ──► wire::parse ───────────┘ (merge)
//! ```
//!
//! A [`CoverageInfo`] maps each source file to three line sets. Merging is
//! monotone: a line takes the highest [`LineStatus`] any observation gave it,
//! so after every merge the sets are pairwise disjoint.

mod aggregate;
mod classify;
mod ranges;
pub mod wire;

pub use aggregate::CoverageAggregator;
pub use classify::{verdict_for, Classification, ClassifyError, CoverageClassifier, COVERAGE_TOLERANCE};
pub use ranges::{find_routines, LineRange, RangeIndex, RoutineSpan};

use std::collections::{BTreeMap, BTreeSet};

/// Status of one source line, ordered for merging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum LineStatus {
    /// No probe on the line
    #[default]
    Empty,
    /// Probed, never executed
    NotCovered,
    /// Some probes on the line executed
    PartlyCovered,
    /// Every probe on the line executed
    FullyCovered,
}

impl LineStatus {
    /// Whether the line counts as covered
    #[must_use]
    pub const fn is_covered(self) -> bool {
        matches!(self, Self::PartlyCovered | Self::FullyCovered)
    }

    /// Status of a line from its probe hit tally
    #[must_use]
    pub const fn from_probes(hit: usize, total: usize) -> Self {
        if total == 0 {
            Self::Empty
        } else if hit == 0 {
            Self::NotCovered
        } else if hit < total {
            Self::PartlyCovered
        } else {
            Self::FullyCovered
        }
    }
}

/// Line sets of one source file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCoverage {
    /// Fully covered lines
    pub full: BTreeSet<u32>,
    /// Partly covered lines
    pub partial: BTreeSet<u32>,
    /// Probed but not covered lines
    pub not: BTreeSet<u32>,
}

impl FileCoverage {
    /// Status of `line`
    #[must_use]
    pub fn status(&self, line: u32) -> LineStatus {
        if self.full.contains(&line) {
            LineStatus::FullyCovered
        } else if self.partial.contains(&line) {
            LineStatus::PartlyCovered
        } else if self.not.contains(&line) {
            LineStatus::NotCovered
        } else {
            LineStatus::Empty
        }
    }

    /// Raise `line` to at least `status`
    pub fn record(&mut self, line: u32, status: LineStatus) {
        match status {
            LineStatus::Empty => {}
            LineStatus::NotCovered => {
                self.not.insert(line);
            }
            LineStatus::PartlyCovered => {
                self.partial.insert(line);
            }
            LineStatus::FullyCovered => {
                self.full.insert(line);
            }
        }
        self.clean();
    }

    /// Union with `other`, keeping the highest status per line
    pub fn merge(&mut self, other: &Self) {
        self.full.extend(&other.full);
        self.partial.extend(&other.partial);
        self.not.extend(&other.not);
        self.clean();
    }

    /// Drop lower-status duplicates so the sets are disjoint
    pub fn clean(&mut self) {
        let full = &self.full;
        self.partial.retain(|line| !full.contains(line));
        let partial = &self.partial;
        self.not
            .retain(|line| !full.contains(line) && !partial.contains(line));
    }

    /// Whether the three sets are pairwise disjoint
    #[must_use]
    pub fn is_disjoint(&self) -> bool {
        self.full.is_disjoint(&self.partial)
            && self.full.is_disjoint(&self.not)
            && self.partial.is_disjoint(&self.not)
    }

    /// All probed lines with their status, ascending
    pub fn lines(&self) -> impl Iterator<Item = (u32, LineStatus)> + '_ {
        let mut all: Vec<(u32, LineStatus)> = self
            .full
            .iter()
            .map(|l| (*l, LineStatus::FullyCovered))
            .chain(self.partial.iter().map(|l| (*l, LineStatus::PartlyCovered)))
            .chain(self.not.iter().map(|l| (*l, LineStatus::NotCovered)))
            .collect();
        all.sort_unstable();
        all.into_iter()
    }

    /// Whether no line is probed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.full.is_empty() && self.partial.is_empty() && self.not.is_empty()
    }
}

/// Coverage of a snippet, keyed by source file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageInfo {
    files: BTreeMap<String, FileCoverage>,
}

impl CoverageInfo {
    /// Create empty coverage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `line` of `file` to at least `status`
    pub fn record(&mut self, file: &str, line: u32, status: LineStatus) {
        if status == LineStatus::Empty {
            return;
        }
        self.files.entry(file.to_string()).or_default().record(line, status);
    }

    /// Merge `other` into `self`
    pub fn merge(&mut self, other: &Self) {
        for (file, coverage) in &other.files {
            self.files.entry(file.clone()).or_default().merge(coverage);
        }
        self.files.retain(|_, c| !c.is_empty());
    }

    /// Merge two coverages into a new one
    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        self.merge(other);
        self
    }

    /// Insert a file's sets, then clean them
    pub fn insert_file(&mut self, file: impl Into<String>, mut coverage: FileCoverage) {
        coverage.clean();
        if coverage.is_empty() {
            return;
        }
        self.files.entry(file.into()).or_default().merge(&coverage);
    }

    /// Status of `line` in `file`
    #[must_use]
    pub fn status(&self, file: &str, line: u32) -> LineStatus {
        self.files
            .get(file)
            .map_or(LineStatus::Empty, |c| c.status(line))
    }

    /// Coverage of one file
    #[must_use]
    pub fn file(&self, file: &str) -> Option<&FileCoverage> {
        self.files.get(file)
    }

    /// Files with probed lines, in path order
    pub fn files(&self) -> impl Iterator<Item = (&str, &FileCoverage)> {
        self.files.iter().map(|(f, c)| (f.as_str(), c))
    }

    /// Whether every file's sets are pairwise disjoint
    #[must_use]
    pub fn is_disjoint(&self) -> bool {
        self.files.values().all(FileCoverage::is_disjoint)
    }

    /// Whether nothing was observed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests;
