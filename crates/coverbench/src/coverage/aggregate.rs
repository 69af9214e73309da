//! Folding probe counters into line coverage.

use std::collections::BTreeMap;

use tracing::debug;

use super::{CoverageInfo, LineStatus};
use crate::instrument::ProbeRuntime;

/// Running coverage of one snippet
#[derive(Debug, Default)]
pub struct CoverageAggregator {
    coverage: CoverageInfo,
    observations: usize,
}

impl CoverageAggregator {
    /// Create an empty aggregator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Line coverage implied by the runtime's current counters.
    ///
    /// A line whose probes all ran is fully covered, one where only some ran
    /// is partly covered, and one where none ran is not covered.
    #[must_use]
    pub fn snapshot(runtime: &ProbeRuntime) -> CoverageInfo {
        let mut coverage = CoverageInfo::new();
        for table in runtime.tables() {
            // line -> (probes hit, probes total)
            let mut tally: BTreeMap<u32, (usize, usize)> = BTreeMap::new();
            for (site, hits) in table.observations() {
                let entry = tally.entry(site.line).or_default();
                entry.1 += 1;
                if hits > 0 {
                    entry.0 += 1;
                }
            }
            for (line, (hit, total)) in tally {
                coverage.record(table.source_file(), line, LineStatus::from_probes(hit, total));
            }
        }
        coverage
    }

    /// Fold the runtime's counters in after a case
    pub fn observe(&mut self, runtime: &ProbeRuntime) {
        let snapshot = Self::snapshot(runtime);
        self.fold(&snapshot);
    }

    /// Fold one case's coverage in
    pub fn fold(&mut self, coverage: &CoverageInfo) {
        self.coverage.merge(coverage);
        self.observations += 1;
        debug!(
            observations = self.observations,
            files = self.coverage.files().count(),
            "coverage folded"
        );
    }

    /// Coverage so far
    #[must_use]
    pub const fn coverage(&self) -> &CoverageInfo {
        &self.coverage
    }

    /// Number of folds
    #[must_use]
    pub const fn observations(&self) -> usize {
        self.observations
    }

    /// Final merged coverage
    #[must_use]
    pub fn finish(self) -> CoverageInfo {
        self.coverage
    }
}
