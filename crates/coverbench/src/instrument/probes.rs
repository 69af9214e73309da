//! Probe counters shared between instrumented code and the aggregator.
//!
//! One [`ProbeRuntime`] exists per snippet. Every unit instrumented for that
//! snippet registers a [`ProbeTable`]; instrumented code increments its
//! counters, the aggregator reads them after each case.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::image::{ProbeSite, UnitImage};

/// Index of a probe within its unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(u32);

impl ProbeId {
    /// Create a new probe ID
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the inner value
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Hit counters for the probe sites of one instrumented unit
#[derive(Debug)]
pub struct ProbeTable {
    unit: String,
    source_file: String,
    sites: Vec<ProbeSite>,
    hits: Vec<AtomicU64>,
}

impl ProbeTable {
    fn from_image(image: UnitImage) -> Self {
        let hits = image.probes.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            unit: image.name,
            source_file: image.source_file,
            sites: image.probes,
            hits,
        }
    }

    /// Record one execution of a probe. Out-of-range probes are ignored.
    #[inline]
    pub fn record(&self, probe: ProbeId) {
        if let Some(counter) = self.hits.get(probe.as_u32() as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Executions recorded for a probe
    #[must_use]
    pub fn hit_count(&self, probe: ProbeId) -> u64 {
        self.hits
            .get(probe.as_u32() as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Probe sites with their current hit counts
    pub fn observations(&self) -> impl Iterator<Item = (ProbeSite, u64)> + '_ {
        self.sites
            .iter()
            .zip(&self.hits)
            .map(|(site, hits)| (*site, hits.load(Ordering::Relaxed)))
    }

    /// Unit name
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Source file the probes point into
    #[must_use]
    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    /// Number of probe sites
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.sites.len()
    }

    fn reset(&self) {
        for counter in &self.hits {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// All probe tables registered for one snippet
#[derive(Debug, Default)]
pub struct ProbeRuntime {
    tables: Mutex<Vec<Arc<ProbeTable>>>,
}

impl ProbeRuntime {
    /// Create an empty runtime
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the probes of a decoded image
    pub fn register(&self, image: UnitImage) -> Arc<ProbeTable> {
        let table = Arc::new(ProbeTable::from_image(image));
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&table));
        table
    }

    /// Snapshot of the registered tables, in registration order
    #[must_use]
    pub fn tables(&self) -> Vec<Arc<ProbeTable>> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Total recorded probe executions
    #[must_use]
    pub fn total_hits(&self) -> u64 {
        self.tables()
            .iter()
            .flat_map(|t| t.observations().map(|(_, hits)| hits))
            .sum()
    }

    /// Zero every counter, keeping the registered tables
    pub fn reset(&self) {
        for table in self.tables() {
            table.reset();
        }
    }
}
