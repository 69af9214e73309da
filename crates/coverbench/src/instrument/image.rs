//! Probe images: the on-disk form of a compiled unit's probe sites.
//!
//! The build step writes one image per code unit next to the compiled code.
//! A unit named `geometry::Triangle` lives at `<root>/geometry/Triangle.pbin`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// File extension of probe images
pub const IMAGE_EXTENSION: &str = "pbin";

/// Separator between segments of a unit name
pub const NAME_SEPARATOR: &str = "::";

/// What a probe observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeKind {
    /// A straight-line statement
    Statement,
    /// One outcome of a conditional branch
    Branch,
}

/// A single probe site in a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeSite {
    /// 1-based source line
    pub line: u32,
    /// Probe kind
    pub kind: ProbeKind,
}

impl ProbeSite {
    /// Statement probe on `line`
    #[must_use]
    pub const fn statement(line: u32) -> Self {
        Self {
            line,
            kind: ProbeKind::Statement,
        }
    }

    /// Branch probe on `line`
    #[must_use]
    pub const fn branch(line: u32) -> Self {
        Self {
            line,
            kind: ProbeKind::Branch,
        }
    }
}

/// Decoded probe image of one code unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitImage {
    /// Fully qualified unit name
    pub name: String,
    /// Source file the probes point into, relative to the project source root
    pub source_file: String,
    /// Probe sites, indexed by probe number
    pub probes: Vec<ProbeSite>,
}

impl UnitImage {
    /// Create an image without probes
    #[must_use]
    pub fn new(name: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_file: source_file.into(),
            probes: Vec::new(),
        }
    }

    /// Append a probe site
    #[must_use]
    pub fn with_probe(mut self, site: ProbeSite) -> Self {
        self.probes.push(site);
        self
    }

    /// Append one statement probe per line
    #[must_use]
    pub fn with_statements(mut self, lines: impl IntoIterator<Item = u32>) -> Self {
        self.probes.extend(lines.into_iter().map(ProbeSite::statement));
        self
    }

    /// Decode an image from its bincode bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Encode the image as bincode bytes
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Write the image under `root`, creating parent directories
    pub fn write_to(&self, root: &Path) -> io::Result<PathBuf> {
        let path = image_path(root, &self.name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid unit name"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = self
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        fs::write(&path, bytes)?;
        Ok(path)
    }
}

/// Path of the image for `name` under `root`.
///
/// Returns `None` for names that could escape the root.
#[must_use]
pub fn image_path(root: &Path, name: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in name.split(NAME_SEPARATOR) {
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains(['/', '\\'])
        {
            return None;
        }
        path.push(segment);
    }
    path.set_extension(IMAGE_EXTENSION);
    Some(path)
}
