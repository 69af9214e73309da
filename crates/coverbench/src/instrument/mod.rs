//! On-demand loading and instrumentation of code units.
//!
//! An [`InstrumentingLoader`] searches its roots in priority order for a
//! unit's probe image, instruments it against the snippet's
//! [`ProbeRuntime`] and defines the result in its own namespace. Names it
//! cannot find are delegated to a parent [`CodeLoader`] untouched.

mod image;
mod probes;

pub use image::{image_path, ProbeKind, ProbeSite, UnitImage, IMAGE_EXTENSION, NAME_SEPARATOR};
pub use probes::{ProbeId, ProbeRuntime, ProbeTable};

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::tracker;

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the loader that defined a code object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(u64);

impl LoaderId {
    fn next() -> Self {
        Self(NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Errors raised while loading a unit
#[derive(Debug, Error)]
pub enum LoadError {
    /// No loader in the chain knows the unit
    #[error("Unit `{name}` not found")]
    NotFound {
        /// Unit name
        name: String,
    },

    /// The unit name cannot be mapped to a path
    #[error("Invalid unit name `{name}`")]
    InvalidName {
        /// Unit name
        name: String,
    },

    /// Reading the image failed
    #[error("Failed to read image of `{name}` at {path}: {source}")]
    Io {
        /// Unit name
        name: String,
        /// Image path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The image could not be instrumented
    #[error("Failed to instrument `{name}` from {path}: {message}")]
    Corrupt {
        /// Unit name
        name: String,
        /// Image path
        path: PathBuf,
        /// Error message
        message: String,
    },
}

impl LoadError {
    /// Name of the unit that failed to load
    #[must_use]
    pub fn unit(&self) -> &str {
        match self {
            Self::NotFound { name }
            | Self::InvalidName { name }
            | Self::Io { name, .. }
            | Self::Corrupt { name, .. } => name,
        }
    }
}

/// A loaded code unit
#[derive(Debug)]
pub struct CodeObject {
    name: String,
    source_file: String,
    loader: LoaderId,
    probe_count: usize,
    probes: Option<Arc<ProbeTable>>,
}

impl CodeObject {
    /// Record execution of probe `probe`.
    ///
    /// Every hit is also a safepoint: if the current case has been stopped
    /// the calling thread unwinds here.
    #[inline]
    pub fn hit(&self, probe: u32) {
        tracker::safepoint();
        if let Some(table) = &self.probes {
            table.record(ProbeId::new(probe));
        }
    }

    /// Record execution of several probes in order
    pub fn hit_all(&self, probes: impl IntoIterator<Item = u32>) {
        for probe in probes {
            self.hit(probe);
        }
    }

    /// Fully qualified unit name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source file of the unit
    #[must_use]
    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    /// Loader that defined this object
    #[must_use]
    pub const fn loader_id(&self) -> LoaderId {
        self.loader
    }

    /// Whether hits are recorded
    #[must_use]
    pub const fn is_instrumented(&self) -> bool {
        self.probes.is_some()
    }

    /// Number of probe sites in the unit
    #[must_use]
    pub const fn probe_count(&self) -> usize {
        self.probe_count
    }
}

/// Something that resolves unit names to code objects
pub trait CodeLoader: Send + Sync + fmt::Debug {
    /// Load `name`, returning the same object for repeated calls
    fn load(&self, name: &str) -> Result<Arc<CodeObject>, LoadError>;

    /// Identity of this loader
    fn id(&self) -> LoaderId;
}

/// Parent loader that knows nothing
#[derive(Debug)]
pub struct EmptyLoader {
    id: LoaderId,
}

impl EmptyLoader {
    /// Create a new empty loader
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: LoaderId::next(),
        }
    }
}

impl Default for EmptyLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeLoader for EmptyLoader {
    fn load(&self, name: &str) -> Result<Arc<CodeObject>, LoadError> {
        Err(LoadError::NotFound {
            name: name.to_string(),
        })
    }

    fn id(&self) -> LoaderId {
        self.id
    }
}

/// Cache of defined objects keyed by unit name
#[derive(Debug, Default)]
struct Namespace {
    defined: Mutex<HashMap<String, Arc<CodeObject>>>,
}

impl Namespace {
    /// Look up `name`, defining it with `define` on a miss. Holding the lock
    /// across `define` keeps concurrent loads of one name idempotent.
    fn get_or_define<F>(&self, name: &str, define: F) -> Result<Option<Arc<CodeObject>>, LoadError>
    where
        F: FnOnce() -> Result<Option<CodeObject>, LoadError>,
    {
        let mut defined = self.defined.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(object) = defined.get(name) {
            return Ok(Some(Arc::clone(object)));
        }
        let Some(object) = define()? else {
            return Ok(None);
        };
        let object = Arc::new(object);
        defined.insert(name.to_string(), Arc::clone(&object));
        Ok(Some(object))
    }

    fn names(&self) -> Vec<String> {
        let defined = self.defined.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = defined.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Find and read the first image for `name` under `roots`
fn read_image(roots: &[PathBuf], name: &str) -> Result<Option<(PathBuf, Vec<u8>)>, LoadError> {
    for root in roots {
        let path = image_path(root, name).ok_or_else(|| LoadError::InvalidName {
            name: name.to_string(),
        })?;
        match fs::read(&path) {
            Ok(bytes) => return Ok(Some((path, bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(LoadError::Io {
                    name: name.to_string(),
                    path,
                    source,
                })
            }
        }
    }
    Ok(None)
}

fn decode_image(name: &str, path: &Path, bytes: &[u8]) -> Result<UnitImage, LoadError> {
    let image = UnitImage::decode(bytes).map_err(|e| LoadError::Corrupt {
        name: name.to_string(),
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if image.name != name {
        return Err(LoadError::Corrupt {
            name: name.to_string(),
            path: path.to_path_buf(),
            message: format!("image declares unit `{}`", image.name),
        });
    }
    Ok(image)
}

/// Loader that defines units without instrumenting them
#[derive(Debug)]
pub struct PlainLoader {
    id: LoaderId,
    roots: Vec<PathBuf>,
    namespace: Namespace,
}

impl PlainLoader {
    /// Create a loader over `roots`, searched in order
    #[must_use]
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            id: LoaderId::next(),
            roots,
            namespace: Namespace::default(),
        }
    }
}

impl CodeLoader for PlainLoader {
    fn load(&self, name: &str) -> Result<Arc<CodeObject>, LoadError> {
        self.namespace
            .get_or_define(name, || {
                let Some((path, bytes)) = read_image(&self.roots, name)? else {
                    return Ok(None);
                };
                let image = decode_image(name, &path, &bytes)?;
                Ok(Some(CodeObject {
                    probe_count: image.probes.len(),
                    name: image.name,
                    source_file: image.source_file,
                    loader: self.id,
                    probes: None,
                }))
            })?
            .ok_or_else(|| LoadError::NotFound {
                name: name.to_string(),
            })
    }

    fn id(&self) -> LoaderId {
        self.id
    }
}

/// Loader that instruments every unit it finds under its roots
#[derive(Debug)]
pub struct InstrumentingLoader {
    id: LoaderId,
    roots: Vec<PathBuf>,
    parent: Arc<dyn CodeLoader>,
    runtime: Arc<ProbeRuntime>,
    namespace: Namespace,
}

impl InstrumentingLoader {
    /// Create a loader over `roots` (highest priority first)
    #[must_use]
    pub fn new(roots: Vec<PathBuf>, parent: Arc<dyn CodeLoader>, runtime: Arc<ProbeRuntime>) -> Self {
        Self {
            id: LoaderId::next(),
            roots,
            parent,
            runtime,
            namespace: Namespace::default(),
        }
    }

    /// Probe runtime receiving this loader's hits
    #[must_use]
    pub fn runtime(&self) -> &Arc<ProbeRuntime> {
        &self.runtime
    }

    /// Roots in search order
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Names defined by this loader (not by its parent), sorted
    #[must_use]
    pub fn defined_names(&self) -> Vec<String> {
        self.namespace.names()
    }

    fn instrument(&self, name: &str, path: &Path, bytes: &[u8]) -> Result<CodeObject, LoadError> {
        let image = decode_image(name, path, bytes)?;
        debug!(unit = name, probes = image.probes.len(), path = %path.display(), "instrumenting");
        let name = image.name.clone();
        let source_file = image.source_file.clone();
        let table = self.runtime.register(image);
        Ok(CodeObject {
            name,
            source_file,
            loader: self.id,
            probe_count: table.probe_count(),
            probes: Some(table),
        })
    }
}

impl CodeLoader for InstrumentingLoader {
    fn load(&self, name: &str) -> Result<Arc<CodeObject>, LoadError> {
        let defined = self.namespace.get_or_define(name, || {
            let Some((path, bytes)) = read_image(&self.roots, name)? else {
                return Ok(None);
            };
            self.instrument(name, &path, &bytes).map(Some)
        })?;
        match defined {
            Some(object) => Ok(object),
            None => {
                debug!(unit = name, "delegating to parent loader");
                self.parent.load(name)
            }
        }
    }

    fn id(&self) -> LoaderId {
        self.id
    }
}
