//! Source line ranges of routines, found with `syn`.
//!
//! Line numbers come from `proc-macro2` span locations. A routine's range
//! runs from the first line of its signature to the line of the closing
//! brace of its body.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};
use syn::spanned::Spanned;
use syn::visit::{self, Visit};
use syn::{Block, GenericArgument, ImplItemFn, ItemFn, ItemImpl, PathArguments, ReturnType, Signature, TraitItemFn, Type};

use crate::snippet::RoutineRef;

/// Inclusive range of 1-based source lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineRange {
    /// First line
    pub start: u32,
    /// Last line
    pub end: u32,
}

impl LineRange {
    /// Lines in the range, ascending
    pub fn lines(self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }

    /// Whether `line` lies in the range
    #[must_use]
    pub const fn contains(self, line: u32) -> bool {
        self.start <= line && line <= self.end
    }
}

/// A routine with a body, as found in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineSpan {
    /// Self type of the enclosing impl, or trait name for default methods
    pub owner: Option<String>,
    /// Routine name
    pub name: String,
    /// Lines of signature and body
    pub range: LineRange,
    /// Whether the signature returns `Self` or the owner type
    pub returns_self: bool,
    /// Whether the signature has a `self` receiver
    pub takes_receiver: bool,
}

impl RoutineSpan {
    /// Whether this span is the routine `routine` refers to
    #[must_use]
    pub fn matches(&self, routine: &RoutineRef) -> bool {
        if let Some(owner) = &routine.owner {
            let wanted = owner.rsplit("::").next().unwrap_or(owner);
            if self.owner.as_deref() != Some(wanted) {
                return false;
            }
        }
        if routine.is_constructor() && self.takes_receiver {
            return false;
        }
        if routine.name.is_empty() {
            routine.constructor && self.returns_self
        } else {
            self.name == routine.name
        }
    }
}

struct RoutineVisitor {
    owners: Vec<String>,
    routines: Vec<RoutineSpan>,
}

impl RoutineVisitor {
    fn push(&mut self, sig: &Signature, block: &Block) {
        let owner = self.owners.last().cloned();
        let returns_self = returns_owner(&sig.output, owner.as_deref());
        self.routines.push(RoutineSpan {
            owner,
            name: sig.ident.to_string(),
            range: LineRange {
                start: line_of(sig.span().start().line),
                end: line_of(block.brace_token.span.close().end().line),
            },
            returns_self,
            takes_receiver: sig.receiver().is_some(),
        });
    }
}

fn line_of(line: usize) -> u32 {
    u32::try_from(line).unwrap_or(u32::MAX)
}

fn type_name(ty: &Type) -> Option<String> {
    match ty {
        Type::Path(path) => path.path.segments.last().map(|s| s.ident.to_string()),
        Type::Reference(reference) => type_name(&reference.elem),
        Type::Paren(paren) => type_name(&paren.elem),
        _ => None,
    }
}

fn mentions_owner(ty: &Type, owner: Option<&str>) -> bool {
    let Type::Path(path) = ty else {
        return false;
    };
    path.path.segments.iter().any(|segment| {
        let ident = segment.ident.to_string();
        if ident == "Self" || Some(ident.as_str()) == owner {
            return true;
        }
        // Result<Self, E>, Option<Self>, Box<Self>
        match &segment.arguments {
            PathArguments::AngleBracketed(args) => args.args.iter().any(|arg| match arg {
                GenericArgument::Type(inner) => mentions_owner(inner, owner),
                _ => false,
            }),
            _ => false,
        }
    })
}

fn returns_owner(output: &ReturnType, owner: Option<&str>) -> bool {
    match output {
        ReturnType::Default => false,
        ReturnType::Type(_, ty) => owner.is_some() && mentions_owner(ty, owner),
    }
}

impl<'ast> Visit<'ast> for RoutineVisitor {
    fn visit_item_fn(&mut self, item: &'ast ItemFn) {
        // Free functions nested in methods have no owner
        let outer = std::mem::take(&mut self.owners);
        self.push(&item.sig, &item.block);
        visit::visit_item_fn(self, item);
        self.owners = outer;
    }

    fn visit_item_impl(&mut self, item: &'ast ItemImpl) {
        let owner = type_name(&item.self_ty).unwrap_or_default();
        self.owners.push(owner);
        visit::visit_item_impl(self, item);
        self.owners.pop();
    }

    fn visit_impl_item_fn(&mut self, item: &'ast ImplItemFn) {
        self.push(&item.sig, &item.block);
        visit::visit_impl_item_fn(self, item);
    }

    fn visit_item_trait(&mut self, item: &'ast syn::ItemTrait) {
        self.owners.push(item.ident.to_string());
        visit::visit_item_trait(self, item);
        self.owners.pop();
    }

    fn visit_trait_item_fn(&mut self, item: &'ast TraitItemFn) {
        if let Some(block) = &item.default {
            self.push(&item.sig, block);
        }
        visit::visit_trait_item_fn(self, item);
    }
}

/// Every routine with a body in `source`, in source order
pub fn find_routines(source: &str) -> Result<Vec<RoutineSpan>, syn::Error> {
    let file = syn::parse_file(source)?;
    let mut visitor = RoutineVisitor {
        owners: Vec::new(),
        routines: Vec::new(),
    };
    visitor.visit_file(&file);
    Ok(visitor.routines)
}

/// Memoized routine lookup, keyed by the hash of the file contents
#[derive(Debug, Default)]
pub struct RangeIndex {
    parsed: Mutex<HashMap<[u8; 32], Arc<Vec<RoutineSpan>>>>,
    parses: AtomicUsize,
}

impl RangeIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routines in `source`, parsed at most once per distinct content
    pub fn routines(&self, source: &str) -> Result<Arc<Vec<RoutineSpan>>, syn::Error> {
        let key: [u8; 32] = Sha256::digest(source.as_bytes()).into();
        if let Some(found) = self
            .parsed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(found));
        }
        let routines = Arc::new(find_routines(source)?);
        self.parses.fetch_add(1, Ordering::Relaxed);
        self.parsed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&routines));
        Ok(routines)
    }

    /// Ranges of `routine` in `source`.
    ///
    /// A named routine yields its first match. A bare constructor reference
    /// yields every constructor of its owner. Empty when nothing matches.
    pub fn find(&self, source: &str, routine: &RoutineRef) -> Result<Vec<LineRange>, syn::Error> {
        let routines = self.routines(source)?;
        let mut matches = routines.iter().filter(|span| span.matches(routine));
        Ok(if routine.name.is_empty() {
            matches.map(|span| span.range).collect()
        } else {
            matches.next().map(|span| span.range).into_iter().collect()
        })
    }

    /// Number of parses performed
    #[must_use]
    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::Relaxed)
    }
}
