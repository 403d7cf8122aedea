//! Turn raw change notifications into dirty seeds.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use dirtmark_config::Destination;
use dirtmark_targets::Variant;

use crate::error::EngineError;
use crate::graph::{DependencyGraph, TargetId};
use crate::signature::{Signature, SignatureSource};
use crate::state::StateStore;

/// One atomic change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// A file was added or modified.
    SourceChanged(PathBuf),
    SourceRemoved(PathBuf),
    LibraryRootChanged { library: String, root: PathBuf },
    /// A module's dependency declarations were edited. The graph must be
    /// rebuilt before classification.
    DependencyDeclarationChanged(String),
}

/// The changes of one build request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    #[must_use]
    pub fn with(mut self, change: Change) -> Self {
        self.changes.push(change);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn has_declaration_changes(&self) -> bool {
        self.changes
            .iter()
            .any(|c| matches!(c, Change::DependencyDeclarationChanged(_)))
    }
}

impl FromIterator<Change> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Change>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

/// Why a target was seeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedReason {
    SourceChanged(PathBuf),
    SourceRemoved(PathBuf),
    LibraryRootChanged(String),
    DeclarationChanged,
    /// No successful build is on record.
    NeverBuilt,
    DanglingDependency(Destination),
    MissingLibraryRoot(String),
    /// Scan mode found a signature different from the recorded one.
    Stale,
}

impl SeedReason {
    /// Fail-safe seeds are never pruned by the up-to-date check.
    pub fn is_fail_safe(&self) -> bool {
        matches!(
            self,
            SeedReason::NeverBuilt
                | SeedReason::DanglingDependency(_)
                | SeedReason::MissingLibraryRoot(_)
        )
    }
}

impl fmt::Display for SeedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedReason::SourceChanged(path) => write!(f, "source changed: {}", path.display()),
            SeedReason::SourceRemoved(path) => write!(f, "source removed: {}", path.display()),
            SeedReason::LibraryRootChanged(lib) => write!(f, "library `{lib}` changed"),
            SeedReason::DeclarationChanged => f.write_str("dependency declarations changed"),
            SeedReason::NeverBuilt => f.write_str("never built"),
            SeedReason::DanglingDependency(dest) => write!(f, "depends on undeclared {dest}"),
            SeedReason::MissingLibraryRoot(lib) => write!(f, "library `{lib}` has a missing root"),
            SeedReason::Stale => f.write_str("inputs differ from last successful build"),
        }
    }
}

/// A target directly implicated by a change, before propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub target: TargetId,
    pub reason: SeedReason,
    /// Current signature, when computed. Only seeds with a signature can be
    /// pruned as false positives.
    pub signature: Option<Signature>,
}

/// Maps changes onto targets of one graph snapshot.
pub struct Classifier<'a> {
    graph: &'a DependencyGraph,
    store: &'a dyn StateStore,
    signatures: &'a dyn SignatureSource,
    project_root: &'a Path,
    scan: bool,
}

impl<'a> Classifier<'a> {
    pub fn new(
        graph: &'a DependencyGraph,
        store: &'a dyn StateStore,
        signatures: &'a dyn SignatureSource,
        project_root: &'a Path,
    ) -> Self {
        Self {
            graph,
            store,
            signatures,
            project_root,
            scan: false,
        }
    }

    /// Also compare every target's signature with the store.
    #[must_use]
    pub fn scan(mut self, scan: bool) -> Self {
        self.scan = scan;
        self
    }

    /// Seeds for `changes`, plus the fail-safe seeds every build carries:
    /// targets never built, targets with dangling dependencies and targets
    /// depending on a library with a missing root.
    ///
    /// Seeds are returned in target order, one per target. When a target
    /// is seeded for several reasons, a fail-safe reason wins.
    pub fn classify(&self, changes: &ChangeSet) -> Vec<Seed> {
        let mut seeds: BTreeMap<TargetId, SeedReason> = BTreeMap::new();

        for change in changes.iter() {
            self.classify_change(change, &mut seeds);
        }
        self.fail_safe_seeds(&mut seeds);
        if self.scan {
            self.stale_seeds(&mut seeds);
        }

        seeds
            .into_iter()
            .map(|(target, reason)| {
                let signature = if reason.is_fail_safe() {
                    None
                } else {
                    self.current_signature(target)
                };
                Seed {
                    target,
                    reason,
                    signature,
                }
            })
            .collect()
    }

    fn classify_change(&self, change: &Change, seeds: &mut BTreeMap<TargetId, SeedReason>) {
        match change {
            Change::SourceChanged(path) | Change::SourceRemoved(path) => {
                let Some(target) = self.owning_target(path) else {
                    tracing::debug!(path = %path.display(), "change outside every source root");
                    return;
                };
                let reason = if matches!(change, Change::SourceRemoved(_)) {
                    SeedReason::SourceRemoved(path.clone())
                } else {
                    SeedReason::SourceChanged(path.clone())
                };
                insert_seed(seeds, target, reason);
            }
            Change::LibraryRootChanged { library, root } => {
                let Some(lib) = self.graph.library_id(library) else {
                    tracing::warn!(library = %library, "change names an undeclared library");
                    return;
                };
                if self
                    .graph
                    .library(lib)
                    .is_some_and(|node| !node.roots.iter().any(|r| r == root))
                {
                    tracing::debug!(
                        library = %library,
                        root = %root.display(),
                        "changed root is not declared by the library"
                    );
                }
                for &(target, _) in self.graph.library_dependents(lib) {
                    insert_seed(seeds, target, SeedReason::LibraryRootChanged(library.clone()));
                }
            }
            Change::DependencyDeclarationChanged(name) => {
                let Some(module) = self.graph.module(name) else {
                    tracing::warn!(module = %name, "declaration change names an undeclared module");
                    return;
                };
                for variant in Variant::ALL {
                    if let Some(target) = module.target(variant) {
                        insert_seed(seeds, target, SeedReason::DeclarationChanged);
                    }
                }
            }
        }
    }

    fn fail_safe_seeds(&self, seeds: &mut BTreeMap<TargetId, SeedReason>) {
        for target in self.graph.target_ids() {
            if let Some(destination) = self.graph.dangling(target).first() {
                insert_seed(seeds, target, SeedReason::DanglingDependency(destination.clone()));
            }
            let never_built = self
                .graph
                .build_target(target)
                .is_some_and(|bt| self.store.entry(bt).is_none());
            if never_built {
                insert_seed(seeds, target, SeedReason::NeverBuilt);
            }
        }
        for library in self.graph.libraries() {
            if self.signatures.library_available(library) {
                continue;
            }
            tracing::warn!(library = %library.name, "library root is missing");
            let Some(lib) = self.graph.library_id(&library.name) else {
                continue;
            };
            for &(target, _) in self.graph.library_dependents(lib) {
                insert_seed(seeds, target, SeedReason::MissingLibraryRoot(library.name.clone()));
            }
        }
    }

    fn stale_seeds(&self, seeds: &mut BTreeMap<TargetId, SeedReason>) {
        for target in self.graph.target_ids() {
            if seeds.contains_key(&target) {
                continue;
            }
            let Some(bt) = self.graph.build_target(target) else {
                continue;
            };
            let stale = match self.current_signature(target) {
                Some(sig) => !self.store.is_up_to_date(bt, &sig),
                None => true,
            };
            if stale {
                insert_seed(seeds, target, SeedReason::Stale);
            }
        }
    }

    fn current_signature(&self, target: TargetId) -> Option<Signature> {
        match self.signatures.signature(self.graph, target) {
            Ok(sig) => Some(sig),
            Err(e) => {
                tracing::debug!(build_target = ?self.graph.build_target(target), "cannot compute signature: {e}");
                None
            }
        }
    }

    /// The target whose roots contain `path`. The deepest matching root wins.
    fn owning_target(&self, path: &Path) -> Option<TargetId> {
        let file = self.project_root.join(path);
        let mut best: Option<(usize, TargetId)> = None;
        for module in self.graph.modules() {
            for variant in Variant::ALL {
                let Some(target) = module.target(variant) else {
                    continue;
                };
                for root in module.roots(variant) {
                    let root = self.project_root.join(root);
                    if !file.starts_with(&root) {
                        continue;
                    }
                    let depth = root.components().count();
                    if best.is_none_or(|(d, _)| depth > d) {
                        best = Some((depth, target));
                    }
                }
            }
        }
        best.map(|(_, target)| target)
    }
}

fn insert_seed(seeds: &mut BTreeMap<TargetId, SeedReason>, target: TargetId, reason: SeedReason) {
    match seeds.get_mut(&target) {
        Some(existing) => {
            if reason.is_fail_safe() && !existing.is_fail_safe() {
                *existing = reason;
            }
        }
        None => {
            seeds.insert(target, reason);
        }
    }
}

/// Reject changes naming modules or libraries the graph does not know.
///
/// Classification itself only logs such changes; callers taking names from
/// a user use this to report typos.
///
/// # Errors
/// Returns [`EngineError::UnknownName`] for the first unknown name.
pub fn check_names(graph: &DependencyGraph, changes: &ChangeSet) -> Result<(), EngineError> {
    for change in changes.iter() {
        let unknown = match change {
            Change::LibraryRootChanged { library, .. } => graph
                .library_id(library)
                .is_none()
                .then(|| ("library", library.clone())),
            Change::DependencyDeclarationChanged(module) => graph
                .module(module)
                .is_none()
                .then(|| ("module", module.clone())),
            Change::SourceChanged(_) | Change::SourceRemoved(_) => None,
        };
        if let Some((kind, name)) = unknown {
            return Err(EngineError::UnknownName { kind, name });
        }
    }
    Ok(())
}
