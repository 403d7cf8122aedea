//! Reverse-reachability from dirty seeds.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dirtmark_config::DependencyScope;
use dirtmark_targets::Variant;

use crate::classify::{Seed, SeedReason};
use crate::graph::{DependencyGraph, TargetId};
use crate::state::StateStore;

/// Cooperative cancellation shared between a request and its workers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a target is dirty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyReason {
    Seed(SeedReason),
    /// `via` is a dirty dependency; `depth` is the edge count from the seed.
    Dependency { via: TargetId, depth: usize },
    /// Another member of the same chunk is dirty.
    ChunkMember { via: TargetId },
}

impl DirtyReason {
    fn via(&self) -> Option<TargetId> {
        match self {
            DirtyReason::Seed(_) => None,
            DirtyReason::Dependency { via, .. } | DirtyReason::ChunkMember { via } => Some(*via),
        }
    }
}

/// Result of one propagation run. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtySet {
    reasons: BTreeMap<TargetId, DirtyReason>,
    pruned: Vec<TargetId>,
}

impl DirtySet {
    pub fn contains(&self, target: TargetId) -> bool {
        self.reasons.contains_key(&target)
    }

    pub fn reason(&self, target: TargetId) -> Option<&DirtyReason> {
        self.reasons.get(&target)
    }

    pub fn len(&self) -> usize {
        self.reasons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }

    /// Dirty targets in id order.
    pub fn targets(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.reasons.keys().copied()
    }

    /// Seeds dropped because the store already had their signature.
    pub fn pruned(&self) -> &[TargetId] {
        &self.pruned
    }

    /// The chain of reasons from `target` back to the seed that caused it,
    /// starting with `target` itself. Empty if `target` is clean.
    pub fn explain(&self, target: TargetId) -> Vec<(TargetId, &DirtyReason)> {
        let mut chain = Vec::new();
        let mut current = Some(target);
        while let Some(id) = current {
            let Some(reason) = self.reasons.get(&id) else {
                break;
            };
            chain.push((id, reason));
            current = reason.via();
            if chain.len() > self.reasons.len() {
                break;
            }
        }
        chain
    }
}

/// Compute the dirty set for `seeds`.
///
/// # Algorithm
/// 1. Drop seeds whose signature matches the store (false positives such as
///    touched-but-unchanged files). Fail-safe seeds are always kept.
/// 2. Breadth-first from the remaining seeds along reverse edges, so a
///    target's depth is its distance from the nearest seed.
/// 3. A dirty target marks every other member of its chunk.
/// 4. A TEST-scope edge never dirties a PRODUCTION target.
///
/// Each target is marked at most once. Returns `None` if `cancel` is raised
/// before completion; nothing partial escapes.
pub fn propagate(
    seeds: &[Seed],
    graph: &DependencyGraph,
    store: &dyn StateStore,
    cancel: &CancelFlag,
) -> Option<DirtySet> {
    let mut dirty = DirtySet::default();
    let mut queue: VecDeque<(TargetId, usize)> = VecDeque::new();

    for seed in seeds {
        if !seed.reason.is_fail_safe() {
            let up_to_date = match (&seed.signature, graph.build_target(seed.target)) {
                (Some(sig), Some(target)) => store.is_up_to_date(target, sig),
                _ => false,
            };
            if up_to_date {
                tracing::debug!(build_target = ?graph.build_target(seed.target), "seed is up to date, pruned");
                dirty.pruned.push(seed.target);
                continue;
            }
        }
        if !dirty.reasons.contains_key(&seed.target) {
            dirty
                .reasons
                .insert(seed.target, DirtyReason::Seed(seed.reason.clone()));
            queue.push_back((seed.target, 0));
        }
    }

    while let Some((current, depth)) = queue.pop_front() {
        if cancel.is_cancelled() {
            tracing::debug!("propagation cancelled");
            return None;
        }

        let chunk_members = graph
            .chunk_of(current)
            .and_then(|id| graph.chunk(id))
            .map_or(&[][..], |chunk| chunk.targets.as_slice());
        for &member in chunk_members {
            if member != current && !dirty.reasons.contains_key(&member) {
                dirty
                    .reasons
                    .insert(member, DirtyReason::ChunkMember { via: current });
                queue.push_back((member, depth));
            }
        }

        for &(dependent, scope) in graph.dependents(current) {
            if scope == DependencyScope::Test
                && graph
                    .build_target(dependent)
                    .is_some_and(|t| t.variant == Variant::Production)
            {
                continue;
            }
            if dirty.reasons.contains_key(&dependent) {
                continue;
            }
            let next = depth.saturating_add(1);
            dirty.reasons.insert(
                dependent,
                DirtyReason::Dependency {
                    via: current,
                    depth: next,
                },
            );
            queue.push_back((dependent, next));
        }
    }

    tracing::debug!(
        seeds = seeds.len(),
        pruned = dirty.pruned.len(),
        dirty = dirty.len(),
        "propagation finished"
    );
    Some(dirty)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::Path;

    use super::*;
    use crate::classify::{Change, ChangeSet, Classifier};
    use crate::state::MemoryStateStore;
    use crate::testing::{lib, module, record_all, ModelBuilder, StaticSignatures};
    use dirtmark_targets::BuildTarget;
    use proptest::prelude::*;

    fn id(graph: &DependencyGraph, target: &str) -> TargetId {
        graph.target_id(&target.parse().unwrap()).unwrap()
    }

    fn seed(graph: &DependencyGraph, target: &str) -> Seed {
        Seed {
            target: id(graph, target),
            reason: SeedReason::DeclarationChanged,
            signature: None,
        }
    }

    fn dirty_names(graph: &DependencyGraph, dirty: &DirtySet) -> Vec<String> {
        dirty
            .targets()
            .map(|t| graph.build_target(t).unwrap().to_string())
            .collect()
    }

    fn run(graph: &DependencyGraph, seeds: &[Seed]) -> DirtySet {
        propagate(seeds, graph, &MemoryStateStore::new(), &CancelFlag::new()).unwrap()
    }

    #[test]
    fn empty_seeds_give_empty_set() {
        let graph = ModelBuilder::new().module("a").graph();
        assert!(run(&graph, &[]).is_empty());
    }

    #[test]
    fn chain_is_followed_with_depth() {
        let graph = ModelBuilder::new()
            .module("c")
            .module("b")
            .module("a")
            .dep("b", module("c"), DependencyScope::Compile, false)
            .dep("a", module("b"), DependencyScope::Compile, false)
            .graph();
        let dirty = run(&graph, &[seed(&graph, "c")]);
        assert_eq!(dirty_names(&graph, &dirty), ["c", "b", "a"]);
        assert_eq!(
            dirty.reason(id(&graph, "a")),
            Some(&DirtyReason::Dependency {
                via: id(&graph, "b"),
                depth: 2
            })
        );
    }

    #[test]
    fn dependencies_of_seed_stay_clean() {
        let graph = ModelBuilder::new()
            .module("c")
            .module("b")
            .dep("b", module("c"), DependencyScope::Compile, false)
            .graph();
        let dirty = run(&graph, &[seed(&graph, "b")]);
        assert_eq!(dirty_names(&graph, &dirty), ["b"]);
    }

    #[test]
    fn test_edge_never_dirties_production() {
        let graph = ModelBuilder::new()
            .module("b")
            .tests("b")
            .module("x")
            .module("a")
            .dep("b", module("x"), DependencyScope::Test, false)
            .dep("a", module("b"), DependencyScope::Compile, false)
            .graph();
        let dirty = run(&graph, &[seed(&graph, "x")]);
        assert_eq!(dirty_names(&graph, &dirty), ["b:test", "x"]);
    }

    #[test]
    fn production_change_dirties_own_tests() {
        let graph = ModelBuilder::new().module("a").tests("a").graph();
        let dirty = run(&graph, &[seed(&graph, "a")]);
        assert_eq!(dirty_names(&graph, &dirty), ["a", "a:test"]);
    }

    #[test]
    fn test_change_leaves_production_clean() {
        let graph = ModelBuilder::new().module("a").tests("a").graph();
        let dirty = run(&graph, &[seed(&graph, "a:test")]);
        assert_eq!(dirty_names(&graph, &dirty), ["a:test"]);
    }

    #[test]
    fn chunk_members_are_dirtied_together() {
        let graph = ModelBuilder::new()
            .module("a")
            .module("b")
            .module("c")
            .module("user")
            .dep("a", module("b"), DependencyScope::Compile, false)
            .dep("b", module("a"), DependencyScope::Compile, false)
            .dep("user", module("c"), DependencyScope::Compile, false)
            .graph();
        let dirty = run(&graph, &[seed(&graph, "a")]);
        assert_eq!(dirty_names(&graph, &dirty), ["a", "b"]);
    }

    #[test]
    fn chunk_through_test_cycle_keeps_production_clean() {
        // a sees b only from its tests, so the cycle does not join the
        // production targets of a and b.
        let graph = ModelBuilder::new()
            .module("a")
            .tests("a")
            .module("b")
            .dep("a", module("b"), DependencyScope::Test, false)
            .dep("b", module("a"), DependencyScope::Compile, false)
            .graph();
        let dirty = run(&graph, &[seed(&graph, "b")]);
        assert_eq!(dirty_names(&graph, &dirty), ["a:test", "b"]);
        assert!(!dirty.contains(id(&graph, "a")));
        assert_eq!(
            dirty.reason(id(&graph, "a:test")),
            Some(&DirtyReason::Dependency {
                via: id(&graph, "b"),
                depth: 1
            })
        );
    }

    #[test]
    fn explain_walks_back_to_seed() {
        let graph = ModelBuilder::new()
            .library("l")
            .module("c")
            .module("b")
            .module("a")
            .dep("c", lib("l"), DependencyScope::Compile, false)
            .dep("b", module("c"), DependencyScope::Compile, false)
            .dep("a", module("b"), DependencyScope::Compile, false)
            .graph();
        let dirty = run(&graph, &[seed(&graph, "c")]);
        let chain: Vec<_> = dirty
            .explain(id(&graph, "a"))
            .into_iter()
            .map(|(t, _)| graph.build_target(t).unwrap().to_string())
            .collect();
        assert_eq!(chain, ["a", "b", "c"]);
        assert!(matches!(
            dirty.explain(id(&graph, "a")).last().unwrap().1,
            DirtyReason::Seed(_)
        ));
    }

    #[test]
    fn up_to_date_seed_is_pruned() {
        let graph = ModelBuilder::new()
            .module("a")
            .module("b")
            .dep("b", module("a"), DependencyScope::Compile, false)
            .graph();
        let store = MemoryStateStore::new();
        let sigs = StaticSignatures::default();
        record_all(&graph, &store, &sigs);

        let changes = ChangeSet::new().with(Change::SourceChanged("a/src/A.kt".into()));
        let seeds = Classifier::new(&graph, &store, &sigs, Path::new("/p")).classify(&changes);
        let dirty = propagate(&seeds, &graph, &store, &CancelFlag::new()).unwrap();
        assert!(dirty.is_empty());
        assert_eq!(dirty.pruned(), [id(&graph, "a")]);

        sigs.set(&BuildTarget::production("a"), "edited");
        let seeds = Classifier::new(&graph, &store, &sigs, Path::new("/p")).classify(&changes);
        let dirty = propagate(&seeds, &graph, &store, &CancelFlag::new()).unwrap();
        assert_eq!(dirty_names(&graph, &dirty), ["a", "b"]);
    }

    #[test]
    fn fail_safe_seed_is_never_pruned() {
        let graph = ModelBuilder::new().module("a").graph();
        let store = MemoryStateStore::new();
        let sigs = StaticSignatures::default();
        record_all(&graph, &store, &sigs);
        let a = id(&graph, "a");
        let signature = store.entry(graph.build_target(a).unwrap()).unwrap().signature;
        let seeds = [Seed {
            target: a,
            reason: SeedReason::MissingLibraryRoot("l".to_owned()),
            signature: Some(signature),
        }];
        let dirty = propagate(&seeds, &graph, &store, &CancelFlag::new()).unwrap();
        assert!(dirty.contains(a));
    }

    #[test]
    fn cancelled_propagation_returns_nothing() {
        let graph = ModelBuilder::new()
            .module("a")
            .module("b")
            .dep("b", module("a"), DependencyScope::Compile, false)
            .graph();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = propagate(
            &[seed(&graph, "a")],
            &graph,
            &MemoryStateStore::new(),
            &cancel,
        );
        assert!(result.is_none());
    }

    proptest! {
        /// Every dirty target's dependents are dirty too, except production
        /// targets reached only through test edges; and adding seeds never
        /// shrinks the result.
        #[test]
        fn closure_and_monotonicity(
            edges in proptest::collection::vec((0usize..6, 0usize..6, any::<bool>()), 0..16),
            seeds_a in proptest::collection::btree_set(0usize..6, 0..3),
            seeds_b in proptest::collection::btree_set(0usize..6, 0..3),
        ) {
            let mut builder = ModelBuilder::new();
            for i in 0..6 {
                builder = builder.module(&format!("m{i}")).tests(&format!("m{i}"));
            }
            for (from, to, test_scope) in edges {
                let scope = if test_scope { DependencyScope::Test } else { DependencyScope::Compile };
                builder = builder.dep(&format!("m{from}"), module(&format!("m{to}")), scope, false);
            }
            let graph = builder.graph();
            let to_seeds = |set: &BTreeSet<usize>| -> Vec<Seed> {
                set.iter().map(|i| seed(&graph, &format!("m{i}"))).collect()
            };

            let small = run(&graph, &to_seeds(&seeds_a));
            for t in small.targets() {
                for &(dependent, scope) in graph.dependents(t) {
                    let production = graph.build_target(dependent).unwrap().variant == Variant::Production;
                    if scope == DependencyScope::Test && production {
                        continue;
                    }
                    prop_assert!(small.contains(dependent));
                }
            }

            let union: BTreeSet<usize> = seeds_a.union(&seeds_b).copied().collect();
            let large = run(&graph, &to_seeds(&union));
            for t in small.targets() {
                prop_assert!(large.contains(t));
            }
        }
    }
}
