//! Intersect a requested build scope with the dirty set.

use std::collections::BTreeSet;

use dirtmark_targets::{BuildTarget, Variant};

use crate::error::EngineError;
use crate::graph::{ChunkId, DependencyGraph, TargetId};
use crate::propagate::DirtySet;

/// What the caller asked to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedScope {
    /// Everything, regardless of the dirty set.
    FullRebuild,
    /// The named targets plus their dirty dependencies.
    RebuildTargets(BTreeSet<BuildTarget>),
    /// Exactly the dirty set.
    Incremental,
}

impl RequestedScope {
    /// Request every target of one variant.
    pub fn variant(graph: &DependencyGraph, variant: Variant) -> Self {
        RequestedScope::RebuildTargets(
            graph
                .target_ids()
                .filter_map(|t| graph.build_target(t))
                .filter(|t| t.variant == variant)
                .cloned()
                .collect(),
        )
    }
}

/// One chunk handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkChunk {
    pub id: ChunkId,
    pub variant: Variant,
    pub targets: Vec<TargetId>,
    pub build_targets: Vec<BuildTarget>,
}

/// Chunks to build, dependencies first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkList {
    chunks: Vec<WorkChunk>,
}

impl WorkList {
    pub fn chunks(&self) -> &[WorkChunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of targets across all chunks.
    pub fn target_count(&self) -> usize {
        self.chunks.iter().map(|c| c.targets.len()).sum()
    }

    pub fn build_targets(&self) -> impl Iterator<Item = &BuildTarget> {
        self.chunks.iter().flat_map(|c| c.build_targets.iter())
    }
}

/// Produce the ordered work list for `scope`.
///
/// Partially selected chunks are completed: a chunk is built whole or not
/// at all.
///
/// # Errors
/// Returns [`EngineError::UnknownTarget`] if a requested target is not in
/// the graph.
pub fn resolve(
    dirty: &DirtySet,
    scope: &RequestedScope,
    graph: &DependencyGraph,
) -> Result<WorkList, EngineError> {
    let selected: BTreeSet<TargetId> = match scope {
        RequestedScope::FullRebuild => graph.target_ids().collect(),
        RequestedScope::Incremental => dirty.targets().collect(),
        RequestedScope::RebuildTargets(requested) => {
            let roots = requested
                .iter()
                .map(|target| {
                    graph
                        .target_id(target)
                        .ok_or_else(|| EngineError::UnknownTarget {
                            target: target.to_string(),
                        })
                })
                .collect::<Result<BTreeSet<TargetId>, EngineError>>()?;
            let dependencies = graph.transitive_dependencies(&roots);
            let mut selected = roots;
            selected.extend(dependencies.into_iter().filter(|&t| dirty.contains(t)));
            selected
        }
    };

    let chunk_ids: BTreeSet<ChunkId> = selected
        .iter()
        .filter_map(|&t| graph.chunk_of(t))
        .collect();

    let chunks = graph
        .chunks()
        .iter()
        .filter(|chunk| chunk_ids.contains(&chunk.id))
        .map(|chunk| WorkChunk {
            id: chunk.id,
            variant: chunk.variant,
            targets: chunk.targets.clone(),
            build_targets: chunk
                .targets
                .iter()
                .filter_map(|&t| graph.build_target(t).cloned())
                .collect(),
        })
        .collect();
    Ok(WorkList { chunks })
}
