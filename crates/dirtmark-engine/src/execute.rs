//! Drive an external executor over a work list.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use dirtmark_targets::BuildTarget;

use crate::error::EngineError;
use crate::graph::{ChunkId, DependencyGraph};
use crate::propagate::CancelFlag;
use crate::scope::{WorkChunk, WorkList};
use crate::signature::{Signature, SignatureSource};
use crate::state::{now_millis, StateStore};

/// Outcome of one target within a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetReport {
    Succeeded { outputs: Vec<PathBuf> },
    Failed { message: String },
}

/// The collaborator that actually compiles.
///
/// `build_chunk` is called from several threads at once for independent
/// chunks. It returns one report per member, in `chunk.targets` order.
pub trait BuildExecutor: Sync {
    fn build_chunk(&self, chunk: &WorkChunk) -> Vec<TargetReport>;

    /// Outputs of a target's previous build, invalidated before rebuilding.
    fn discard_outputs(&self, _target: &BuildTarget, _outputs: &[PathBuf]) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub succeeded: Vec<BuildTarget>,
    pub failed: Vec<(BuildTarget, String)>,
    /// Not attempted because a dependency failed or was skipped.
    pub skipped: Vec<BuildTarget>,
    /// Not attempted because the request was cancelled.
    pub cancelled: Vec<BuildTarget>,
}

impl ExecutionSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && self.cancelled.is_empty()
    }

    pub fn was_cancelled(&self) -> bool {
        !self.cancelled.is_empty()
    }
}

enum ChunkOutcome {
    Built(Vec<BuildTarget>),
    Failed(Vec<(BuildTarget, String)>),
    Skipped(Vec<BuildTarget>),
}

/// Build `work` level by level.
///
/// # Algorithm
/// 1. Invalidate every target in the work list, so an interrupted or failed
///    build never leaves a stale target looking up to date.
/// 2. Walk the graph's parallel levels restricted to the work list; chunks
///    of one level run concurrently.
/// 3. A chunk whose dependency chunk failed or was skipped is skipped.
/// 4. A chunk succeeds only if every member succeeds; its members are then
///    recorded with the signature taken before the build started.
/// 5. Cancellation is checked between levels. Recorded targets stay recorded.
///
/// # Errors
/// Returns an error if invalidating the store fails.
pub fn execute(
    work: &WorkList,
    graph: &DependencyGraph,
    executor: &dyn BuildExecutor,
    store: &dyn StateStore,
    signatures: &dyn SignatureSource,
    cancel: &CancelFlag,
) -> Result<ExecutionSummary, EngineError> {
    let mut summary = ExecutionSummary::default();

    for target in work.build_targets() {
        let stale = store.invalidate(target)?;
        if !stale.is_empty() {
            executor.discard_outputs(target, &stale);
        }
    }

    let chunks: HashMap<ChunkId, &WorkChunk> = work.chunks().iter().map(|c| (c.id, c)).collect();
    let levels: Vec<Vec<&WorkChunk>> = graph
        .parallel_levels()
        .into_iter()
        .map(|level| level.iter().filter_map(|id| chunks.get(id).copied()).collect())
        .filter(|level: &Vec<&WorkChunk>| !level.is_empty())
        .collect();

    let blocked: Mutex<BTreeSet<ChunkId>> = Mutex::new(BTreeSet::new());

    for (index, level) in levels.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::info!(
                "build cancelled; {} level(s) not started",
                levels.len().saturating_sub(index)
            );
            for rest in levels.iter().skip(index) {
                for chunk in rest {
                    summary.cancelled.extend(chunk.build_targets.iter().cloned());
                }
            }
            break;
        }

        let outcomes: Vec<ChunkOutcome> = level
            .par_iter()
            .map(|chunk| {
                let is_blocked = {
                    let blocked = blocked
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    graph
                        .chunk_dependencies(chunk.id)
                        .iter()
                        .any(|dep| blocked.contains(dep))
                };
                if is_blocked {
                    tracing::warn!(chunk = chunk.id.index(), "skipping chunk: a dependency did not build");
                    return ChunkOutcome::Skipped(chunk.build_targets.clone());
                }
                let outcome = build_one(chunk, graph, executor, store, signatures);
                if !matches!(outcome, ChunkOutcome::Built(_)) {
                    blocked
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .insert(chunk.id);
                }
                outcome
            })
            .collect();

        // Skipped chunks block their dependents too.
        for (chunk, outcome) in level.iter().zip(&outcomes) {
            if matches!(outcome, ChunkOutcome::Skipped(_)) {
                blocked
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(chunk.id);
            }
        }

        for outcome in outcomes {
            match outcome {
                ChunkOutcome::Built(targets) => summary.succeeded.extend(targets),
                ChunkOutcome::Failed(failures) => summary.failed.extend(failures),
                ChunkOutcome::Skipped(targets) => summary.skipped.extend(targets),
            }
        }
    }

    tracing::info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        skipped = summary.skipped.len(),
        cancelled = summary.cancelled.len(),
        "build finished"
    );
    Ok(summary)
}

fn build_one(
    chunk: &WorkChunk,
    graph: &DependencyGraph,
    executor: &dyn BuildExecutor,
    store: &dyn StateStore,
    signatures: &dyn SignatureSource,
) -> ChunkOutcome {
    let before: Vec<Option<Signature>> = chunk
        .targets
        .iter()
        .map(|&t| match signatures.signature(graph, t) {
            Ok(sig) => Some(sig),
            Err(e) => {
                tracing::warn!(build_target = ?graph.build_target(t), "cannot compute signature, result will not be recorded: {e}");
                None
            }
        })
        .collect();

    tracing::debug!(chunk = chunk.id.index(), targets = ?chunk.build_targets, "building chunk");
    let reports = executor.build_chunk(chunk);

    let failures: Vec<(BuildTarget, String)> = chunk
        .build_targets
        .iter()
        .enumerate()
        .filter_map(|(i, target)| match reports.get(i) {
            Some(TargetReport::Succeeded { .. }) => None,
            Some(TargetReport::Failed { message }) => Some((target.clone(), message.clone())),
            None => Some((target.clone(), "executor reported no result".to_owned())),
        })
        .collect();
    if !failures.is_empty() {
        for (target, message) in &failures {
            tracing::warn!(build_target = %target, "build failed: {message}");
        }
        // A chunk is built whole or not at all: members that did succeed
        // are not recorded either.
        let failed: BTreeSet<&BuildTarget> = failures.iter().map(|(t, _)| t).collect();
        let mut all = failures.clone();
        all.extend(
            chunk
                .build_targets
                .iter()
                .filter(|t| !failed.contains(t))
                .map(|t| (t.clone(), "another member of its chunk failed".to_owned())),
        );
        return ChunkOutcome::Failed(all);
    }

    let built_at = now_millis();
    let mut built = Vec::with_capacity(chunk.build_targets.len());
    for ((target, report), signature) in chunk.build_targets.iter().zip(reports).zip(before) {
        let TargetReport::Succeeded { outputs } = report else {
            continue;
        };
        if let Some(signature) = signature {
            if let Err(e) = store.record_success(target, built_at, signature, outputs) {
                tracing::warn!(build_target = %target, "cannot record build state: {e}");
            }
        }
        built.push(target.clone());
    }
    ChunkOutcome::Built(built)
}
