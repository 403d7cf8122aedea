//! Target-level dependency graph with re-export materialization and chunk ordering.
//!
//! The graph is an arena: modules, libraries, targets and chunks live in
//! vectors and refer to each other by index. It is rebuilt from scratch
//! whenever the project model changes and is immutable afterwards.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use petgraph::graph::{DiGraph, NodeIndex};

use dirtmark_config::{DependencyScope, Destination, ProjectModel};
use dirtmark_targets::{BuildTarget, Variant};

/// Index of a target in a [`DependencyGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(usize);

impl TargetId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index of a library in a [`DependencyGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LibraryId(usize);

impl LibraryId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index of a chunk; chunk ids follow build order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(usize);

impl ChunkId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Destination of a target-level edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Target(TargetId),
    Library(LibraryId),
}

/// Where a target-level edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOrigin {
    /// Lifted from a `[[module.dependency]]` declaration.
    Declared,
    /// A test target's edge to its own module's production target.
    OwnProduction,
    /// Inherited through an exported dependency of the named module index.
    Exported { through: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub to: Node,
    pub scope: DependencyScope,
    pub origin: EdgeOrigin,
}

#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub name: String,
    pub source_roots: Vec<PathBuf>,
    pub test_roots: Vec<PathBuf>,
    pub production: TargetId,
    pub test: Option<TargetId>,
}

impl ModuleNode {
    pub fn target(&self, variant: Variant) -> Option<TargetId> {
        match variant {
            Variant::Production => Some(self.production),
            Variant::Test => self.test,
        }
    }

    pub fn roots(&self, variant: Variant) -> &[PathBuf] {
        match variant {
            Variant::Production => &self.source_roots,
            Variant::Test => &self.test_roots,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LibraryNode {
    pub name: String,
    pub roots: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TargetNode {
    pub target: BuildTarget,
    /// Index of the owning module.
    pub module: usize,
    pub edges: Vec<Edge>,
    /// Dependencies that name nothing in the model. The target is dirty
    /// on every build until they are fixed.
    pub dangling: Vec<Destination>,
    pub chunk: ChunkId,
}

/// Targets compiled together: one variant of one strongly connected set of modules.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    pub variant: Variant,
    pub targets: Vec<TargetId>,
}

/// A module-level dependency after name resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Resolved {
    Module(usize),
    Library(LibraryId),
    Dangling(Destination),
}

#[derive(Debug, Clone)]
struct ResolvedDep {
    to: Resolved,
    scope: DependencyScope,
    exported: bool,
}

/// Whether a declared edge of `scope` is visible from the `variant` of its module.
pub fn visible_from(scope: DependencyScope, variant: Variant) -> bool {
    match variant {
        Variant::Production => scope != DependencyScope::Test,
        Variant::Test => true,
    }
}

/// The immutable dependency graph of one project model snapshot.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    modules: Vec<ModuleNode>,
    libraries: Vec<LibraryNode>,
    targets: Vec<TargetNode>,
    dependents: Vec<Vec<(TargetId, DependencyScope)>>,
    library_dependents: Vec<Vec<(TargetId, DependencyScope)>>,
    chunks: Vec<Chunk>,
    target_index: HashMap<BuildTarget, TargetId>,
    module_index: HashMap<String, usize>,
    library_index: HashMap<String, LibraryId>,
}

impl DependencyGraph {
    /// Build the graph for `model`.
    ///
    /// # Algorithm
    /// 1. Allocate a production target per module and a test target per
    ///    module with test roots.
    /// 2. Resolve declared dependencies by name; unknown names become
    ///    dangling references (logged, never fatal). Self-edges are dropped.
    /// 3. Compute, per module, the closure of its exported dependencies
    ///    (bounded by `engine.export_depth`).
    /// 4. Lift module edges to target edges, materializing re-exports.
    /// 5. Group modules into strongly connected components, per variant:
    ///    production over production-visible edges, test over all edges.
    ///    Order the resulting chunks dependencies-first, ties by declaration
    ///    order.
    pub fn build(model: &ProjectModel) -> Self {
        let mut graph = Self {
            modules: Vec::with_capacity(model.modules.len()),
            libraries: Vec::with_capacity(model.libraries.len()),
            targets: Vec::new(),
            dependents: Vec::new(),
            library_dependents: Vec::new(),
            chunks: Vec::new(),
            target_index: HashMap::new(),
            module_index: HashMap::new(),
            library_index: HashMap::new(),
        };

        // 1. Arena allocation.
        for (idx, decl) in model.modules.iter().enumerate() {
            let production = graph.push_target(BuildTarget::production(&decl.name), idx);
            let test = decl
                .has_tests()
                .then(|| graph.push_target(BuildTarget::test(&decl.name), idx));
            graph.module_index.insert(decl.name.clone(), idx);
            graph.modules.push(ModuleNode {
                name: decl.name.clone(),
                source_roots: decl.source_roots.clone(),
                test_roots: decl.test_roots.clone(),
                production,
                test,
            });
        }
        for (idx, decl) in model.libraries.iter().enumerate() {
            graph.library_index.insert(decl.name.clone(), LibraryId(idx));
            graph.libraries.push(LibraryNode {
                name: decl.name.clone(),
                roots: decl.roots.clone(),
            });
        }

        // 2. Name resolution.
        let resolved: Vec<Vec<ResolvedDep>> = model
            .modules
            .iter()
            .enumerate()
            .map(|(idx, decl)| {
                decl.dependencies
                    .iter()
                    .filter_map(|dep| {
                        let to = graph.resolve(&decl.name, idx, &dep.destination)?;
                        Some(ResolvedDep {
                            to,
                            scope: dep.scope,
                            exported: dep.exported,
                        })
                    })
                    .collect()
            })
            .collect();

        // 3. Export closures.
        let exports: Vec<Vec<(Resolved, DependencyScope)>> = (0..resolved.len())
            .map(|idx| export_closure(&resolved, idx, model.engine.export_depth))
            .collect();

        // 4. Edge lifting.
        for (module_idx, deps) in resolved.iter().enumerate() {
            for variant in Variant::ALL {
                let Some(target) = graph
                    .modules
                    .get(module_idx)
                    .and_then(|m| m.target(variant))
                else {
                    continue;
                };
                graph.lift_edges(target, module_idx, variant, deps, &exports);
            }
        }
        graph.index_dependents();

        // 5. Chunks.
        graph.compute_chunks(&resolved);

        tracing::debug!(
            modules = graph.modules.len(),
            libraries = graph.libraries.len(),
            targets = graph.targets.len(),
            chunks = graph.chunks.len(),
            "built dependency graph"
        );
        graph
    }

    fn push_target(&mut self, target: BuildTarget, module: usize) -> TargetId {
        let id = TargetId(self.targets.len());
        self.target_index.insert(target.clone(), id);
        self.targets.push(TargetNode {
            target,
            module,
            edges: Vec::new(),
            dangling: Vec::new(),
            chunk: ChunkId(0),
        });
        id
    }

    fn resolve(&self, owner: &str, owner_idx: usize, destination: &Destination) -> Option<Resolved> {
        let resolved = match destination {
            Destination::Module(name) => self.module_index.get(name).copied().map(Resolved::Module),
            Destination::Library(name) => {
                self.library_index.get(name).copied().map(Resolved::Library)
            }
        };
        match resolved {
            Some(Resolved::Module(idx)) if idx == owner_idx => {
                tracing::debug!(module = owner, "dropping self-dependency");
                None
            }
            Some(found) => Some(found),
            None => {
                tracing::warn!(
                    module = owner,
                    "model inconsistency: {destination} is not declared; dependents stay dirty until it is"
                );
                Some(Resolved::Dangling(destination.clone()))
            }
        }
    }

    fn lift_edges(
        &mut self,
        target: TargetId,
        module_idx: usize,
        variant: Variant,
        deps: &[ResolvedDep],
        exports: &[Vec<(Resolved, DependencyScope)>],
    ) {
        let mut edges: Vec<Edge> = Vec::new();
        let mut dangling: Vec<Destination> = Vec::new();
        let mut seen: HashSet<Node> = HashSet::new();

        if variant == Variant::Test {
            if let Some(module) = self.modules.get(module_idx) {
                seen.insert(Node::Target(module.production));
                edges.push(Edge {
                    to: Node::Target(module.production),
                    scope: DependencyScope::Compile,
                    origin: EdgeOrigin::OwnProduction,
                });
            }
        }

        let visible: Vec<&ResolvedDep> = deps
            .iter()
            .filter(|dep| visible_from(dep.scope, variant))
            .collect();

        // Declared edges first so they win over inherited duplicates.
        for dep in &visible {
            self.push_lifted(
                target,
                &dep.to,
                dep.scope,
                EdgeOrigin::Declared,
                &mut edges,
                &mut dangling,
                &mut seen,
            );
        }
        for dep in &visible {
            let Resolved::Module(through) = dep.to else {
                continue;
            };
            for (inherited, exported_scope) in exports.get(through).map_or(&[][..], Vec::as_slice) {
                let scope = if dep.scope == DependencyScope::Test {
                    DependencyScope::Test
                } else {
                    *exported_scope
                };
                self.push_lifted(
                    target,
                    inherited,
                    scope,
                    EdgeOrigin::Exported { through },
                    &mut edges,
                    &mut dangling,
                    &mut seen,
                );
            }
        }

        if let Some(node) = self.targets.get_mut(target.0) {
            node.edges = edges;
            node.dangling = dangling;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_lifted(
        &self,
        from: TargetId,
        to: &Resolved,
        scope: DependencyScope,
        origin: EdgeOrigin,
        edges: &mut Vec<Edge>,
        dangling: &mut Vec<Destination>,
        seen: &mut HashSet<Node>,
    ) {
        let node = match to {
            Resolved::Module(idx) => match self.modules.get(*idx) {
                Some(module) => Node::Target(module.production),
                None => return,
            },
            Resolved::Library(lib) => Node::Library(*lib),
            Resolved::Dangling(destination) => {
                if !dangling.contains(destination) {
                    dangling.push(destination.clone());
                }
                return;
            }
        };
        if node == Node::Target(from) || !seen.insert(node) {
            return;
        }
        edges.push(Edge {
            to: node,
            scope,
            origin,
        });
    }

    fn index_dependents(&mut self) {
        self.dependents = vec![Vec::new(); self.targets.len()];
        self.library_dependents = vec![Vec::new(); self.libraries.len()];
        for (idx, node) in self.targets.iter().enumerate() {
            for edge in &node.edges {
                let bucket = match edge.to {
                    Node::Target(to) => self.dependents.get_mut(to.0),
                    Node::Library(lib) => self.library_dependents.get_mut(lib.0),
                };
                if let Some(bucket) = bucket {
                    bucket.push((TargetId(idx), edge.scope));
                }
            }
        }
    }

    fn compute_chunks(&mut self, resolved: &[Vec<ResolvedDep>]) {
        // Production chunks come from production-visible edges only, so a
        // cycle closed by a test-scope edge never joins production targets.
        // Test chunks group modules that are cyclic at any scope.
        let mut candidates: Vec<(usize, Variant, Vec<TargetId>)> = Vec::new();
        for variant in Variant::ALL {
            for members in module_components(resolved, variant) {
                let Some(&first) = members.first() else {
                    continue;
                };
                let targets: Vec<TargetId> = members
                    .iter()
                    .filter_map(|&m| self.modules.get(m).and_then(|module| module.target(variant)))
                    .collect();
                if targets.is_empty() {
                    continue;
                }
                if targets.len() > 1 {
                    tracing::debug!(
                        %variant,
                        members = ?members
                            .iter()
                            .filter_map(|&m| self.modules.get(m).map(|n| n.name.as_str()))
                            .collect::<Vec<_>>(),
                        "cyclic modules collapsed into one chunk"
                    );
                }
                candidates.push((first, variant, targets));
            }
        }

        let mut candidate_of: HashMap<TargetId, usize> = HashMap::new();
        for (idx, (_, _, targets)) in candidates.iter().enumerate() {
            for &t in targets {
                candidate_of.insert(t, idx);
            }
        }

        // Kahn's algorithm over the candidate chunks. The ready set is keyed
        // by first declared member, then variant, so independent chunks keep
        // declaration order and a production chunk precedes its test chunk.
        let mut required_by: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); candidates.len()];
        let mut pending: Vec<usize> = vec![0; candidates.len()];
        for (idx, (_, _, targets)) in candidates.iter().enumerate() {
            let requires: BTreeSet<usize> = targets
                .iter()
                .flat_map(|&t| self.edges(t))
                .filter_map(|edge| match edge.to {
                    Node::Target(to) => candidate_of.get(&to).copied(),
                    Node::Library(_) => None,
                })
                .filter(|&dep| dep != idx)
                .collect();
            for &dep in &requires {
                if let Some(set) = required_by.get_mut(dep) {
                    set.insert(idx);
                }
            }
            if let Some(count) = pending.get_mut(idx) {
                *count = requires.len();
            }
        }
        let key = |idx: usize| candidates.get(idx).map(|(first, variant, _)| (*first, *variant, idx));
        let mut ready: BTreeSet<(usize, Variant, usize)> = pending
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .filter_map(|(idx, _)| key(idx))
            .collect();
        let mut order: Vec<usize> = Vec::with_capacity(candidates.len());
        while let Some((_, _, idx)) = ready.pop_first() {
            order.push(idx);
            for &next in required_by.get(idx).into_iter().flatten() {
                if let Some(count) = pending.get_mut(next) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.extend(key(next));
                    }
                }
            }
        }
        if order.len() < candidates.len() {
            // Unreachable for a well-formed graph; keep every target chunked.
            let placed: HashSet<usize> = order.iter().copied().collect();
            order.extend((0..candidates.len()).filter(|idx| !placed.contains(idx)));
        }

        for idx in order {
            let Some((_, variant, targets)) = candidates.get_mut(idx) else {
                continue;
            };
            let id = ChunkId(self.chunks.len());
            for target in targets.iter() {
                if let Some(node) = self.targets.get_mut(target.0) {
                    node.chunk = id;
                }
            }
            self.chunks.push(Chunk {
                id,
                variant: *variant,
                targets: std::mem::take(targets),
            });
        }
    }

    pub fn modules(&self) -> &[ModuleNode] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&ModuleNode> {
        self.module_index
            .get(name)
            .and_then(|&idx| self.modules.get(idx))
    }

    pub fn module_at(&self, idx: usize) -> Option<&ModuleNode> {
        self.modules.get(idx)
    }

    pub fn libraries(&self) -> &[LibraryNode] {
        &self.libraries
    }

    pub fn library_id(&self, name: &str) -> Option<LibraryId> {
        self.library_index.get(name).copied()
    }

    pub fn library(&self, id: LibraryId) -> Option<&LibraryNode> {
        self.libraries.get(id.0)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// All target ids in allocation order.
    pub fn target_ids(&self) -> impl Iterator<Item = TargetId> + '_ {
        (0..self.targets.len()).map(TargetId)
    }

    pub fn target(&self, id: TargetId) -> Option<&TargetNode> {
        self.targets.get(id.0)
    }

    pub fn target_id(&self, target: &BuildTarget) -> Option<TargetId> {
        self.target_index.get(target).copied()
    }

    pub fn build_target(&self, id: TargetId) -> Option<&BuildTarget> {
        self.targets.get(id.0).map(|node| &node.target)
    }

    pub fn edges(&self, id: TargetId) -> &[Edge] {
        self.targets.get(id.0).map_or(&[], |node| &node.edges)
    }

    pub fn dangling(&self, id: TargetId) -> &[Destination] {
        self.targets.get(id.0).map_or(&[], |node| &node.dangling)
    }

    /// Targets with an edge to `id`, with that edge's scope.
    pub fn dependents(&self, id: TargetId) -> &[(TargetId, DependencyScope)] {
        self.dependents.get(id.0).map_or(&[], Vec::as_slice)
    }

    /// Targets with a direct (declared or inherited) edge to the library.
    pub fn library_dependents(&self, id: LibraryId) -> &[(TargetId, DependencyScope)] {
        self.library_dependents.get(id.0).map_or(&[], Vec::as_slice)
    }

    /// Chunks in build order: every chunk comes after the chunks it depends on.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id.0)
    }

    pub fn chunk_of(&self, id: TargetId) -> Option<ChunkId> {
        self.targets.get(id.0).map(|node| node.chunk)
    }

    /// Chunks that `id` has at least one target edge into.
    pub fn chunk_dependencies(&self, id: ChunkId) -> BTreeSet<ChunkId> {
        let Some(chunk) = self.chunks.get(id.0) else {
            return BTreeSet::new();
        };
        chunk
            .targets
            .iter()
            .flat_map(|&t| self.edges(t))
            .filter_map(|edge| match edge.to {
                Node::Target(to) => self.chunk_of(to),
                Node::Library(_) => None,
            })
            .filter(|&dep| dep != id)
            .collect()
    }

    /// Group chunks into levels: every chunk's dependencies sit in earlier
    /// levels, so chunks within a level can be built in parallel.
    pub fn parallel_levels(&self) -> Vec<Vec<ChunkId>> {
        let mut level_of: Vec<usize> = vec![0; self.chunks.len()];
        let mut levels: Vec<Vec<ChunkId>> = Vec::new();
        for chunk in &self.chunks {
            let level = self
                .chunk_dependencies(chunk.id)
                .iter()
                .filter_map(|dep| level_of.get(dep.0))
                .map(|l| l.saturating_add(1))
                .max()
                .unwrap_or(0);
            if let Some(slot) = level_of.get_mut(chunk.id.0) {
                *slot = level;
            }
            if levels.len() <= level {
                levels.resize_with(level.saturating_add(1), Vec::new);
            }
            if let Some(bucket) = levels.get_mut(level) {
                bucket.push(chunk.id);
            }
        }
        levels
    }

    /// Every target reachable from `roots` by following edges toward
    /// dependencies, including the roots themselves.
    pub fn transitive_dependencies(&self, roots: &BTreeSet<TargetId>) -> BTreeSet<TargetId> {
        let mut seen: BTreeSet<TargetId> = roots.clone();
        let mut queue: VecDeque<TargetId> = roots.iter().copied().collect();
        while let Some(current) = queue.pop_front() {
            for edge in self.edges(current) {
                if let Node::Target(to) = edge.to {
                    if seen.insert(to) {
                        queue.push_back(to);
                    }
                }
            }
        }
        seen
    }
}

/// Strongly connected sets of modules over the module edges visible from
/// `variant`. Members are sorted by declaration index.
fn module_components(resolved: &[Vec<ResolvedDep>], variant: Variant) -> Vec<Vec<usize>> {
    let mut module_graph: DiGraph<usize, ()> = DiGraph::with_capacity(resolved.len(), 0);
    let nodes: Vec<NodeIndex> = (0..resolved.len())
        .map(|idx| module_graph.add_node(idx))
        .collect();
    for (from, deps) in resolved.iter().enumerate() {
        for dep in deps {
            let Resolved::Module(to) = dep.to else {
                continue;
            };
            if !visible_from(dep.scope, variant) {
                continue;
            }
            if let (Some(&a), Some(&b)) = (nodes.get(from), nodes.get(to)) {
                module_graph.update_edge(a, b, ());
            }
        }
    }
    petgraph::algo::tarjan_scc(&module_graph)
        .into_iter()
        .map(|scc| {
            let mut members: Vec<usize> = scc
                .into_iter()
                .filter_map(|n| module_graph.node_weight(n).copied())
                .collect();
            members.sort_unstable();
            members
        })
        .collect()
}

/// Breadth-first walk over exported, production-visible edges starting at
/// `start`. `limit` bounds the number of exported links followed.
fn export_closure(
    resolved: &[Vec<ResolvedDep>],
    start: usize,
    limit: Option<usize>,
) -> Vec<(Resolved, DependencyScope)> {
    let mut result: Vec<(Resolved, DependencyScope)> = Vec::new();
    let mut collected: HashSet<Resolved> = HashSet::new();
    let mut visited: HashSet<usize> = HashSet::from([start]);
    let mut queue: VecDeque<(usize, usize)> = VecDeque::from([(start, 0)]);

    while let Some((module, depth)) = queue.pop_front() {
        if limit.is_some_and(|max| depth >= max) {
            continue;
        }
        for dep in resolved.get(module).into_iter().flatten() {
            if !dep.exported || dep.scope == DependencyScope::Test {
                continue;
            }
            if collected.insert(dep.to.clone()) {
                result.push((dep.to.clone(), dep.scope));
            }
            if let Resolved::Module(next) = dep.to {
                if visited.insert(next) {
                    queue.push_back((next, depth.saturating_add(1)));
                }
            }
        }
    }
    result
}
