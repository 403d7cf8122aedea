//! A long-lived engine session over one project.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use dirtmark_config::{EngineSettings, ProjectModel, MANIFEST_FILE};

use crate::classify::{ChangeSet, Classifier, Seed};
use crate::error::EngineError;
use crate::execute::{execute, BuildExecutor, ExecutionSummary};
use crate::graph::DependencyGraph;
use crate::propagate::{propagate, CancelFlag, DirtySet};
use crate::scope::{resolve, RequestedScope, WorkList};
use crate::signature::{FsSignatures, SignatureSource};
use crate::state::{FileStateStore, StateStore};

/// Supplies the current project model.
pub trait ProjectModelSource: Send + Sync {
    /// # Errors
    /// Returns an error if the model cannot be read or is invalid.
    fn load(&self) -> Result<ProjectModel, EngineError>;

    /// Directory that relative roots are resolved against.
    fn project_root(&self) -> &Path;
}

/// Reads `dirtmark.toml` from a project directory.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    root: PathBuf,
}

impl ManifestSource {
    pub fn new(project_root: &Path) -> Self {
        Self {
            root: project_root.to_path_buf(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }
}

impl ProjectModelSource for ManifestSource {
    fn load(&self) -> Result<ProjectModel, EngineError> {
        Ok(ProjectModel::from_path(&self.manifest_path())?)
    }

    fn project_root(&self) -> &Path {
        &self.root
    }
}

/// A model held in memory; replaced wholesale to simulate edits.
#[derive(Debug)]
pub struct StaticModel {
    root: PathBuf,
    model: RwLock<ProjectModel>,
}

impl StaticModel {
    pub fn new(project_root: &Path, model: ProjectModel) -> Self {
        Self {
            root: project_root.to_path_buf(),
            model: RwLock::new(model),
        }
    }

    pub fn replace(&self, model: ProjectModel) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = model;
    }
}

impl ProjectModelSource for StaticModel {
    fn load(&self) -> Result<ProjectModel, EngineError> {
        let model = self
            .model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        model.validate()?;
        Ok(model)
    }

    fn project_root(&self) -> &Path {
        &self.root
    }
}

/// Everything computed for one build request.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The graph snapshot the plan refers to.
    pub graph: Arc<DependencyGraph>,
    pub seeds: Vec<Seed>,
    pub dirty: DirtySet,
    pub work: WorkList,
}

pub struct Session {
    source: Arc<dyn ProjectModelSource>,
    settings: EngineSettings,
    graph: Arc<DependencyGraph>,
    store: Arc<dyn StateStore>,
    signatures: Arc<dyn SignatureSource>,
    scan: bool,
}

impl Session {
    /// Load the model and open the on-disk store under
    /// `<project_root>/<engine.state_dir>`.
    ///
    /// # Errors
    /// Returns an error if the model cannot be loaded or the state directory
    /// cannot be created.
    pub fn open(source: Arc<dyn ProjectModelSource>) -> Result<Self, EngineError> {
        let model = source.load()?;
        let root = source.project_root();
        let store = FileStateStore::open(&root.join(&model.engine.state_dir))?;
        let signatures = FsSignatures::new(root);
        Self::from_model(source, model, Arc::new(store), Arc::new(signatures))
    }

    /// Assemble a session from explicit parts.
    ///
    /// # Errors
    /// Returns an error if the model cannot be loaded.
    pub fn with_parts(
        source: Arc<dyn ProjectModelSource>,
        store: Arc<dyn StateStore>,
        signatures: Arc<dyn SignatureSource>,
    ) -> Result<Self, EngineError> {
        let model = source.load()?;
        Self::from_model(source, model, store, signatures)
    }

    fn from_model(
        source: Arc<dyn ProjectModelSource>,
        model: ProjectModel,
        store: Arc<dyn StateStore>,
        signatures: Arc<dyn SignatureSource>,
    ) -> Result<Self, EngineError> {
        let graph = Arc::new(DependencyGraph::build(&model));
        let session = Self {
            source,
            settings: model.engine,
            graph,
            store,
            signatures,
            scan: false,
        };
        session.prune_store()?;
        Ok(session)
    }

    /// Compare every target's signature with the store on each plan.
    pub fn set_scan(&mut self, scan: bool) {
        self.scan = scan;
    }

    pub fn graph(&self) -> Arc<DependencyGraph> {
        Arc::clone(&self.graph)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn project_root(&self) -> &Path {
        self.source.project_root()
    }

    /// Reload the model and rebuild the graph.
    ///
    /// # Errors
    /// Returns an error if the model cannot be loaded.
    pub fn reload(&mut self) -> Result<(), EngineError> {
        let model = self.source.load()?;
        self.graph = Arc::new(DependencyGraph::build(&model));
        self.settings = model.engine;
        self.prune_store()
    }

    fn prune_store(&self) -> Result<(), EngineError> {
        let graph = Arc::clone(&self.graph);
        let dropped = self
            .store
            .prune(&|target| graph.target_id(target).is_some())?;
        if !dropped.is_empty() {
            tracing::debug!(?dropped, "dropped build state of removed targets");
        }
        Ok(())
    }

    /// Classify `changes`, propagate and resolve `scope`.
    ///
    /// Declaration changes reload the model first, so classification and
    /// propagation always see the current graph. Returns `Ok(None)` when
    /// cancelled during propagation.
    ///
    /// # Errors
    /// Returns an error if the model cannot be reloaded or `scope` names
    /// an unknown target.
    pub fn plan(
        &mut self,
        changes: &ChangeSet,
        scope: &RequestedScope,
        cancel: &CancelFlag,
    ) -> Result<Option<Plan>, EngineError> {
        if changes.has_declaration_changes() {
            tracing::debug!("dependency declarations changed, rebuilding graph");
            self.reload()?;
        }
        self.plan_current(changes, scope, cancel)
    }

    /// Like [`Session::plan`], but against the graph as last loaded, even
    /// when `changes` carries declaration changes.
    ///
    /// For callers that opened or reloaded the session after the
    /// declarations were edited. Changed declarations still seed their
    /// module's targets.
    ///
    /// # Errors
    /// Returns an error if `scope` names an unknown target.
    pub fn plan_current(
        &self,
        changes: &ChangeSet,
        scope: &RequestedScope,
        cancel: &CancelFlag,
    ) -> Result<Option<Plan>, EngineError> {
        let graph = Arc::clone(&self.graph);

        let seeds = Classifier::new(
            &graph,
            self.store.as_ref(),
            self.signatures.as_ref(),
            self.source.project_root(),
        )
        .scan(self.scan)
        .classify(changes);

        let Some(dirty) = propagate(&seeds, &graph, self.store.as_ref(), cancel) else {
            return Ok(None);
        };
        let work = resolve(&dirty, scope, &graph)?;

        tracing::info!(
            changes = changes.len(),
            seeds = seeds.len(),
            dirty = dirty.len(),
            chunks = work.chunks().len(),
            targets = work.target_count(),
            "planned build"
        );
        Ok(Some(Plan {
            graph,
            seeds,
            dirty,
            work,
        }))
    }

    /// Plan, then hand the work list to `executor`.
    ///
    /// # Errors
    /// Returns an error if planning fails or the store cannot be updated.
    pub fn build(
        &mut self,
        changes: &ChangeSet,
        scope: &RequestedScope,
        executor: &dyn BuildExecutor,
        cancel: &CancelFlag,
    ) -> Result<Option<(Plan, ExecutionSummary)>, EngineError> {
        let Some(plan) = self.plan(changes, scope, cancel)? else {
            return Ok(None);
        };
        self.run(plan, executor, cancel)
    }

    /// Like [`Session::build`], planning with [`Session::plan_current`].
    ///
    /// # Errors
    /// Returns an error if planning fails or the store cannot be updated.
    pub fn build_current(
        &self,
        changes: &ChangeSet,
        scope: &RequestedScope,
        executor: &dyn BuildExecutor,
        cancel: &CancelFlag,
    ) -> Result<Option<(Plan, ExecutionSummary)>, EngineError> {
        let Some(plan) = self.plan_current(changes, scope, cancel)? else {
            return Ok(None);
        };
        self.run(plan, executor, cancel)
    }

    fn run(
        &self,
        plan: Plan,
        executor: &dyn BuildExecutor,
        cancel: &CancelFlag,
    ) -> Result<Option<(Plan, ExecutionSummary)>, EngineError> {
        let summary = execute(
            &plan.work,
            &plan.graph,
            executor,
            self.store.as_ref(),
            self.signatures.as_ref(),
            cancel,
        )?;
        Ok(Some((plan, summary)))
    }
}
