//! Dependency graph, dirty propagation and build state for dirtmark.
//!
//! One build request flows through the modules in order: [`graph`] is
//! built from the project model, [`classify`] turns changes into seeds,
//! [`propagate`] computes the dirty set, [`scope`] turns it into an ordered
//! work list, and [`execute`] drives an external executor, recording
//! successes in [`state`]. [`session`] ties them together.

pub mod classify;
pub mod error;
pub mod execute;
pub mod graph;
pub mod propagate;
pub mod scope;
pub mod session;
pub mod signature;
pub mod state;

pub use classify::{Change, ChangeSet, Classifier, Seed, SeedReason};
pub use error::EngineError;
pub use execute::{execute, BuildExecutor, ExecutionSummary, TargetReport};
pub use graph::{Chunk, ChunkId, DependencyGraph, Edge, EdgeOrigin, LibraryId, Node, TargetId};
pub use propagate::{propagate, CancelFlag, DirtyReason, DirtySet};
pub use scope::{resolve, RequestedScope, WorkChunk, WorkList};
pub use session::{ManifestSource, Plan, ProjectModelSource, Session, StaticModel};
pub use signature::{FsSignatures, Signature, SignatureSource};
pub use state::{FileStateStore, MemoryStateStore, StateStore, TargetState};
