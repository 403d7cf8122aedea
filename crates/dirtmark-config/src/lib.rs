//! Parse and validate `dirtmark.toml`: the project model and engine settings.

pub mod manifest;

pub use manifest::{
    ConfigError, Dependency, DependencyScope, Destination, EngineSettings, LibraryDecl,
    ModuleDecl, ProjectModel, MANIFEST_FILE,
};
