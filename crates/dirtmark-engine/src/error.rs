//! Error types for dirtmark-engine.

/// Errors produced by engine operations.
///
/// Model inconsistencies, cycles, corrupted state and cancellation are not
/// errors: the engine logs them and rebuilds more. What remains here are
/// failures the caller has to act on.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A utility operation failed.
    #[error("{0}")]
    Util(#[from] dirtmark_util::error::UtilError),

    /// The project model could not be loaded.
    #[error("{0}")]
    Config(#[from] dirtmark_config::ConfigError),

    /// A requested target is not part of the current graph.
    #[error("unknown target `{target}`")]
    UnknownTarget { target: String },

    /// A change names a module or library that is not declared.
    #[error("unknown {kind} `{name}`")]
    UnknownName { kind: &'static str, name: String },

    /// A persisted state record could not be encoded.
    #[error("cannot encode build state for {target}: {source}")]
    StateEncode {
        target: String,
        source: serde_json::Error,
    },
}
