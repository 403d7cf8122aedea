//! Content signatures of build targets.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::graph::{DependencyGraph, LibraryNode, Node, TargetId};

/// Hex digest summarizing everything a target's compilation reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where current signatures come from.
pub trait SignatureSource: Send + Sync {
    /// Current signature of `target`.
    ///
    /// # Errors
    /// Returns an error if the target's inputs cannot be read.
    fn signature(&self, graph: &DependencyGraph, target: TargetId)
        -> Result<Signature, EngineError>;

    /// Whether every root of the library exists.
    fn library_available(&self, library: &LibraryNode) -> bool;
}

/// Signatures computed from the files on disk.
#[derive(Debug, Clone)]
pub struct FsSignatures {
    project_root: PathBuf,
    pattern: String,
}

impl FsSignatures {
    /// Hash every file under each root.
    pub fn new(project_root: &Path) -> Self {
        Self::with_pattern(project_root, "**/*")
    }

    /// Hash only files matching `pattern` (relative glob) under each root.
    pub fn with_pattern(project_root: &Path, pattern: &str) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            pattern: pattern.to_owned(),
        }
    }

    fn absolute(&self, root: &Path) -> PathBuf {
        self.project_root.join(root)
    }
}

impl SignatureSource for FsSignatures {
    fn signature(
        &self,
        graph: &DependencyGraph,
        target: TargetId,
    ) -> Result<Signature, EngineError> {
        let Some(node) = graph.target(target) else {
            return Err(EngineError::UnknownTarget {
                target: format!("#{}", target.index()),
            });
        };
        let mut parts: Vec<String> = vec![format!("variant:{}", node.target.variant)];

        if let Some(module) = graph.module_at(node.module) {
            for root in module.roots(node.target.variant) {
                let abs = self.absolute(root);
                let digest = if abs.exists() {
                    dirtmark_util::hash::sha256_tree(&abs, &self.pattern)?
                } else {
                    "missing".to_owned()
                };
                parts.push(format!("root:{}:{digest}", root.display()));
            }
        }

        for edge in graph.edges(target) {
            match edge.to {
                Node::Target(to) => {
                    if let Some(dep) = graph.build_target(to) {
                        parts.push(format!("edge:{dep}:{}", edge.scope));
                    }
                }
                Node::Library(lib) => {
                    let Some(library) = graph.library(lib) else {
                        continue;
                    };
                    parts.push(format!("library:{}:{}", library.name, edge.scope));
                    for root in &library.roots {
                        let stamp = dirtmark_util::hash::file_stamp(&self.absolute(root))
                            .unwrap_or_else(|| format!("{}|missing", root.display()));
                        parts.push(format!("stamp:{stamp}"));
                    }
                }
            }
        }

        for destination in graph.dangling(target) {
            parts.push(format!("dangling:{destination}"));
        }

        Ok(Signature(dirtmark_util::hash::sha256_multi(&parts)))
    }

    fn library_available(&self, library: &LibraryNode) -> bool {
        library
            .roots
            .iter()
            .all(|root| self.absolute(root).exists())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;
    use crate::testing::{lib, ModelBuilder};
    use dirtmark_config::DependencyScope;

    fn setup() -> (tempfile::TempDir, DependencyGraph) {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a/src")).unwrap();
        fs::create_dir_all(tmp.path().join("a/test")).unwrap();
        fs::create_dir_all(tmp.path().join("libs")).unwrap();
        fs::write(tmp.path().join("a/src/Main.kt"), "fun main() {}").unwrap();
        fs::write(tmp.path().join("libs/l.jar"), "jar-v1").unwrap();
        let graph = ModelBuilder::new()
            .library("l")
            .module("a")
            .tests("a")
            .dep("a", lib("l"), DependencyScope::Compile, false)
            .graph();
        (tmp, graph)
    }

    fn sig(tmp: &tempfile::TempDir, graph: &DependencyGraph, target: &str) -> Signature {
        let id = graph.target_id(&target.parse().unwrap()).unwrap();
        FsSignatures::new(tmp.path()).signature(graph, id).unwrap()
    }

    #[test]
    fn signature_is_stable() {
        let (tmp, graph) = setup();
        assert_eq!(sig(&tmp, &graph, "a"), sig(&tmp, &graph, "a"));
    }

    #[test]
    fn variants_differ() {
        let (tmp, graph) = setup();
        assert_ne!(sig(&tmp, &graph, "a"), sig(&tmp, &graph, "a:test"));
    }

    #[test]
    fn source_edit_changes_only_owning_variant() {
        let (tmp, graph) = setup();
        let prod = sig(&tmp, &graph, "a");
        let test = sig(&tmp, &graph, "a:test");
        fs::write(tmp.path().join("a/src/Main.kt"), "fun main() { println() }").unwrap();
        assert_ne!(prod, sig(&tmp, &graph, "a"));
        assert_eq!(test, sig(&tmp, &graph, "a:test"));
    }

    #[test]
    fn library_replacement_changes_signature() {
        let (tmp, graph) = setup();
        let before = sig(&tmp, &graph, "a");
        fs::write(tmp.path().join("libs/l.jar"), "jar-version-two").unwrap();
        assert_ne!(before, sig(&tmp, &graph, "a"));
    }

    #[test]
    fn missing_root_is_not_an_error() {
        let (tmp, graph) = setup();
        fs::remove_dir_all(tmp.path().join("a/src")).unwrap();
        let _ = sig(&tmp, &graph, "a");
    }

    #[test]
    fn library_availability_follows_roots() {
        let (tmp, graph) = setup();
        let source = FsSignatures::new(tmp.path());
        let library = graph.library(graph.library_id("l").unwrap()).unwrap();
        assert!(source.library_available(library));
        fs::remove_file(tmp.path().join("libs/l.jar")).unwrap();
        assert!(!source.library_available(library));
    }
}
