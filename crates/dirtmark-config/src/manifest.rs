use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// File name of the project model, looked up in the project root.
pub const MANIFEST_FILE: &str = "dirtmark.toml";

/// The `dirtmark.toml` project model: modules, libraries and engine settings.
///
/// Declaration order of modules is significant: it breaks ties when ordering
/// independent chunks, so the same model always yields the same work list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectModel {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default, rename = "module")]
    pub modules: Vec<ModuleDecl>,
    #[serde(default, rename = "library")]
    pub libraries: Vec<LibraryDecl>,
}

/// The `[engine]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Maximum number of exported links a re-export is followed through.
    /// `None` follows exported chains until they end.
    #[serde(default)]
    pub export_depth: Option<usize>,
    /// Where per-target build state is persisted, relative to the project root.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".dirtmark").join("state")
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            export_depth: None,
            state_dir: default_state_dir(),
        }
    }
}

/// A `[[module]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDecl {
    pub name: String,
    #[serde(default)]
    pub source_roots: Vec<PathBuf>,
    /// A module has a test variant only if it declares test roots.
    #[serde(default)]
    pub test_roots: Vec<PathBuf>,
    #[serde(default, rename = "dependency")]
    pub dependencies: Vec<Dependency>,
}

impl ModuleDecl {
    pub fn has_tests(&self) -> bool {
        !self.test_roots.is_empty()
    }
}

/// A `[[library]]` table: a named set of binary roots.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LibraryDecl {
    pub name: String,
    #[serde(default)]
    pub roots: Vec<PathBuf>,
}

/// Visibility class of a declared dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyScope {
    #[default]
    Compile,
    Runtime,
    Test,
    Provided,
}

impl DependencyScope {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyScope::Compile => "compile",
            DependencyScope::Runtime => "runtime",
            DependencyScope::Test => "test",
            DependencyScope::Provided => "provided",
        }
    }
}

impl fmt::Display for DependencyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a dependency points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Module(String),
    Library(String),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Module(name) => write!(f, "module `{name}`"),
            Destination::Library(name) => write!(f, "library `{name}`"),
        }
    }
}

/// A `[[module.dependency]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawDependency")]
pub struct Dependency {
    pub destination: Destination,
    pub scope: DependencyScope,
    pub exported: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDependency {
    module: Option<String>,
    library: Option<String>,
    #[serde(default)]
    scope: DependencyScope,
    #[serde(default)]
    exported: bool,
}

impl TryFrom<RawDependency> for Dependency {
    type Error = String;

    fn try_from(raw: RawDependency) -> Result<Self, Self::Error> {
        let destination = match (raw.module, raw.library) {
            (Some(module), None) => Destination::Module(module),
            (None, Some(library)) => Destination::Library(library),
            (Some(_), Some(_)) => {
                return Err("a dependency names both `module` and `library`".to_owned())
            }
            (None, None) => {
                return Err("a dependency must name either `module` or `library`".to_owned())
            }
        };
        Ok(Self {
            destination,
            scope: raw.scope,
            exported: raw.exported,
        })
    }
}

impl ProjectModel {
    /// Read, parse and validate a `dirtmark.toml`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// declares duplicate or malformed names.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parse and validate model text. `origin` names the source in errors.
    ///
    /// # Errors
    /// Returns an error if the text is not valid TOML or fails validation.
    pub fn parse(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let model: ProjectModel = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_owned(),
            source: e,
        })?;
        model.validate()?;
        Ok(model)
    }

    /// Check name uniqueness and well-formedness.
    ///
    /// Dependencies on names that are not declared are allowed here; the
    /// dependency graph treats them as dangling references.
    ///
    /// # Errors
    /// Returns the first duplicate or malformed name found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for module in &self.modules {
            check_name("module", &module.name)?;
            if !seen.insert(module.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "module",
                    name: module.name.clone(),
                });
            }
        }
        let mut seen = HashSet::new();
        for library in &self.libraries {
            check_name("library", &library.name)?;
            if !seen.insert(library.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "library",
                    name: library.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn module(&self, name: &str) -> Option<&ModuleDecl> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn library(&self, name: &str) -> Option<&LibraryDecl> {
        self.libraries.iter().find(|l| l.name == name)
    }

    /// Declare a module with the given production root.
    pub fn add_module(&mut self, name: &str, source_root: impl Into<PathBuf>) {
        self.modules.push(ModuleDecl {
            name: name.to_owned(),
            source_roots: vec![source_root.into()],
            test_roots: Vec::new(),
            dependencies: Vec::new(),
        });
    }

    /// Add a test root to an already declared module. Returns `false` if
    /// the module is unknown.
    pub fn add_test_root(&mut self, module: &str, root: impl Into<PathBuf>) -> bool {
        match self.modules.iter_mut().find(|m| m.name == module) {
            Some(decl) => {
                decl.test_roots.push(root.into());
                true
            }
            None => false,
        }
    }

    /// Declare a library with a single binary root.
    pub fn add_library(&mut self, name: &str, root: impl Into<PathBuf>) {
        self.libraries.push(LibraryDecl {
            name: name.to_owned(),
            roots: vec![root.into()],
        });
    }

    /// Add a dependency edge from `module`. Returns `false` if the module is
    /// unknown.
    pub fn add_dependency(
        &mut self,
        module: &str,
        destination: Destination,
        scope: DependencyScope,
        exported: bool,
    ) -> bool {
        match self.modules.iter_mut().find(|m| m.name == module) {
            Some(decl) => {
                decl.dependencies.push(Dependency {
                    destination,
                    scope,
                    exported,
                });
                true
            }
            None => false,
        }
    }
}

fn check_name(kind: &'static str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.contains(':') {
        return Err(ConfigError::InvalidName {
            kind,
            name: name.to_owned(),
        });
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid dirtmark.toml at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("{kind} `{name}` is declared more than once")]
    Duplicate { kind: &'static str, name: String },
    #[error("invalid {kind} name \"{name}\": names must be non-empty and must not contain `:`")]
    InvalidName { kind: &'static str, name: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = r#"
[engine]
export_depth = 2

[[module]]
name = "a"
source_roots = ["moduleA/src"]
test_roots = ["moduleA/testSrc"]

[[module.dependency]]
module = "b"
scope = "test"

[[module.dependency]]
library = "util"
exported = true

[[module]]
name = "b"
source_roots = ["moduleB/src"]

[[library]]
name = "util"
roots = ["moduleA/lib/util.jar"]
"#;

    #[test]
    fn parse_full_model() {
        let model = ProjectModel::parse(SAMPLE, "sample").unwrap();
        assert_eq!(model.engine.export_depth, Some(2));
        assert_eq!(model.modules.len(), 2);
        assert_eq!(model.libraries.len(), 1);

        let a = model.module("a").unwrap();
        assert!(a.has_tests());
        assert_eq!(a.dependencies.len(), 2);
        let first = a.dependencies.first().unwrap();
        assert_eq!(first.destination, Destination::Module("b".to_owned()));
        assert_eq!(first.scope, DependencyScope::Test);
        assert!(!first.exported);
        let second = a.dependencies.get(1).unwrap();
        assert_eq!(second.destination, Destination::Library("util".to_owned()));
        assert_eq!(second.scope, DependencyScope::Compile);
        assert!(second.exported);

        assert!(!model.module("b").unwrap().has_tests());
    }

    #[test]
    fn defaults_when_engine_table_absent() {
        let model = ProjectModel::parse("[[module]]\nname = \"a\"\n", "inline").unwrap();
        assert_eq!(model.engine, EngineSettings::default());
        assert_eq!(model.engine.state_dir, PathBuf::from(".dirtmark/state"));
    }

    #[test]
    fn preserves_declaration_order() {
        let text = "[[module]]\nname = \"z\"\n[[module]]\nname = \"a\"\n[[module]]\nname = \"m\"\n";
        let model = ProjectModel::parse(text, "inline").unwrap();
        let names: Vec<_> = model.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["z", "a", "m"]);
    }

    #[test]
    fn rejects_dependency_with_both_destinations() {
        let text = "[[module]]\nname = \"a\"\n[[module.dependency]]\nmodule = \"b\"\nlibrary = \"c\"\n";
        let err = ProjectModel::parse(text, "inline").unwrap_err().to_string();
        assert!(err.contains("both"), "error was: {err}");
    }

    #[test]
    fn rejects_dependency_without_destination() {
        let text = "[[module]]\nname = \"a\"\n[[module.dependency]]\nscope = \"test\"\n";
        assert!(ProjectModel::parse(text, "inline").is_err());
    }

    #[test]
    fn rejects_unknown_scope() {
        let text = "[[module]]\nname = \"a\"\n[[module.dependency]]\nmodule = \"b\"\nscope = \"system\"\n";
        assert!(ProjectModel::parse(text, "inline").is_err());
    }

    #[test]
    fn rejects_duplicate_module() {
        let text = "[[module]]\nname = \"a\"\n[[module]]\nname = \"a\"\n";
        let err = ProjectModel::parse(text, "inline").unwrap_err().to_string();
        assert!(err.contains("more than once"), "error was: {err}");
    }

    #[test]
    fn rejects_name_with_colon() {
        let text = "[[library]]\nname = \"a:test\"\n";
        let err = ProjectModel::parse(text, "inline").unwrap_err().to_string();
        assert!(err.contains("a:test"), "error was: {err}");
    }

    #[test]
    fn dangling_dependency_is_not_a_config_error() {
        let text = "[[module]]\nname = \"a\"\n[[module.dependency]]\nmodule = \"ghost\"\n";
        let model = ProjectModel::parse(text, "inline").unwrap();
        assert!(model.module("ghost").is_none());
    }

    #[test]
    fn from_path_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(MANIFEST_FILE);
        std::fs::write(&path, SAMPLE).unwrap();
        let model = ProjectModel::from_path(&path).unwrap();
        assert_eq!(model.modules.len(), 2);
    }

    #[test]
    fn from_path_missing_file_names_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(MANIFEST_FILE);
        let err = ProjectModel::from_path(&path).unwrap_err().to_string();
        assert!(err.contains("dirtmark.toml"), "error was: {err}");
    }

    #[test]
    fn builder_helpers_mutate_declared_modules() {
        let mut model = ProjectModel::default();
        model.add_module("a", "a/src");
        assert!(model.add_test_root("a", "a/testSrc"));
        model.add_library("l", "lib/l.jar");
        assert!(model.add_dependency(
            "a",
            Destination::Library("l".to_owned()),
            DependencyScope::Test,
            false
        ));
        assert!(!model.add_dependency(
            "missing",
            Destination::Library("l".to_owned()),
            DependencyScope::Compile,
            false
        ));
        assert!(model.module("a").unwrap().has_tests());
        assert!(model.validate().is_ok());
    }

    proptest! {
        #[test]
        fn parse_never_panics(text in "\\PC{0,200}") {
            let _ = ProjectModel::parse(&text, "fuzz");
        }
    }
}
