//! Build target identities for dirtmark.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which half of a module a target compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Production,
    Test,
}

impl Variant {
    /// Both variants, production first.
    pub const ALL: [Variant; 2] = [Variant::Production, Variant::Test];

    /// Lowercase name used in target identities and environment variables.
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Production => "production",
            Variant::Test => "test",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The atomic unit of recompilation: one variant of one module.
///
/// Displayed as `module` for production and `module:test` for test. That
/// textual form is also the key under which build state is persisted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildTarget {
    pub module: String,
    pub variant: Variant,
}

impl BuildTarget {
    pub fn new(module: impl Into<String>, variant: Variant) -> Self {
        Self {
            module: module.into(),
            variant,
        }
    }

    pub fn production(module: impl Into<String>) -> Self {
        Self::new(module, Variant::Production)
    }

    pub fn test(module: impl Into<String>) -> Self {
        Self::new(module, Variant::Test)
    }

    /// A filesystem-safe key, used to name per-target state files.
    ///
    /// Bytes outside `[A-Za-z0-9_.-]` are percent-encoded, `%` included, so
    /// distinct targets never share a key.
    pub fn file_key(&self) -> String {
        let mut escaped = String::with_capacity(self.module.len());
        for byte in self.module.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
                escaped.push(char::from(byte));
            } else {
                escaped.push_str(&format!("%{byte:02X}"));
            }
        }
        format!("{escaped}.{}", self.variant)
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant {
            Variant::Production => f.write_str(&self.module),
            Variant::Test => write!(f, "{}:test", self.module),
        }
    }
}

impl FromStr for BuildTarget {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (module, variant) = match s.rsplit_once(':') {
            Some((module, "test")) => (module, Variant::Test),
            Some((module, "production")) => (module, Variant::Production),
            Some((_, other)) => {
                return Err(TargetError::UnknownVariant {
                    input: s.to_owned(),
                    variant: other.to_owned(),
                })
            }
            None => (s, Variant::Production),
        };
        if module.is_empty() {
            return Err(TargetError::EmptyModule {
                input: s.to_owned(),
            });
        }
        Ok(Self::new(module, variant))
    }
}

impl Serialize for BuildTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BuildTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("invalid target \"{input}\": unknown variant `{variant}` (expected `test` or `production`)")]
    UnknownVariant { input: String, variant: String },
    #[error("invalid target \"{input}\": module name is empty")]
    EmptyModule { input: String },
}
