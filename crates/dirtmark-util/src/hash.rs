//! Hashing utilities for target signatures.

use std::path::Path;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use crate::error::UtilError;

/// Hash every file under `dir` matching `pattern`, sorted by relative path.
///
/// The relative path of each file is hashed together with its content so
/// renames and moves between roots change the result. A directory that does
/// not exist hashes like an empty one.
///
/// # Errors
/// Returns an error if the glob pattern is invalid or a matched file cannot
/// be read.
pub fn sha256_tree(dir: &Path, pattern: &str) -> Result<String, UtilError> {
    // The root is literal; only `pattern` may carry glob syntax.
    let escaped_dir = glob::Pattern::escape(&dir.display().to_string());
    let full_pattern_str = Path::new(&escaped_dir).join(pattern).display().to_string();

    let mut paths: Vec<_> = glob::glob(&full_pattern_str)
        .map_err(|e| UtilError::GlobPattern {
            pattern: full_pattern_str.clone(),
            message: e.to_string(),
        })?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();

    paths.sort();

    let mut hasher = Sha256::new();
    for path in &paths {
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let relative = relative.display().to_string();
        hasher.update(relative.len().to_le_bytes());
        hasher.update(relative.as_bytes());

        let data = std::fs::read(path).map_err(|source| UtilError::Io {
            path: path.display().to_string(),
            source,
        })?;
        hasher.update(data.len().to_le_bytes());
        hasher.update(&data);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Combine multiple string parts into a single composite SHA-256 hash.
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn sha256_multi<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update(part.len().to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Cheap identity stamp of a file or directory: path, modification time and size.
///
/// Library roots are archives that are replaced wholesale, so the stamp
/// stands in for a content hash. Returns `None` if the path does not exist.
pub fn file_stamp(path: &Path) -> Option<String> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    Some(format!("{}|{modified}|{}", path.display(), meta.len()))
}
