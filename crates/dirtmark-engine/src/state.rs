//! Persisted per-target build state.
//!
//! The store is the only source of "already up to date" truth. It is written
//! only after the executor reports a target's successful completion, and any
//! doubt about its contents resolves to "not up to date".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use dirtmark_targets::BuildTarget;

use crate::error::EngineError;
use crate::signature::Signature;

/// Bumped whenever the on-disk record layout changes.
pub const STATE_FORMAT_VERSION: &str = "1";

const VERSION_FILE: &str = "format-version";

/// Last successful build of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    pub target: BuildTarget,
    /// Milliseconds since the Unix epoch.
    pub built_at: u64,
    pub signature: Signature,
    pub outputs: Vec<PathBuf>,
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Per-target build state. Updates to different targets are independent.
pub trait StateStore: Send + Sync {
    /// Record a successful build. `built_at` never moves backwards: the
    /// stored value is the maximum of the reported time and every time
    /// recorded earlier for `target` in this store, invalidated ones included.
    ///
    /// # Errors
    /// Returns an error if the record cannot be persisted.
    fn record_success(
        &self,
        target: &BuildTarget,
        built_at: u64,
        signature: Signature,
        outputs: Vec<PathBuf>,
    ) -> Result<(), EngineError>;

    /// Whether the last successful build of `target` saw `signature`.
    fn is_up_to_date(&self, target: &BuildTarget, signature: &Signature) -> bool {
        self.entry(target)
            .is_some_and(|state| &state.signature == signature)
    }

    /// Forget `target`, returning the outputs of its last build.
    ///
    /// # Errors
    /// Returns an error if the persisted record cannot be removed.
    fn invalidate(&self, target: &BuildTarget) -> Result<Vec<PathBuf>, EngineError>;

    fn entry(&self, target: &BuildTarget) -> Option<TargetState>;

    /// All records, sorted by target.
    fn entries(&self) -> Vec<TargetState>;

    /// Drop records for which `keep` is false, returning their targets.
    ///
    /// # Errors
    /// Returns an error if a persisted record cannot be removed.
    fn prune(&self, keep: &dyn Fn(&BuildTarget) -> bool) -> Result<Vec<BuildTarget>, EngineError>;
}

#[derive(Debug, Default)]
struct Records {
    live: HashMap<BuildTarget, TargetState>,
    /// Latest `built_at` per target. Survives `invalidate`, so a rebuild
    /// recorded with a skewed clock cannot move it backwards.
    stamps: HashMap<BuildTarget, u64>,
}

impl Records {
    fn from_live(live: HashMap<BuildTarget, TargetState>) -> Self {
        let stamps = live.iter().map(|(t, s)| (t.clone(), s.built_at)).collect();
        Self { live, stamps }
    }

    fn stamped(&mut self, state: TargetState) -> TargetState {
        let stamp = self.stamps.entry(state.target.clone()).or_insert(0);
        *stamp = (*stamp).max(state.built_at);
        TargetState {
            built_at: *stamp,
            ..state
        }
    }

    fn forget(&mut self, target: &BuildTarget) -> Vec<PathBuf> {
        self.live.remove(target).map(|s| s.outputs).unwrap_or_default()
    }

    fn dropped(&self, keep: &dyn Fn(&BuildTarget) -> bool) -> Vec<BuildTarget> {
        let mut dropped: Vec<BuildTarget> = self.live.keys().filter(|t| !keep(t)).cloned().collect();
        dropped.sort();
        dropped
    }

    fn remove(&mut self, target: &BuildTarget) {
        self.live.remove(target);
        self.stamps.remove(target);
    }

    fn sorted(&self) -> Vec<TargetState> {
        let mut all: Vec<TargetState> = self.live.values().cloned().collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }
}

type Entries = RwLock<Records>;

fn read(entries: &Entries) -> std::sync::RwLockReadGuard<'_, Records> {
    entries.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(entries: &Entries) -> std::sync::RwLockWriteGuard<'_, Records> {
    entries.write().unwrap_or_else(PoisonError::into_inner)
}

/// Store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Entries,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn record_success(
        &self,
        target: &BuildTarget,
        built_at: u64,
        signature: Signature,
        outputs: Vec<PathBuf>,
    ) -> Result<(), EngineError> {
        let mut records = write(&self.entries);
        let state = records.stamped(TargetState {
            target: target.clone(),
            built_at,
            signature,
            outputs,
        });
        records.live.insert(target.clone(), state);
        Ok(())
    }

    fn invalidate(&self, target: &BuildTarget) -> Result<Vec<PathBuf>, EngineError> {
        Ok(write(&self.entries).forget(target))
    }

    fn entry(&self, target: &BuildTarget) -> Option<TargetState> {
        read(&self.entries).live.get(target).cloned()
    }

    fn entries(&self) -> Vec<TargetState> {
        read(&self.entries).sorted()
    }

    fn prune(&self, keep: &dyn Fn(&BuildTarget) -> bool) -> Result<Vec<BuildTarget>, EngineError> {
        let mut records = write(&self.entries);
        let dropped = records.dropped(keep);
        for target in &dropped {
            records.remove(target);
        }
        records.stamps.retain(|target, _| keep(target));
        Ok(dropped)
    }
}

/// Store persisted as one JSON record per target under a state directory.
///
/// Records are written with a temp-file-and-rename so a crash never leaves
/// a half-written record. A directory that cannot be read back completely
/// is wiped at open.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    entries: Entries,
    reset: bool,
}

impl FileStateStore {
    /// Open (or create) the store at `dir`.
    ///
    /// # Errors
    /// Returns an error only if the directory cannot be created or wiped;
    /// unreadable contents are discarded instead.
    pub fn open(dir: &Path) -> Result<Self, EngineError> {
        dirtmark_util::fs::ensure_dir(dir)?;
        let (entries, reset) = match load(dir) {
            Ok(entries) => (entries, false),
            Err(reason) => {
                tracing::warn!(
                    dir = %dir.display(),
                    "build state is unreadable ({reason}); discarding it, every target will be rebuilt"
                );
                dirtmark_util::fs::remove_dir_all_if_exists(dir)?;
                dirtmark_util::fs::ensure_dir(dir)?;
                (HashMap::new(), true)
            }
        };
        dirtmark_util::fs::write_atomic(
            &dir.join(VERSION_FILE),
            STATE_FORMAT_VERSION.as_bytes(),
        )?;
        tracing::debug!(dir = %dir.display(), records = entries.len(), "opened build state");
        Ok(Self {
            dir: dir.to_path_buf(),
            entries: RwLock::new(Records::from_live(entries)),
            reset,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether previous contents were discarded at open.
    pub fn was_reset(&self) -> bool {
        self.reset
    }

    fn record_path(&self, target: &BuildTarget) -> PathBuf {
        self.dir.join(format!("{}.json", target.file_key()))
    }
}

/// Read every record in `dir`. Any problem is reported as a message; the
/// caller discards the directory.
fn load(dir: &Path) -> Result<HashMap<BuildTarget, TargetState>, String> {
    let listing = std::fs::read_dir(dir).map_err(|e| e.to_string())?;
    let mut record_files = Vec::new();
    for entry in listing {
        let path = entry.map_err(|e| e.to_string())?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            record_files.push(path);
        }
    }

    let version_path = dir.join(VERSION_FILE);
    match std::fs::read_to_string(&version_path) {
        Ok(found) if found.trim() == STATE_FORMAT_VERSION => {}
        Ok(found) => return Err(format!("format version {} is not supported", found.trim())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && record_files.is_empty() => {
            return Ok(HashMap::new())
        }
        Err(e) => return Err(format!("cannot read {VERSION_FILE}: {e}")),
    }

    let mut entries = HashMap::new();
    for path in record_files {
        let raw = std::fs::read(&path).map_err(|e| format!("{}: {e}", path.display()))?;
        let state: TargetState =
            serde_json::from_slice(&raw).map_err(|e| format!("{}: {e}", path.display()))?;
        let expected = format!("{}.json", state.target.file_key());
        if path.file_name().is_none_or(|name| name != expected.as_str()) {
            return Err(format!("{} holds the record of {}", path.display(), state.target));
        }
        entries.insert(state.target.clone(), state);
    }
    Ok(entries)
}

impl StateStore for FileStateStore {
    fn record_success(
        &self,
        target: &BuildTarget,
        built_at: u64,
        signature: Signature,
        outputs: Vec<PathBuf>,
    ) -> Result<(), EngineError> {
        let mut records = write(&self.entries);
        let state = records.stamped(TargetState {
            target: target.clone(),
            built_at,
            signature,
            outputs,
        });
        let json = serde_json::to_vec_pretty(&state).map_err(|source| EngineError::StateEncode {
            target: target.to_string(),
            source,
        })?;
        dirtmark_util::fs::write_atomic(&self.record_path(target), &json)?;
        records.live.insert(target.clone(), state);
        Ok(())
    }

    fn invalidate(&self, target: &BuildTarget) -> Result<Vec<PathBuf>, EngineError> {
        let mut records = write(&self.entries);
        dirtmark_util::fs::remove_file_if_exists(&self.record_path(target))?;
        Ok(records.forget(target))
    }

    fn entry(&self, target: &BuildTarget) -> Option<TargetState> {
        read(&self.entries).live.get(target).cloned()
    }

    fn entries(&self) -> Vec<TargetState> {
        read(&self.entries).sorted()
    }

    fn prune(&self, keep: &dyn Fn(&BuildTarget) -> bool) -> Result<Vec<BuildTarget>, EngineError> {
        let mut records = write(&self.entries);
        let dropped = records.dropped(keep);
        for target in &dropped {
            dirtmark_util::fs::remove_file_if_exists(&self.record_path(target))?;
            records.remove(target);
        }
        records.stamps.retain(|target, _| keep(target));
        Ok(dropped)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;

    fn sig(s: &str) -> Signature {
        Signature::new(s)
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        let a = BuildTarget::production("a");
        store
            .record_success(&a, 10, sig("s1"), vec!["out/a.klib".into()])
            .unwrap();
        assert!(store.is_up_to_date(&a, &sig("s1")));
        assert!(!store.is_up_to_date(&a, &sig("s2")));
        assert!(!store.is_up_to_date(&BuildTarget::test("a"), &sig("s1")));
    }

    #[test]
    fn built_at_never_decreases() {
        let store = MemoryStateStore::new();
        let a = BuildTarget::production("a");
        store.record_success(&a, 100, sig("s1"), Vec::new()).unwrap();
        store.record_success(&a, 50, sig("s2"), Vec::new()).unwrap();
        let entry = store.entry(&a).unwrap();
        assert_eq!(entry.built_at, 100);
        assert_eq!(entry.signature, sig("s2"));
    }

    #[test]
    fn built_at_survives_invalidation() {
        let store = MemoryStateStore::new();
        let a = BuildTarget::production("a");
        store.record_success(&a, 100, sig("s1"), Vec::new()).unwrap();
        store.invalidate(&a).unwrap();
        assert!(store.entry(&a).is_none());

        store.record_success(&a, 50, sig("s2"), Vec::new()).unwrap();
        assert_eq!(store.entry(&a).unwrap().built_at, 100);
    }

    #[test]
    fn file_store_built_at_survives_invalidation_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = BuildTarget::production("a");
        {
            let store = FileStateStore::open(dir.path()).unwrap();
            store.record_success(&a, 100, sig("s1"), Vec::new()).unwrap();
        }
        let store = FileStateStore::open(dir.path()).unwrap();
        store.invalidate(&a).unwrap();
        store.record_success(&a, 40, sig("s2"), Vec::new()).unwrap();
        assert_eq!(store.entry(&a).unwrap().built_at, 100);
    }

    #[test]
    fn invalidate_returns_outputs() {
        let store = MemoryStateStore::new();
        let a = BuildTarget::production("a");
        store
            .record_success(&a, 1, sig("s"), vec!["out/a".into()])
            .unwrap();
        assert_eq!(store.invalidate(&a).unwrap(), [PathBuf::from("out/a")]);
        assert!(store.entry(&a).is_none());
        assert!(store.invalidate(&a).unwrap().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state");
        let a = BuildTarget::test("a");
        {
            let store = FileStateStore::open(&dir).unwrap();
            store
                .record_success(&a, 42, sig("s1"), vec!["out/a-test".into()])
                .unwrap();
        }
        let store = FileStateStore::open(&dir).unwrap();
        assert!(!store.was_reset());
        let entry = store.entry(&a).unwrap();
        assert_eq!(entry.built_at, 42);
        assert_eq!(entry.outputs, [PathBuf::from("out/a-test")]);
    }

    #[test]
    fn corrupted_record_resets_store() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state");
        let a = BuildTarget::production("a");
        let b = BuildTarget::production("b");
        {
            let store = FileStateStore::open(&dir).unwrap();
            store.record_success(&a, 1, sig("s"), Vec::new()).unwrap();
            store.record_success(&b, 1, sig("s"), Vec::new()).unwrap();
        }
        fs::write(dir.join(format!("{}.json", a.file_key())), "{ not json").unwrap();

        let store = FileStateStore::open(&dir).unwrap();
        assert!(store.was_reset());
        assert!(store.entries().is_empty());
        assert!(!store.is_up_to_date(&b, &sig("s")));
        // The wiped directory is usable again.
        store.record_success(&b, 2, sig("s"), Vec::new()).unwrap();
        assert!(!FileStateStore::open(&dir).unwrap().was_reset());
    }

    #[test]
    fn version_mismatch_resets_store() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state");
        let a = BuildTarget::production("a");
        {
            let store = FileStateStore::open(&dir).unwrap();
            store.record_success(&a, 1, sig("s"), Vec::new()).unwrap();
        }
        fs::write(dir.join(VERSION_FILE), "0").unwrap();
        let store = FileStateStore::open(&dir).unwrap();
        assert!(store.was_reset());
        assert!(store.entry(&a).is_none());
    }

    #[test]
    fn records_without_version_file_are_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.production.json"), "{}").unwrap();
        let store = FileStateStore::open(&dir).unwrap();
        assert!(store.was_reset());
    }

    #[test]
    fn misnamed_record_resets_store() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state");
        let a = BuildTarget::production("a");
        {
            let store = FileStateStore::open(&dir).unwrap();
            store.record_success(&a, 1, sig("s"), Vec::new()).unwrap();
        }
        fs::rename(
            dir.join(format!("{}.json", a.file_key())),
            dir.join("b.production.json"),
        )
        .unwrap();
        assert!(FileStateStore::open(&dir).unwrap().was_reset());
    }

    #[test]
    fn prune_drops_unknown_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state");
        let store = FileStateStore::open(&dir).unwrap();
        let a = BuildTarget::production("a");
        let gone = BuildTarget::production("gone");
        store.record_success(&a, 1, sig("s"), Vec::new()).unwrap();
        store.record_success(&gone, 1, sig("s"), Vec::new()).unwrap();
        let dropped = store.prune(&|t| t.module == "a").unwrap();
        assert_eq!(dropped, [gone.clone()]);
        assert!(!dir.join(format!("{}.json", gone.file_key())).exists());
        assert_eq!(FileStateStore::open(&dir).unwrap().entries().len(), 1);
    }

    #[test]
    fn concurrent_records_for_distinct_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::open(&tmp.path().join("state")).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let target = BuildTarget::production(format!("m{i}"));
                    store.record_success(&target, i, sig("s"), Vec::new()).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let reopened = FileStateStore::open(&tmp.path().join("state")).unwrap();
        assert_eq!(reopened.entries().len(), 8);
    }
}
