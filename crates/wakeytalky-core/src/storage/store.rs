//! Alarm persistence.
//!
//! The whole state (alarms, live instances, recent history) is one JSON
//! document keyed by id. Saves replace it atomically: write a sibling
//! `.tmp`, fsync, rename over the target. A crash mid-save leaves the
//! previous file intact.
//!
//! Several processes may share one file (a daemon plus short-lived CLI
//! commands). Writers serialize on an advisory lock on `<file>.lock` and
//! bump `revision` on every save, so a reader can tell its copy is stale.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::data_dir;
use crate::alarm::{Alarm, AlarmId};
use crate::error::PersistenceError;
use crate::ring::{AlarmInstance, InstanceId};

pub const STORE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STORE_VERSION
}

/// Everything the controller needs to survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Bumped by every save.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub alarms: BTreeMap<AlarmId, Alarm>,
    /// Instances that are not dismissed yet (including expired ones).
    #[serde(default)]
    pub instances: BTreeMap<InstanceId, AlarmInstance>,
    /// Resolved instances, oldest first.
    #[serde(default)]
    pub history: Vec<AlarmInstance>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            revision: 0,
            alarms: BTreeMap::new(),
            instances: BTreeMap::new(),
            history: Vec::new(),
        }
    }
}

/// Exclusive hold on a store. Released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: Option<File>,
}

impl StoreLock {
    /// A hold on a store that is never shared between processes.
    pub fn local() -> Self {
        Self { file: None }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(error = %e, "failed to release alarm state lock");
            }
        }
    }
}

/// Load/save of the full alarm state. Both calls are idempotent.
pub trait AlarmStore: Send + Sync {
    fn load(&self) -> Result<StoreSnapshot, PersistenceError>;

    fn save(&self, snapshot: &StoreSnapshot) -> Result<(), PersistenceError>;

    /// Try to take the writer lock without blocking. `Ok(None)` means
    /// another holder has it.
    fn try_lock(&self) -> Result<Option<StoreLock>, PersistenceError> {
        Ok(Some(StoreLock::local()))
    }
}

/// JSON file store. One writer at a time, across processes.
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Store at `<data_dir>/<file_name>`.
    pub fn open(file_name: &str) -> Result<Self, PersistenceError> {
        let dir = data_dir().map_err(|e| PersistenceError::io("~/.config/wakeytalky", e))?;
        Ok(Self::with_path(dir.join(file_name)))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn companion(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn ensure_parent(&self) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
            }
        }
        Ok(())
    }

    /// Move an unreadable file aside so the next save does not clobber it.
    fn quarantine(&self, reason: &str) {
        let target = self.companion(".corrupt");
        match fs::rename(&self.path, &target) {
            Ok(()) => warn!(
                path = %self.path.display(),
                quarantined = %target.display(),
                reason,
                "alarm state unreadable, starting empty"
            ),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to quarantine alarm state"),
        }
    }
}

impl AlarmStore for JsonFileStore {
    fn load(&self) -> Result<StoreSnapshot, PersistenceError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no alarm state yet");
                return Ok(StoreSnapshot::default());
            }
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };

        match serde_json::from_str::<StoreSnapshot>(&content) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                let _guard = self.write_lock.lock().map_err(|_| PersistenceError::Lock)?;
                self.quarantine(&e.to_string());
                Ok(StoreSnapshot::default())
            }
        }
    }

    fn save(&self, snapshot: &StoreSnapshot) -> Result<(), PersistenceError> {
        let serialized = serde_json::to_string_pretty(snapshot)?;
        let _guard = self.write_lock.lock().map_err(|_| PersistenceError::Lock)?;
        self.ensure_parent()?;

        let tmp = self.companion(".tmp");
        fs::write(&tmp, serialized).map_err(|e| PersistenceError::io(&tmp, e))?;
        fs::File::open(&tmp)
            .and_then(|f| f.sync_all())
            .map_err(|e| PersistenceError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| PersistenceError::io(&self.path, e))?;
        debug!(
            path = %self.path.display(),
            revision = snapshot.revision,
            alarms = snapshot.alarms.len(),
            instances = snapshot.instances.len(),
            "alarm state saved"
        );
        Ok(())
    }

    fn try_lock(&self) -> Result<Option<StoreLock>, PersistenceError> {
        self.ensure_parent()?;
        let lock_path = self.companion(".lock");
        // No truncate: the file only exists to carry the lock.
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| PersistenceError::io(&lock_path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(StoreLock { file: Some(file) })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(PersistenceError::io(&lock_path, e)),
        }
    }
}

/// In-memory store. Keeps the serialized form so loads exercise serde the
/// same way the file store does.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Option<String>>,
    failing_saves: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` saves fail with an I/O error.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl AlarmStore for MemoryStore {
    fn load(&self) -> Result<StoreSnapshot, PersistenceError> {
        let data = self.data.lock().map_err(|_| PersistenceError::Lock)?;
        match data.as_deref() {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(StoreSnapshot::default()),
        }
    }

    fn save(&self, snapshot: &StoreSnapshot) -> Result<(), PersistenceError> {
        let pending_failures = self.failing_saves.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_saves.store(pending_failures - 1, Ordering::SeqCst);
            return Err(PersistenceError::io(
                "memory",
                std::io::Error::new(std::io::ErrorKind::Other, "injected save failure"),
            ));
        }
        let json = serde_json::to_string(snapshot)?;
        *self.data.lock().map_err(|_| PersistenceError::Lock)? = Some(json);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::TimeOfDay;
    use tempfile::TempDir;

    fn snapshot_with_alarm() -> StoreSnapshot {
        let alarm = Alarm::new("gym", TimeOfDay::new(6, 30).unwrap(), [1, 3]);
        let mut snap = StoreSnapshot::default();
        snap.alarms.insert(alarm.id.clone(), alarm);
        snap
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::with_path(dir.path().join("alarms.json"));
        let snap = store.load().unwrap();
        assert!(snap.alarms.is_empty());
        assert_eq!(snap.version, STORE_VERSION);
        assert_eq!(snap.revision, 0);
    }

    #[test]
    fn default_snapshot_carries_current_version() {
        assert_eq!(StoreSnapshot::default().version, STORE_VERSION);
        let empty: StoreSnapshot = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, StoreSnapshot::default());
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("alarms.json");
        let first = JsonFileStore::with_path(&path);
        let second = JsonFileStore::with_path(&path);

        let held = first.try_lock().unwrap().expect("first lock");
        assert!(dir.path().join("state").join("alarms.json.lock").exists());
        assert!(second.try_lock().unwrap().is_none());

        drop(held);
        assert!(second.try_lock().unwrap().is_some());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::with_path(dir.path().join("nested").join("alarms.json"));
        let snap = snapshot_with_alarm();
        store.save(&snap).unwrap();
        store.save(&snap).unwrap();
        assert_eq!(store.load().unwrap(), snap);
        assert!(!dir.path().join("nested").join("alarms.json.tmp").exists());
    }

    #[test]
    fn leftover_tmp_does_not_replace_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alarms.json");
        let store = JsonFileStore::with_path(&path);
        let snap = snapshot_with_alarm();
        store.save(&snap).unwrap();

        // A save that died after writing half of the temp file.
        std::fs::write(dir.path().join("alarms.json.tmp"), "{\"alarms\": {").unwrap();
        assert_eq!(store.load().unwrap(), snap);
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alarms.json");
        std::fs::write(&path, "not json").unwrap();
        let store = JsonFileStore::with_path(&path);
        let snap = store.load().unwrap();
        assert!(snap.alarms.is_empty());
        assert!(dir.path().join("alarms.json.corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn memory_store_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_saves(1);
        let snap = snapshot_with_alarm();
        assert!(store.save(&snap).is_err());
        store.save(&snap).unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().unwrap(), snap);
    }
}
