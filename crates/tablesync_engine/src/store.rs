//! Checkpoint persistence.
//!
//! The orchestrator never stores checkpoints itself; callers load one before
//! a run and save the one the run hands back. [`FileCheckpointStore`] keeps
//! them in a state directory:
//!
//! ```text
//! <state_dir>/
//! ├─ <config_id>.checkpoint.json   # Latest checkpoint
//! └─ <config_id>.lock              # Advisory lock for one run at a time
//! ```

use crate::error::{SyncError, SyncResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tablesync_protocol::Checkpoint;
use tracing::debug;

/// Loads and saves checkpoints by configuration id.
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint of a configuration, or an empty one if none was
    /// saved yet.
    fn load(&self, config_id: &str) -> SyncResult<Checkpoint>;

    /// Replaces the stored checkpoint of `checkpoint.config_id`.
    fn save(&self, checkpoint: &Checkpoint) -> SyncResult<()>;
}

/// Keeps checkpoints in memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, config_id: &str) -> SyncResult<Checkpoint> {
        Ok(self
            .checkpoints
            .read()
            .get(config_id)
            .cloned()
            .unwrap_or_else(|| Checkpoint::empty(config_id)))
    }

    fn save(&self, checkpoint: &Checkpoint) -> SyncResult<()> {
        self.checkpoints
            .write()
            .insert(checkpoint.config_id.clone(), checkpoint.clone());
        Ok(())
    }
}

/// Stores checkpoints as JSON files in a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Opens a state directory, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        if !dir.is_dir() {
            return Err(SyncError::State(format!(
                "state path is not a directory: {}",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    /// The state directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a configuration's checkpoint file.
    pub fn checkpoint_path(&self, config_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.checkpoint.json", file_stem(config_id)))
    }

    /// Takes the advisory run lock of a configuration.
    ///
    /// Fails with [`SyncError::Locked`] if another process holds it. The lock
    /// is released when the returned guard is dropped.
    pub fn lock(&self, config_id: &str) -> SyncResult<ConfigLock> {
        let path = self.dir.join(format!("{}.lock", file_stem(config_id)));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(SyncError::Locked(config_id.to_string()));
        }
        debug!(config_id, path = %path.display(), "acquired run lock");
        Ok(ConfigLock { path, file })
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, config_id: &str) -> SyncResult<Checkpoint> {
        let path = self.checkpoint_path(config_id);
        if !path.exists() {
            return Ok(Checkpoint::empty(config_id));
        }
        let json = fs::read_to_string(&path)?;
        if json.trim().is_empty() {
            return Ok(Checkpoint::empty(config_id));
        }
        Ok(Checkpoint::from_json(&json)?)
    }

    /// Writes to a temporary file, syncs it, then renames it over the old
    /// checkpoint so a crash leaves either the old or the new file.
    fn save(&self, checkpoint: &Checkpoint) -> SyncResult<()> {
        let path = self.checkpoint_path(&checkpoint.config_id);
        let temp_path = path.with_extension("json.tmp");

        let json = checkpoint.to_json()?;
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &path)?;
        sync_directory(&self.dir)?;
        debug!(
            config_id = %checkpoint.config_id,
            entries = checkpoint.len(),
            "saved checkpoint"
        );
        Ok(())
    }
}

/// Held run lock of one configuration.
#[derive(Debug)]
pub struct ConfigLock {
    path: PathBuf,
    file: File,
}

impl ConfigLock {
    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn file_stem(config_id: &str) -> String {
    config_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> SyncResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> SyncResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::{CheckpointEntry, FieldValue, Row};
    use tempfile::tempdir;

    fn checkpoint(config_id: &str) -> Checkpoint {
        let mut checkpoint = Checkpoint::empty(config_id);
        let row = Row::new("r1").with_field("fldName", FieldValue::Text("Ada".into()));
        checkpoint.insert(
            row.id.clone(),
            CheckpointEntry::in_sync(row.content_hash(), None, None),
        );
        checkpoint
    }

    #[test]
    fn missing_checkpoint_loads_empty() {
        let temp = tempdir().unwrap();
        let store = FileCheckpointStore::open(temp.path().join("state")).unwrap();
        let loaded = store.load("cfg").unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.config_id, "cfg");
    }

    #[test]
    fn save_and_load_round_trip() {
        let temp = tempdir().unwrap();
        let store = FileCheckpointStore::open(temp.path()).unwrap();
        let saved = checkpoint("people/sheet");

        store.save(&saved).unwrap();
        assert!(store.checkpoint_path("people/sheet").ends_with("people_sheet.checkpoint.json"));
        assert_eq!(store.load("people/sheet").unwrap(), saved);
        assert!(!store
            .checkpoint_path("people/sheet")
            .with_extension("json.tmp")
            .exists());
    }

    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let temp = tempdir().unwrap();
        let store = FileCheckpointStore::open(temp.path()).unwrap();
        fs::write(store.checkpoint_path("cfg"), "{ not json").unwrap();
        let err = store.load("cfg").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::State);
    }

    #[test]
    fn lock_is_exclusive() {
        let temp = tempdir().unwrap();
        let store = FileCheckpointStore::open(temp.path()).unwrap();

        let held = store.lock("cfg").unwrap();
        assert!(matches!(store.lock("cfg"), Err(SyncError::Locked(_))));
        assert!(store.lock("other").is_ok());

        drop(held);
        assert!(store.lock("cfg").is_ok());
    }

    #[test]
    fn memory_store() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load("cfg").unwrap().is_empty());
        store.save(&checkpoint("cfg")).unwrap();
        assert_eq!(store.load("cfg").unwrap().len(), 1);
    }
}
