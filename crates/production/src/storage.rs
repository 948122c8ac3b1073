//! # File Safety Store
//!
//! Durable [`SafetyStateStore`] backed by a single JSON file.
//!
//! Writes go to a temporary sibling file which is fsynced and then renamed
//! over the target, so a crash leaves either the old or the new state on
//! disk, never a torn one. All operations are synchronous blocking I/O.

use concord_core::{PersistenceError, SafetyStateStore};
use concord_types::SafetyState;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// File-backed safety state store.
#[derive(Debug)]
pub struct FileSafetyStore {
    path: PathBuf,
    tmp_path: PathBuf,
    /// Serializes writers so two stores never race on the temporary file.
    write_lock: Mutex<()>,
}

impl FileSafetyStore {
    /// Store at `path`. The parent directory must exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp_path: PathBuf::from(tmp),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(state: &SafetyState) -> Result<Vec<u8>, PersistenceError> {
        serde_json::to_vec(state).map_err(|e| PersistenceError::Encoding(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<SafetyState, PersistenceError> {
        serde_json::from_slice(bytes).map_err(|e| PersistenceError::Encoding(e.to_string()))
    }

    /// Make the rename itself durable.
    fn sync_parent(&self) -> Result<(), PersistenceError> {
        if !cfg!(unix) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }
}

impl SafetyStateStore for FileSafetyStore {
    fn load(&self) -> Result<Option<SafetyState>, PersistenceError> {
        match fs::read(&self.path) {
            Ok(bytes) => Self::decode(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(level = "debug", skip_all, fields(
        epoch = state.epoch.0,
        last_voted_view = state.last_voted_view.0,
    ))]
    fn store(&self, state: &SafetyState) -> Result<(), PersistenceError> {
        let bytes = Self::encode(state)?;
        let _guard = self.write_lock.lock();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;
        self.sync_parent()?;
        debug!(bytes = bytes.len(), "Safety state persisted");
        Ok(())
    }
}
