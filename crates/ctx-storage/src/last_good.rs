use crate::StorageError;
use chrono::{DateTime, Utc};
use ctx_core::master_context::MasterContext;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

struct AdvisoryFileLock {
    file: File,
}

impl AdvisoryFileLock {
    fn exclusive(path: &Path) -> Result<Self, StorageError> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    fn shared(path: &Path) -> Result<Self, StorageError> {
        let file = open_lock_file(path)?;
        file.lock_shared()?;
        Ok(Self { file })
    }
}

impl Drop for AdvisoryFileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_lock_file(path: &Path) -> Result<File, StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// Snapshot of the last hot document that was known good, kept outside the
/// database so reads survive a broken primary store.
#[derive(Debug, Clone)]
pub struct LastGoodCache {
    path: PathBuf,
    lock_path: PathBuf,
}

impl LastGoodCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the snapshot via write-to-temp and rename under an exclusive lock.
    pub fn store(&self, document: &MasterContext) -> Result<(), StorageError> {
        let body = serde_json::to_vec_pretty(document)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let _guard = AdvisoryFileLock::exclusive(&self.lock_path)?;

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<MasterContext>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let _guard = AdvisoryFileLock::shared(&self.lock_path)?;
        let body = match fs::read(&self.path) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|err| StorageError::Serialization(err.to_string()))
    }
}

/// Single-owner lock on a data directory. Held for the lifetime of a
/// scheduler process; released on drop.
pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    pub fn try_acquire(path: impl Into<PathBuf>, now: DateTime<Utc>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut file = open_lock_file(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::LockBusy(path.display().to_string()));
        }

        let metadata = format!(
            "owner_pid={}\nacquired_at={}\n",
            std::process::id(),
            now.to_rfc3339(),
        );
        file.set_len(0)?;
        file.write_all(metadata.as_bytes())?;
        file.flush()?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
