use std::{
    collections::hash_map::DefaultHasher,
    fs::{self, File},
    hash::{Hash, Hasher},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hushbox_core::{
    artifact::ArtifactRecord,
    storage::{RecordStore, RecordStoreError},
};
use tempfile::NamedTempFile;
use tracing::{instrument, warn};

const RECORD_EXT: &str = "json";
const LOCK_STRIPES: usize = 64;

/// File-backed record store: one JSON document per artifact, named by its
/// locator.
///
/// Every write goes to a temp file in the same directory and is renamed into
/// place, so a crash never leaves a half-written record behind. Mutations of
/// one record are serialized through a striped lock; the data directory is
/// owned by a single process.
pub struct FileRecordStore {
    root: PathBuf,
    stripes: Vec<Mutex<()>>,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, locator: &str) -> Result<PathBuf, RecordStoreError> {
        if locator.is_empty() || !locator.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(RecordStoreError::Storage {
                reason: "invalid record locator".to_string(),
            });
        }
        Ok(self.root.join(format!("{locator}.{RECORD_EXT}")))
    }

    fn lock_for(&self, locator: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        locator.hash(&mut hasher);
        let stripe = hasher.finish() as usize % self.stripes.len();
        // The guard protects no data, so a poisoned stripe is still usable.
        self.stripes[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    #[instrument(skip_all, fields(id = %record.id))]
    async fn insert(&self, record: &ArtifactRecord) -> Result<(), RecordStoreError> {
        let path = self.path_for(&record.locator)?;
        let _guard = self.lock_for(&record.locator);
        let tmp = stage_record(&path, record)?;
        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                RecordStoreError::Conflict
            } else {
                storage_err(e.error)
            }
        })?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn get(&self, locator: &str) -> Result<ArtifactRecord, RecordStoreError> {
        read_record(&self.path_for(locator)?)
    }

    #[instrument(skip_all, fields(id = %record.id))]
    async fn replace(&self, record: &ArtifactRecord) -> Result<(), RecordStoreError> {
        let path = self.path_for(&record.locator)?;
        let _guard = self.lock_for(&record.locator);
        if !path.exists() {
            return Err(RecordStoreError::NotFound);
        }
        let tmp = stage_record(&path, record)?;
        tmp.persist(&path).map_err(|e| storage_err(e.error))?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn delete(&self, locator: &str) -> Result<bool, RecordStoreError> {
        let path = self.path_for(locator)?;
        let _guard = self.lock_for(locator);
        match fs::remove_file(path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(storage_err(err)),
        }
    }

    #[instrument(skip_all)]
    async fn expired_keys(&self, now: DateTime<Utc>) -> Result<Vec<String>, RecordStoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage_err(err)),
        };

        let mut expired = Vec::new();
        for entry in entries {
            let path = entry.map_err(storage_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            match read_record(&path) {
                Ok(record) if record.is_expired_at(now) => expired.push(record.locator),
                Ok(_) => {}
                // Vanished between listing and reading.
                Err(RecordStoreError::NotFound) => {}
                Err(err) => warn!(error = %err, "skipping unreadable record during sweep"),
            }
        }
        Ok(expired)
    }
}

fn stage_record(path: &Path, record: &ArtifactRecord) -> Result<NamedTempFile, RecordStoreError> {
    let parent = path.parent().ok_or_else(|| RecordStoreError::Storage {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec(record).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.as_file().sync_all().map_err(storage_err)?;
    Ok(tmp)
}

fn read_record(path: &Path) -> Result<ArtifactRecord, RecordStoreError> {
    let mut file = File::open(path).map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            RecordStoreError::NotFound
        } else {
            storage_err(err)
        }
    })?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    serde_json::from_slice(&buf).map_err(|e| RecordStoreError::Corrupt {
        reason: e.to_string(),
    })
}

fn storage_err<E: Into<std::io::Error>>(err: E) -> RecordStoreError {
    let err: std::io::Error = err.into();
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            RecordStoreError::Unavailable {
                reason: err.to_string(),
            }
        }
        _ => RecordStoreError::Storage {
            reason: err.to_string(),
        },
    }
}
