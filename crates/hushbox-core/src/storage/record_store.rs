use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::artifact::ArtifactRecord;

/// Errors produced by record store implementations.
///
/// Variants never carry a locator or lookup key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordStoreError {
    /// Requested record does not exist.
    #[error("record not found")]
    NotFound,
    /// A record already exists under the locator.
    #[error("record already exists")]
    Conflict,
    /// Stored bytes could not be parsed into a record.
    #[error("record is corrupt: {reason}")]
    Corrupt { reason: String },
    /// Temporary failure; the operation may succeed if retried.
    #[error("storage temporarily unavailable: {reason}")]
    Unavailable { reason: String },
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

impl RecordStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RecordStoreError::Unavailable { .. })
    }
}

/// Durable storage for encrypted artifact records.
///
/// Records are addressed by their locator. Implementations only move records
/// around; they never see plaintext, keys or lookup keys. Every call must be
/// atomic per record, and mutations of one record must not interleave.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record, failing with `Conflict` if the locator is taken.
    async fn insert(&self, record: &ArtifactRecord) -> Result<(), RecordStoreError>;

    /// Retrieve the record stored under a locator.
    async fn get(&self, locator: &str) -> Result<ArtifactRecord, RecordStoreError>;

    /// Overwrite an existing record (last writer wins).
    async fn replace(&self, record: &ArtifactRecord) -> Result<(), RecordStoreError>;

    /// Remove a record. Returns whether anything was removed.
    async fn delete(&self, locator: &str) -> Result<bool, RecordStoreError>;

    /// Locators of every record that is expired at `now`.
    async fn expired_keys(&self, now: DateTime<Utc>) -> Result<Vec<String>, RecordStoreError>;
}

/// In-memory record store for tests and smoke runs. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRecordStore {
    inner: Arc<Mutex<HashMap<String, ArtifactRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, ArtifactRecord>>, RecordStoreError> {
        self.inner.lock().map_err(|err| RecordStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, record: &ArtifactRecord) -> Result<(), RecordStoreError> {
        let mut map = self.lock()?;
        if map.contains_key(&record.locator) {
            return Err(RecordStoreError::Conflict);
        }
        map.insert(record.locator.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, locator: &str) -> Result<ArtifactRecord, RecordStoreError> {
        let map = self.lock()?;
        map.get(locator)
            .cloned()
            .ok_or(RecordStoreError::NotFound)
    }

    async fn replace(&self, record: &ArtifactRecord) -> Result<(), RecordStoreError> {
        let mut map = self.lock()?;
        match map.get_mut(&record.locator) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RecordStoreError::NotFound),
        }
    }

    async fn delete(&self, locator: &str) -> Result<bool, RecordStoreError> {
        let mut map = self.lock()?;
        Ok(map.remove(locator).is_some())
    }

    async fn expired_keys(&self, now: DateTime<Utc>) -> Result<Vec<String>, RecordStoreError> {
        let map = self.lock()?;
        Ok(map
            .values()
            .filter(|record| record.is_expired_at(now))
            .map(|record| record.locator.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::artifact::{ArtifactStatus, CURRENT_SCHEMA_VERSION};

    fn record(locator: &str, ttl: Duration) -> ArtifactRecord {
        let now = Utc::now();
        ArtifactRecord {
            id: Uuid::new_v4(),
            locator: locator.into(),
            owner_scope_id: "org-1".into(),
            ciphertext: "ciphertext".into(),
            nonce: Some("nonce".into()),
            kdf_salt: Some("salt".into()),
            secret_hash: Some("hash".into()),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            revision_count: 0,
            position: Some(1),
            status: ArtifactStatus::Active,
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = InMemoryRecordStore::new();
        let rec = record("a1", Duration::hours(1));
        store.insert(&rec).await.expect("first insert");
        let err = store.insert(&rec).await.expect_err("second insert");
        assert_eq!(err, RecordStoreError::Conflict);
        assert_eq!(store.get("a1").await.expect("get"), rec);
    }

    #[tokio::test]
    async fn replace_requires_existing_record() {
        let store = InMemoryRecordStore::new();
        let mut rec = record("b2", Duration::hours(1));
        let err = store.replace(&rec).await.expect_err("missing");
        assert_eq!(err, RecordStoreError::NotFound);

        store.insert(&rec).await.expect("insert");
        rec.revision_count = 3;
        store.replace(&rec).await.expect("replace");
        assert_eq!(store.get("b2").await.unwrap().revision_count, 3);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_data() {
        let store = InMemoryRecordStore::new();
        store
            .insert(&record("c3", Duration::hours(1)))
            .await
            .expect("insert");
        assert!(store.delete("c3").await.expect("delete"));
        assert!(!store.delete("c3").await.expect("delete again"));

        let err = store.get("c3").await.expect_err("gone");
        assert_eq!(err, RecordStoreError::NotFound);
    }

    #[tokio::test]
    async fn expired_keys_only_lists_expired_records() {
        let store = InMemoryRecordStore::new();
        store
            .insert(&record("d4", Duration::hours(1)))
            .await
            .unwrap();
        store
            .insert(&record("e5", Duration::seconds(-1)))
            .await
            .unwrap();

        let expired = store.expired_keys(Utc::now()).await.expect("scan");
        assert_eq!(expired, vec!["e5".to_string()]);
    }
}
