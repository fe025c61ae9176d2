//! Encrypted artifact vault: create, read, update and delete artifacts that only
//! the holder of the secret code can open.

pub mod ttl;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration as StdDuration,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use hushbox_core::{
    artifact::{ArtifactMetadata, ArtifactRecord, ArtifactStatus, CURRENT_SCHEMA_VERSION},
    collab::{CodeGenerator, CodeSettings},
    error::VaultError,
    retry::{retry_with_backoff, RetryError, RetryPolicy},
    storage::{RecordStore, RecordStoreError},
};
use hushbox_storage::{
    cipher,
    digest::{record_locator, secret_digest, verify_digest},
    key_derivation::{generate_salt, DerivedKey, KdfParams, KeyDeriver, SALT_LEN},
    CryptoError,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

const AAD_DOMAIN: &str = "hushbox-artifact-v2";
const DECOY_SALT: [u8; SALT_LEN] = [0x5a; SALT_LEN];
const LOCATOR_SALT: [u8; SALT_LEN] = *b"hushbox-locator1";

/// Tunables for the vault.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VaultSettings {
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub kdf: KdfParams,
    pub codes: CodeSettings,
    pub store_retry: RetryPolicy,
    /// Fresh codes tried before giving up when minted lookup keys collide.
    pub max_mint_attempts: u32,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 48 * 60 * 60,
            max_ttl_secs: 30 * 24 * 60 * 60,
            kdf: KdfParams::default(),
            codes: CodeSettings::default(),
            store_retry: RetryPolicy::default(),
            max_mint_attempts: 5,
        }
    }
}

/// Input to [`ArtifactVault::create`].
pub struct NewArtifact {
    pub owner_scope_id: String,
    pub plaintext: Zeroizing<Vec<u8>>,
    pub ttl: Duration,
    pub position: Option<u32>,
    /// Caller-supplied secret. When absent the minted lookup key is the secret.
    pub secret_code: Option<Zeroizing<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedArtifact {
    pub lookup_key: String,
    pub metadata: ArtifactMetadata,
}

#[derive(Debug)]
pub struct OpenedArtifact {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub metadata: ArtifactMetadata,
}

/// Crypto fields of a record, decoded and checked for presence.
struct CryptoFields {
    ciphertext: Vec<u8>,
    nonce: Vec<u8>,
    kdf_salt: Vec<u8>,
}

/// Artifact vault backed by any [`RecordStore`].
///
/// Holds no secrets: every operation derives its key from the caller's secret
/// code and drops it before returning.
pub struct ArtifactVault<S: RecordStore> {
    store: Arc<S>,
    deriver: KeyDeriver,
    codes: Arc<dyn CodeGenerator>,
    settings: VaultSettings,
    derivations: AtomicU64,
}

impl<S: RecordStore + 'static> ArtifactVault<S> {
    pub fn new(
        store: Arc<S>,
        codes: Arc<dyn CodeGenerator>,
        settings: VaultSettings,
    ) -> Result<Self, VaultError> {
        let deriver = KeyDeriver::new(settings.kdf).map_err(VaultError::internal)?;
        Ok(Self {
            store,
            deriver,
            codes,
            settings,
            derivations: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Key derivations run so far, decoys included.
    pub fn derivations(&self) -> u64 {
        self.derivations.load(Ordering::Relaxed)
    }

    /// Encrypt and persist a new artifact. Nothing is written unless encryption
    /// succeeded.
    #[instrument(skip_all, fields(owner = %new.owner_scope_id))]
    pub async fn create(&self, new: NewArtifact) -> Result<CreatedArtifact, VaultError> {
        if new.ttl <= Duration::zero() {
            return Err(VaultError::validation("ttl must be positive"));
        }
        let max_attempts = self.settings.max_mint_attempts.max(1);
        for attempt in 1..=max_attempts {
            let lookup_key = self.codes.generate();
            let locator = self.locate(&lookup_key).await?;
            let secret = match &new.secret_code {
                Some(secret) => secret.clone(),
                None => Zeroizing::new(lookup_key.clone()),
            };

            let now = Utc::now();
            let id = Uuid::new_v4();
            let salt = generate_salt();
            let key = self.derive_key(&secret, salt.to_vec()).await?;
            let sealed = cipher::encrypt(&key, &new.plaintext, &aad(id, &new.owner_scope_id))
                .map_err(VaultError::internal)?;

            let record = ArtifactRecord {
                id,
                locator,
                owner_scope_id: new.owner_scope_id.clone(),
                ciphertext: URL_SAFE_NO_PAD.encode(&sealed.ciphertext),
                nonce: Some(URL_SAFE_NO_PAD.encode(sealed.nonce)),
                kdf_salt: Some(URL_SAFE_NO_PAD.encode(salt)),
                secret_hash: Some(secret_digest(&key, &salt)),
                created_at: now,
                updated_at: now,
                expires_at: now + new.ttl,
                revision_count: 0,
                position: new.position,
                status: ArtifactStatus::Active,
                schema_version: CURRENT_SCHEMA_VERSION,
            };

            let store = &self.store;
            let inserted = retry_with_backoff(
                &self.settings.store_retry,
                RecordStoreError::is_transient,
                || store.insert(&record),
            )
            .await;
            match inserted {
                Ok(()) => {
                    debug!(%id, "artifact created");
                    return Ok(CreatedArtifact {
                        lookup_key,
                        metadata: record.metadata(),
                    });
                }
                Err(RetryError::Fatal(RecordStoreError::Conflict)) => {
                    warn!(attempt, "minted lookup key collided, retrying");
                }
                Err(err) => return Err(map_retry_error(err)),
            }
        }
        Err(VaultError::RetryExhausted {
            attempts: max_attempts,
            reason: "could not mint an unused lookup key".to_string(),
        })
    }

    /// Store address of the artifact behind `lookup_key`.
    ///
    /// Derived with the same cost as a content key, so a copy of the data
    /// directory does not reveal lookup keys (which may double as secrets).
    pub async fn locate(&self, lookup_key: &str) -> Result<String, VaultError> {
        let key = self.derive_key(lookup_key, LOCATOR_SALT.to_vec()).await?;
        Ok(record_locator(&key))
    }

    /// Decrypt an artifact. Missing, expired, unreadable and wrong-secret cases
    /// all cost the same number of key derivations.
    #[instrument(skip_all)]
    pub async fn read(
        &self,
        lookup_key: &str,
        secret_code: &str,
    ) -> Result<OpenedArtifact, VaultError> {
        let (record, _key, plaintext) = self.open(lookup_key, secret_code).await?;
        Ok(OpenedArtifact {
            plaintext,
            metadata: record.metadata(),
        })
    }

    /// Re-encrypt an artifact under a fresh nonce and bump its revision.
    /// Last writer wins; `revision_count` lets callers detect staleness.
    #[instrument(skip_all)]
    pub async fn update(
        &self,
        lookup_key: &str,
        secret_code: &str,
        plaintext: &[u8],
        position: Option<u32>,
    ) -> Result<ArtifactMetadata, VaultError> {
        let (mut record, key, _previous) = self.open(lookup_key, secret_code).await?;

        let sealed = cipher::encrypt(&key, plaintext, &aad(record.id, &record.owner_scope_id))
            .map_err(VaultError::internal)?;
        record.ciphertext = URL_SAFE_NO_PAD.encode(&sealed.ciphertext);
        record.nonce = Some(URL_SAFE_NO_PAD.encode(sealed.nonce));
        record.updated_at = Utc::now();
        record.revision_count += 1;
        record.position = position;
        record.schema_version = CURRENT_SCHEMA_VERSION;

        let store = &self.store;
        let record_ref = &record;
        retry_with_backoff(
            &self.settings.store_retry,
            RecordStoreError::is_transient,
            || store.replace(record_ref),
        )
        .await
        .map_err(|err| match err {
            // Swept between read and write.
            RetryError::Fatal(RecordStoreError::NotFound) => VaultError::Expired {
                artifact_id: record.id,
            },
            other => map_retry_error(other),
        })?;
        debug!(id = %record.id, revision = record.revision_count, "artifact updated");
        Ok(record.metadata())
    }

    /// Remove an artifact. Returns the id of a live artifact that was removed,
    /// `None` if nothing live was there. Expired leftovers are removed too.
    #[instrument(skip_all)]
    pub async fn delete(&self, lookup_key: &str) -> Result<Option<Uuid>, VaultError> {
        let locator = self.locate(lookup_key).await?;
        let existing = match self.get_record(&locator).await {
            Ok(record) => Some(record),
            Err(VaultError::NotFound) => return Ok(None),
            // Corrupt records can still be removed.
            Err(VaultError::Schema { .. }) => None,
            Err(err) => return Err(err),
        };

        let store = &self.store;
        let removed = retry_with_backoff(
            &self.settings.store_retry,
            RecordStoreError::is_transient,
            || store.delete(&locator),
        )
        .await
        .map_err(map_retry_error)?;

        let live = existing.filter(|record| !record.is_expired_at(Utc::now()));
        Ok(match (removed, live) {
            (true, Some(record)) => Some(record.id),
            _ => None,
        })
    }

    /// Physically remove every expired artifact. Returns how many were removed.
    #[instrument(skip_all)]
    pub async fn sweep_expired(&self) -> Result<usize, VaultError> {
        let now = Utc::now();
        let keys = self
            .store
            .expired_keys(now)
            .await
            .map_err(map_store_error)?;
        let mut removed = 0;
        for key in keys {
            match self.store.delete(&key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(error = %err, "failed to remove expired artifact"),
            }
        }
        if removed > 0 {
            info!(removed, "expired artifacts swept");
        }
        Ok(removed)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `every` until the task is
    /// aborted.
    pub fn spawn_sweeper(self: Arc<Self>, every: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_expired().await {
                    warn!(error = %err, "periodic sweep failed");
                }
            }
        })
    }

    /// Load, authenticate and decrypt. Returns the record, its key and plaintext.
    async fn open(
        &self,
        lookup_key: &str,
        secret_code: &str,
    ) -> Result<(ArtifactRecord, DerivedKey, Zeroizing<Vec<u8>>), VaultError> {
        let locator = self.locate(lookup_key).await?;
        let record = match self.get_record(&locator).await {
            Ok(record) => record,
            Err(err @ (VaultError::NotFound | VaultError::Schema { .. })) => {
                self.decoy_derivation(secret_code).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if record.is_expired_at(Utc::now()) {
            self.schedule_removal(&locator);
            self.decoy_derivation(secret_code).await;
            return Err(VaultError::Expired {
                artifact_id: record.id,
            });
        }

        let fields = match crypto_fields(&record) {
            Ok(fields) => fields,
            Err(err) => {
                self.decoy_derivation(secret_code).await;
                return Err(err);
            }
        };
        let key = self
            .derive_key(secret_code, fields.kdf_salt.clone())
            .await?;
        let plaintext = cipher::decrypt(
            &key,
            &fields.ciphertext,
            &fields.nonce,
            &aad(record.id, &record.owner_scope_id),
        )
        .map_err(|err| match err {
            CryptoError::InvalidNonce { .. } => VaultError::Schema {
                artifact_id: Some(record.id),
                reason: err.to_string(),
            },
            _ => VaultError::Integrity {
                artifact_id: record.id,
            },
        })?;

        if let Some(stored) = &record.secret_hash {
            if !verify_digest(&key, &fields.kdf_salt, stored) {
                warn!(id = %record.id, "verification digest mismatch on decryptable artifact");
            }
        }
        Ok((record, key, plaintext))
    }

    async fn get_record(&self, locator: &str) -> Result<ArtifactRecord, VaultError> {
        let store = &self.store;
        retry_with_backoff(
            &self.settings.store_retry,
            RecordStoreError::is_transient,
            || store.get(locator),
        )
        .await
        .map_err(map_retry_error)
    }

    async fn derive_key(&self, secret: &str, salt: Vec<u8>) -> Result<DerivedKey, VaultError> {
        self.derivations.fetch_add(1, Ordering::Relaxed);
        let deriver = self.deriver.clone();
        let secret = Zeroizing::new(secret.as_bytes().to_vec());
        tokio::task::spawn_blocking(move || deriver.derive(&secret, &salt))
            .await
            .map_err(VaultError::internal)?
            .map_err(VaultError::internal)
    }

    /// Spend the same derivation cost as a real attempt so that absent or
    /// unreadable artifacts cannot be told apart from wrong secrets by timing.
    async fn decoy_derivation(&self, secret_code: &str) {
        if let Err(err) = self.derive_key(secret_code, DECOY_SALT.to_vec()).await {
            debug!(error = %err, "decoy derivation failed");
        }
    }

    fn schedule_removal(&self, locator: &str) {
        let store = Arc::clone(&self.store);
        let locator = locator.to_string();
        tokio::spawn(async move {
            if let Err(err) = store.delete(&locator).await {
                debug!(error = %err, "lazy removal of expired artifact failed");
            }
        });
    }
}

fn aad(id: Uuid, owner_scope_id: &str) -> Vec<u8> {
    format!("{AAD_DOMAIN}|{id}|{owner_scope_id}").into_bytes()
}

fn crypto_fields(record: &ArtifactRecord) -> Result<CryptoFields, VaultError> {
    let schema = |reason: &str| VaultError::Schema {
        artifact_id: Some(record.id),
        reason: reason.to_string(),
    };
    let nonce = record.nonce.as_deref().ok_or_else(|| schema("missing nonce"))?;
    let salt = record
        .kdf_salt
        .as_deref()
        .ok_or_else(|| schema("missing key derivation salt"))?;

    Ok(CryptoFields {
        ciphertext: URL_SAFE_NO_PAD
            .decode(&record.ciphertext)
            .map_err(|_| schema("ciphertext is not valid base64"))?,
        nonce: URL_SAFE_NO_PAD
            .decode(nonce)
            .map_err(|_| schema("nonce is not valid base64"))?,
        kdf_salt: URL_SAFE_NO_PAD
            .decode(salt)
            .map_err(|_| schema("salt is not valid base64"))?,
    })
}

fn map_store_error(err: RecordStoreError) -> VaultError {
    match err {
        RecordStoreError::NotFound => VaultError::NotFound,
        RecordStoreError::Corrupt { reason } => VaultError::Schema {
            artifact_id: None,
            reason,
        },
        other => VaultError::internal(other),
    }
}

fn map_retry_error(err: RetryError<RecordStoreError>) -> VaultError {
    match err {
        RetryError::Fatal(err) => map_store_error(err),
        RetryError::Exhausted { attempts, last } => VaultError::RetryExhausted {
            attempts,
            reason: last.to_string(),
        },
    }
}
