use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version written by the current vault. Records without a version predate it.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Lifecycle status of a stored artifact.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    #[default]
    Active,
    Expired,
}

/// Encrypted artifact as persisted by a [`RecordStore`](crate::storage::RecordStore).
///
/// Binary fields are base64 (URL-safe, unpadded). The crypto fields are optional
/// only so that legacy records can still be loaded and reported as unreadable;
/// the vault always writes all of them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub id: Uuid,
    /// Store address: a one-way digest of the public lookup key. The lookup
    /// key may double as the secret code, so it is never persisted.
    pub locator: String,
    pub owner_scope_id: String,
    pub ciphertext: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub kdf_salt: Option<String>,
    #[serde(default)]
    pub secret_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub revision_count: u64,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub status: ArtifactStatus,
    #[serde(default)]
    pub schema_version: u32,
}

impl ArtifactRecord {
    /// Whether the record is logically absent at `now`, regardless of whether it
    /// has been physically removed yet.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ArtifactStatus::Expired || now >= self.expires_at
    }

    pub fn metadata(&self) -> ArtifactMetadata {
        ArtifactMetadata {
            id: self.id,
            owner_scope_id: self.owner_scope_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            revision_count: self.revision_count,
            position: self.position,
        }
    }
}

/// Non-secret lifecycle data returned alongside a decrypted payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactMetadata {
    pub id: Uuid,
    pub owner_scope_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revision_count: u64,
    pub position: Option<u32>,
}
