use chrono::{DateTime, Utc};
use hushbox_core::error::{ErrorKind, VaultError};
use serde::Serialize;

/// Outgoing response. Serializes to a flat JSON object with an `ok` field.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Response {
    Saved(SavedBody),
    Resumed(ResumedBody),
    Deleted(DeletedBody),
    Error(ErrorBody),
}

impl Response {
    pub fn is_ok(&self) -> bool {
        match self {
            Response::Saved(body) => body.ok,
            Response::Resumed(body) => body.ok,
            Response::Deleted(body) => body.ok,
            Response::Error(_) => false,
        }
    }

    /// Caller-safe rendering of an error: kind and a fixed message only.
    pub fn error(err: &VaultError) -> Self {
        let kind = err.kind();
        Response::Error(ErrorBody {
            ok: false,
            kind,
            message: kind.public_message().to_string(),
            reset_at: match err {
                VaultError::RateLimited { reset_at } => Some(*reset_at),
                _ => None,
            },
        })
    }
}

/// Answer to `save` and `update`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SavedBody {
    pub ok: bool,
    pub artifact_lookup_key: String,
    pub expires_at: DateTime<Utc>,
    pub revision_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResumedBody {
    pub ok: bool,
    pub plaintext_payload: serde_json::Value,
    pub position: Option<u32>,
    pub locale: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub revision_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeletedBody {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub ok: bool,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}
