use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Internal error taxonomy of the vault and dispatcher.
///
/// `NotFound`, `Expired` and `Integrity` stay distinct here so the audit trail
/// can tell them apart; callers only ever see [`ErrorKind`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("invalid request: {reason}")]
    Validation { reason: String },
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },
    #[error("artifact not found")]
    NotFound,
    #[error("artifact expired")]
    Expired { artifact_id: Uuid },
    #[error("artifact failed authentication")]
    Integrity { artifact_id: Uuid },
    #[error("record cannot be decrypted: {reason}")]
    Schema {
        artifact_id: Option<Uuid>,
        reason: String,
    },
    #[error("gave up after {attempts} attempts: {reason}")]
    RetryExhausted { attempts: u32, reason: String },
    #[error("request timed out")]
    Timeout,
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl VaultError {
    pub fn validation(reason: impl Into<String>) -> Self {
        VaultError::Validation {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl ToString) -> Self {
        VaultError::Internal {
            reason: reason.to_string(),
        }
    }

    /// Kind exposed to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Validation { .. } => ErrorKind::ValidationError,
            VaultError::RateLimited { .. } => ErrorKind::RateLimited,
            VaultError::NotFound | VaultError::Expired { .. } | VaultError::Integrity { .. } => {
                ErrorKind::NotFoundOrExpired
            }
            VaultError::Schema { .. } => ErrorKind::SchemaError,
            VaultError::RetryExhausted { .. } | VaultError::Timeout | VaultError::Internal { .. } => {
                ErrorKind::InternalError
            }
        }
    }

    /// Artifact the failure is attributable to, when the record was found.
    pub fn artifact_id(&self) -> Option<Uuid> {
        match self {
            VaultError::Expired { artifact_id } | VaultError::Integrity { artifact_id } => {
                Some(*artifact_id)
            }
            VaultError::Schema { artifact_id, .. } => *artifact_id,
            _ => None,
        }
    }

    /// Fine-grained class recorded in the audit trail.
    pub fn class(&self) -> &'static str {
        match self {
            VaultError::Validation { .. } => "validation",
            VaultError::RateLimited { .. } => "rate_limited",
            VaultError::NotFound => "not_found",
            VaultError::Expired { .. } => "expired",
            VaultError::Integrity { .. } => "integrity",
            VaultError::Schema { .. } => "schema",
            VaultError::RetryExhausted { .. } => "retry_exhausted",
            VaultError::Timeout => "timeout",
            VaultError::Internal { .. } => "internal",
        }
    }
}

/// Error kinds visible in responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    ValidationError,
    RateLimited,
    NotFoundOrExpired,
    SchemaError,
    InternalError,
}

impl ErrorKind {
    /// Message safe to show to a caller. Carries no internal detail.
    pub fn public_message(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "The request is malformed.",
            ErrorKind::RateLimited => "Too many attempts. Try again later.",
            ErrorKind::NotFoundOrExpired => "No matching entry was found.",
            ErrorKind::SchemaError => {
                "This entry was stored in an old format and cannot be decrypted. Please contact support."
            }
            ErrorKind::InternalError => "Something went wrong. Please try again.",
        }
    }
}
