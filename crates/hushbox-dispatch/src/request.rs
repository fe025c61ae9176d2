use hushbox_guard::AuditOperation;
use serde::{Deserialize, Deserializer, Serialize};
use zeroize::Zeroizing;

/// Caller-held secret. Redacted in `Debug`, wiped on drop.
#[derive(Clone)]
pub struct SecretCode(Zeroizing<String>);

impl SecretCode {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCode(..)")
    }
}

impl<'de> Deserialize<'de> for SecretCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretCode::new)
    }
}

/// Incoming request, addressed by its `"op"` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Save(SaveRequest),
    Resume(ResumeRequest),
    Update(UpdateRequest),
    Delete(DeleteRequest),
}

impl Request {
    pub fn operation(&self) -> AuditOperation {
        match self {
            Request::Save(_) => AuditOperation::Save,
            Request::Resume(_) => AuditOperation::Resume,
            Request::Update(_) => AuditOperation::Update,
            Request::Delete(_) => AuditOperation::Delete,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveRequest {
    pub owner_scope_id: String,
    pub plaintext_payload: serde_json::Value,
    #[serde(default)]
    pub ttl_hint: Option<String>,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub locale: Option<String>,
    /// Supply the secret instead of having one minted.
    #[serde(default)]
    pub secret_code: Option<SecretCode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumeRequest {
    pub artifact_lookup_key: String,
    pub secret_code: SecretCode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    pub artifact_lookup_key: String,
    pub secret_code: SecretCode,
    pub plaintext_payload: serde_json::Value,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteRequest {
    pub artifact_lookup_key: String,
}

pub(crate) const ENVELOPE_VERSION: u8 = 1;

/// What actually gets encrypted: the opaque payload plus the caller's locale.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SealedDocument {
    pub v: u8,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl SealedDocument {
    pub fn new(payload: serde_json::Value, locale: Option<String>) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            payload,
            locale,
        }
    }

    /// Decode stored plaintext. Records written before the envelope existed
    /// hold the bare payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        match serde_json::from_slice::<SealedDocument>(bytes) {
            Ok(doc) if doc.v == ENVELOPE_VERSION => Ok(doc),
            _ => serde_json::from_slice(bytes).map(|payload| SealedDocument::new(payload, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_tagged_requests() {
        let save: Request = serde_json::from_value(json!({
            "op": "save",
            "owner_scope_id": "org-1",
            "plaintext_payload": {"q1": "answer"},
            "ttl_hint": "48h"
        }))
        .unwrap();
        assert_eq!(save.operation(), AuditOperation::Save);

        let resume: Request = serde_json::from_value(json!({
            "op": "resume",
            "artifact_lookup_key": "DR-7F3K9Q",
            "secret_code": "DR-7F3K9Q"
        }))
        .unwrap();
        assert_eq!(resume.operation(), AuditOperation::Resume);

        assert!(serde_json::from_value::<Request>(json!({"op": "drop_table"})).is_err());
    }

    #[test]
    fn debug_output_hides_secret() {
        let request: Request = serde_json::from_value(json!({
            "op": "resume",
            "artifact_lookup_key": "DR-7F3K9Q",
            "secret_code": "hunter2-very-secret"
        }))
        .unwrap();
        assert!(!format!("{request:?}").contains("hunter2"));
    }

    #[test]
    fn envelope_round_trip_and_legacy_payloads() {
        let doc = SealedDocument::new(json!({"q1": "answer"}), Some("de-CH".into()));
        let bytes = serde_json::to_vec(&doc).unwrap();
        let decoded = SealedDocument::decode(&bytes).unwrap();
        assert_eq!(decoded.payload, json!({"q1": "answer"}));
        assert_eq!(decoded.locale.as_deref(), Some("de-CH"));

        let legacy = SealedDocument::decode(br#"{"payload": 3}"#).unwrap();
        assert_eq!(legacy.payload, json!({"payload": 3}));
        assert_eq!(legacy.locale, None);

        assert!(SealedDocument::decode(b"\xff\xfe").is_err());
    }
}
