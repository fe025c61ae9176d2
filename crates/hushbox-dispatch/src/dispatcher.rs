use std::{sync::Arc, time::Duration};

use hushbox_core::{
    collab::OwnerScopeResolver, error::VaultError, storage::RecordStore,
};
use hushbox_guard::{
    normalize_identity, AuditEvent, AuditLogger, AuditOperation, AuditOutcome, RateLimiter,
};
use hushbox_vault::{ttl::parse_ttl_hint, ArtifactVault, NewArtifact};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    request::{
        DeleteRequest, Request, ResumeRequest, SaveRequest, SealedDocument, SecretCode,
        UpdateRequest,
    },
    response::{DeletedBody, Response, ResumedBody, SavedBody},
};

const MAX_LOCALE_LEN: usize = 35;
const MAX_SECRET_LEN: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchSettings {
    pub request_timeout_ms: u64,
    /// Upper bound on the serialized `plaintext_payload`.
    pub max_payload_bytes: usize,
    /// Owner scopes accepted on `save`. Empty accepts any non-empty scope.
    pub allowed_scopes: Vec<String>,
    pub audit_queue_capacity: usize,
    pub sweep_interval_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            max_payload_bytes: 256 * 1024,
            allowed_scopes: Vec::new(),
            audit_queue_capacity: 1024,
            sweep_interval_secs: 10 * 60,
        }
    }
}

/// Result of a successfully executed operation, before auditing.
struct Executed {
    response: Response,
    artifact_id: Option<Uuid>,
    /// Set when the operation completed but did not do what was asked.
    miss_class: Option<&'static str>,
}

impl Executed {
    fn hit(response: Response, artifact_id: Uuid) -> Self {
        Self {
            response,
            artifact_id: Some(artifact_id),
            miss_class: None,
        }
    }
}

/// Stateless entry point. Every request is rate checked, validated, executed
/// and audited exactly once, in that order, whatever happens along the way.
pub struct Dispatcher<S: RecordStore + 'static> {
    vault: Arc<ArtifactVault<S>>,
    limiter: Arc<RateLimiter>,
    audit: AuditLogger,
    scopes: Arc<dyn OwnerScopeResolver>,
    settings: DispatchSettings,
}

impl<S: RecordStore + 'static> Dispatcher<S> {
    pub fn new(
        vault: Arc<ArtifactVault<S>>,
        limiter: Arc<RateLimiter>,
        audit: AuditLogger,
        scopes: Arc<dyn OwnerScopeResolver>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            vault,
            limiter,
            audit,
            scopes,
            settings,
        }
    }

    pub fn vault(&self) -> &Arc<ArtifactVault<S>> {
        &self.vault
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Handle a raw JSON request. Unparseable input still passes the rate
    /// check and is audited as unrecognized.
    pub async fn handle_json(&self, raw: &str, identity: Option<&str>) -> Response {
        match serde_json::from_str::<Request>(raw) {
            Ok(request) => self.handle(request, identity).await,
            Err(err) => {
                let reason = format!(
                    "malformed request at line {} column {}",
                    err.line(),
                    err.column()
                );
                self.run(AuditOperation::Unrecognized, Err(VaultError::validation(reason)), identity)
                    .await
            }
        }
    }

    pub async fn handle(&self, request: Request, identity: Option<&str>) -> Response {
        self.run(request.operation(), Ok(request), identity).await
    }

    #[instrument(skip_all, fields(op = ?operation))]
    async fn run(
        &self,
        operation: AuditOperation,
        request: Result<Request, VaultError>,
        identity: Option<&str>,
    ) -> Response {
        let identity = normalize_identity(identity);
        let result = self.process(request, identity).await;

        let (response, event) = match result {
            Ok(executed) => {
                let event = AuditEvent {
                    operation,
                    artifact_id: executed.artifact_id,
                    identity: identity.to_string(),
                    outcome: if executed.miss_class.is_some() {
                        AuditOutcome::Failure
                    } else {
                        AuditOutcome::Success
                    },
                    error_class: executed.miss_class,
                };
                (executed.response, event)
            }
            Err(err) => {
                debug!(class = err.class(), "operation failed");
                let event = AuditEvent {
                    operation,
                    artifact_id: err.artifact_id(),
                    identity: identity.to_string(),
                    outcome: AuditOutcome::Failure,
                    error_class: Some(err.class()),
                };
                (Response::error(&err), event)
            }
        };

        info!(outcome = ?event.outcome, class = event.error_class, "request handled");
        self.audit.record(event);
        response
    }

    async fn process(
        &self,
        request: Result<Request, VaultError>,
        identity: &str,
    ) -> Result<Executed, VaultError> {
        let decision = self
            .limiter
            .check(Some(identity))
            .await
            .map_err(VaultError::internal)?;
        if !decision.allowed {
            return Err(VaultError::RateLimited {
                reset_at: decision.reset_at,
            });
        }

        let request = request?;
        self.validate(&request)?;

        let timeout = Duration::from_millis(self.settings.request_timeout_ms);
        tokio::time::timeout(timeout, self.execute(request))
            .await
            .map_err(|_| VaultError::Timeout)?
    }

    fn validate(&self, request: &Request) -> Result<(), VaultError> {
        match request {
            Request::Save(req) => {
                self.validate_payload(&req.plaintext_payload)?;
                validate_locale(req.locale.as_deref())?;
                if let Some(secret) = &req.secret_code {
                    validate_secret(secret)?;
                }
                Ok(())
            }
            Request::Resume(req) => {
                self.validate_lookup_key(&req.artifact_lookup_key)?;
                validate_secret(&req.secret_code)
            }
            Request::Update(req) => {
                self.validate_lookup_key(&req.artifact_lookup_key)?;
                validate_secret(&req.secret_code)?;
                self.validate_payload(&req.plaintext_payload)?;
                validate_locale(req.locale.as_deref())
            }
            Request::Delete(req) => self.validate_lookup_key(&req.artifact_lookup_key),
        }
    }

    fn validate_lookup_key(&self, lookup_key: &str) -> Result<(), VaultError> {
        if self.vault.settings().codes.matches(lookup_key) {
            Ok(())
        } else {
            Err(VaultError::validation("malformed artifact lookup key"))
        }
    }

    fn validate_payload(&self, payload: &serde_json::Value) -> Result<(), VaultError> {
        if payload.is_null() {
            return Err(VaultError::validation("plaintext_payload is required"));
        }
        let size = serde_json::to_vec(payload)
            .map_err(VaultError::internal)?
            .len();
        if size > self.settings.max_payload_bytes {
            return Err(VaultError::validation(format!(
                "payload of {size} bytes exceeds limit of {}",
                self.settings.max_payload_bytes
            )));
        }
        Ok(())
    }

    async fn execute(&self, request: Request) -> Result<Executed, VaultError> {
        match request {
            Request::Save(req) => self.save(req).await,
            Request::Resume(req) => self.resume(req).await,
            Request::Update(req) => self.update(req).await,
            Request::Delete(req) => self.delete(req).await,
        }
    }

    async fn save(&self, req: SaveRequest) -> Result<Executed, VaultError> {
        let owner_scope_id = self.scopes.resolve(&req.owner_scope_id).await?;
        let vault_settings = self.vault.settings();
        let ttl = parse_ttl_hint(
            req.ttl_hint.as_deref(),
            vault_settings.default_ttl_secs,
            vault_settings.max_ttl_secs,
        )?;
        let plaintext = seal(req.plaintext_payload, req.locale)?;

        let created = self
            .vault
            .create(NewArtifact {
                owner_scope_id,
                plaintext,
                ttl,
                position: req.position,
                secret_code: req
                    .secret_code
                    .map(|secret| Zeroizing::new(secret.expose().to_string())),
            })
            .await?;

        Ok(Executed::hit(
            Response::Saved(SavedBody {
                ok: true,
                artifact_lookup_key: created.lookup_key,
                expires_at: created.metadata.expires_at,
                revision_count: created.metadata.revision_count,
            }),
            created.metadata.id,
        ))
    }

    async fn resume(&self, req: ResumeRequest) -> Result<Executed, VaultError> {
        let opened = self
            .vault
            .read(&req.artifact_lookup_key, req.secret_code.expose())
            .await?;
        let id = opened.metadata.id;
        let document = SealedDocument::decode(&opened.plaintext).map_err(|_| VaultError::Schema {
            artifact_id: Some(id),
            reason: "decrypted payload is not a JSON document".to_string(),
        })?;

        Ok(Executed::hit(
            Response::Resumed(ResumedBody {
                ok: true,
                plaintext_payload: document.payload,
                position: opened.metadata.position,
                locale: document.locale,
                expires_at: opened.metadata.expires_at,
                revision_count: opened.metadata.revision_count,
            }),
            id,
        ))
    }

    async fn update(&self, req: UpdateRequest) -> Result<Executed, VaultError> {
        let plaintext = seal(req.plaintext_payload, req.locale)?;
        let metadata = self
            .vault
            .update(
                &req.artifact_lookup_key,
                req.secret_code.expose(),
                &plaintext,
                req.position,
            )
            .await?;

        Ok(Executed::hit(
            Response::Saved(SavedBody {
                ok: true,
                artifact_lookup_key: req.artifact_lookup_key,
                expires_at: metadata.expires_at,
                revision_count: metadata.revision_count,
            }),
            metadata.id,
        ))
    }

    async fn delete(&self, req: DeleteRequest) -> Result<Executed, VaultError> {
        Ok(match self.vault.delete(&req.artifact_lookup_key).await? {
            Some(id) => Executed::hit(Response::Deleted(DeletedBody { ok: true }), id),
            None => Executed {
                response: Response::Deleted(DeletedBody { ok: false }),
                artifact_id: None,
                miss_class: Some(VaultError::NotFound.class()),
            },
        })
    }
}

fn seal(
    payload: serde_json::Value,
    locale: Option<String>,
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    serde_json::to_vec(&SealedDocument::new(payload, locale))
        .map(Zeroizing::new)
        .map_err(VaultError::internal)
}

fn validate_secret(secret: &SecretCode) -> Result<(), VaultError> {
    let secret = secret.expose();
    if secret.trim().is_empty() {
        return Err(VaultError::validation("secret_code must not be empty"));
    }
    if secret.len() > MAX_SECRET_LEN {
        return Err(VaultError::validation("secret_code is too long"));
    }
    Ok(())
}

fn validate_locale(locale: Option<&str>) -> Result<(), VaultError> {
    match locale {
        None => Ok(()),
        Some(locale)
            if !locale.is_empty()
                && locale.len() <= MAX_LOCALE_LEN
                && locale
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
        {
            Ok(())
        }
        Some(_) => Err(VaultError::validation("malformed locale")),
    }
}
