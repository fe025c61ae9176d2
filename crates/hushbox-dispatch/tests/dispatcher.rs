use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use hushbox_core::{
    collab::{AllowListScopeResolver, CodeGenerator, RandomCodeGenerator},
    storage::{InMemoryRecordStore, RecordStore},
};
use hushbox_dispatch::{DispatchSettings, Dispatcher, Response};
use hushbox_guard::{
    audit::{AuditEntry, MemoryAuditSink},
    rate_limit::{InMemoryCounterStore, RateLimitSettings},
    AuditLogger, AuditOperation, AuditOutcome, RateLimiter,
};
use hushbox_storage::key_derivation::KdfParams;
use hushbox_vault::{ArtifactVault, VaultSettings};
use serde_json::{json, Value};

const CALLER: Option<&str> = Some("203.0.113.9");

struct Harness {
    dispatcher: Dispatcher<InMemoryRecordStore>,
    store: InMemoryRecordStore,
    audit: MemoryAuditSink,
}

impl Harness {
    async fn send(&self, request: Value) -> Value {
        let response = self
            .dispatcher
            .handle_json(&request.to_string(), CALLER)
            .await;
        serde_json::to_value(response).expect("response serializes")
    }

    async fn entries(&self) -> Vec<AuditEntry> {
        self.dispatcher.audit().flush().await;
        self.audit.entries()
    }
}

/// Mints a fixed sequence of codes, then random ones.
struct FixedCodes(Mutex<Vec<&'static str>>);

impl CodeGenerator for FixedCodes {
    fn generate(&self) -> String {
        match self.0.lock().unwrap().pop() {
            Some(code) => code.to_string(),
            None => RandomCodeGenerator::default().generate(),
        }
    }
}

fn harness_with(
    codes: Arc<dyn CodeGenerator>,
    rate: RateLimitSettings,
    dispatch: DispatchSettings,
) -> Harness {
    let store = InMemoryRecordStore::new();
    let vault = ArtifactVault::new(
        Arc::new(store.clone()),
        codes,
        VaultSettings {
            kdf: KdfParams::light(),
            ..VaultSettings::default()
        },
    )
    .expect("vault");
    let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()), rate);
    let audit = MemoryAuditSink::new();
    let logger = AuditLogger::spawn(Arc::new(audit.clone()), 256);
    let dispatcher = Dispatcher::new(
        Arc::new(vault),
        Arc::new(limiter),
        logger,
        Arc::new(AllowListScopeResolver::new(["org-1"])),
        dispatch,
    );
    Harness {
        dispatcher,
        store,
        audit,
    }
}

fn harness() -> Harness {
    harness_with(
        Arc::new(RandomCodeGenerator::default()),
        RateLimitSettings {
            max_operations: 100,
            ..RateLimitSettings::default()
        },
        DispatchSettings::default(),
    )
}

async fn save(h: &Harness, payload: Value) -> String {
    let response = h
        .send(json!({
            "op": "save",
            "owner_scope_id": "org-1",
            "plaintext_payload": payload,
            "ttl_hint": "48h",
            "position": 2,
            "locale": "en"
        }))
        .await;
    assert_eq!(response["ok"], true, "save failed: {response}");
    response["artifact_lookup_key"]
        .as_str()
        .expect("lookup key")
        .to_string()
}

#[tokio::test]
async fn whistleblower_scenario() {
    let h = harness_with(
        Arc::new(FixedCodes(Mutex::new(vec!["DR-7F3K9Q"]))),
        RateLimitSettings::default(),
        DispatchSettings::default(),
    );
    let before = Utc::now();
    let saved = h
        .send(json!({
            "op": "save",
            "owner_scope_id": "org-1",
            "plaintext_payload": {"q1": "answer"},
            "ttl_hint": "48h"
        }))
        .await;
    assert_eq!(saved["ok"], true);
    assert_eq!(saved["artifact_lookup_key"], "DR-7F3K9Q");
    let expires_at: chrono::DateTime<Utc> =
        serde_json::from_value(saved["expires_at"].clone()).unwrap();
    let ttl = expires_at - before;
    assert!(ttl >= chrono::Duration::hours(48));
    assert!(ttl < chrono::Duration::hours(48) + chrono::Duration::minutes(1));

    let resumed = h
        .send(json!({
            "op": "resume",
            "artifact_lookup_key": "DR-7F3K9Q",
            "secret_code": "DR-7F3K9Q"
        }))
        .await;
    assert_eq!(resumed["ok"], true);
    assert_eq!(resumed["plaintext_payload"], json!({"q1": "answer"}));

    let wrong = h
        .send(json!({
            "op": "resume",
            "artifact_lookup_key": "DR-7F3K9Q",
            "secret_code": "WRONG"
        }))
        .await;
    assert_eq!(wrong["ok"], false);
    assert_eq!(wrong["kind"], "NotFoundOrExpired");
}

#[tokio::test]
async fn wrong_secret_and_unknown_key_are_indistinguishable() {
    let h = harness();
    let key = save(&h, json!({"report": "details"})).await;

    let wrong = h
        .send(json!({"op": "resume", "artifact_lookup_key": key, "secret_code": "WRONG"}))
        .await;
    let unknown = h
        .send(json!({"op": "resume", "artifact_lookup_key": "DR-222222", "secret_code": "WRONG"}))
        .await;
    assert_eq!(wrong, unknown);

    let entries = h.entries().await;
    let classes: Vec<_> = entries.iter().map(|e| e.error_class.as_deref()).collect();
    assert_eq!(classes, vec![None, Some("integrity"), Some("not_found")]);
}

#[tokio::test]
async fn resume_returns_metadata_and_update_bumps_revision() {
    let h = harness();
    let key = save(&h, json!({"step": 1})).await;

    let updated = h
        .send(json!({
            "op": "update",
            "artifact_lookup_key": key,
            "secret_code": key,
            "plaintext_payload": {"step": 2},
            "position": 5,
            "locale": "fr"
        }))
        .await;
    assert_eq!(updated["ok"], true);
    assert_eq!(updated["artifact_lookup_key"], key.as_str());
    assert_eq!(updated["revision_count"], 1);

    let resumed = h
        .send(json!({"op": "resume", "artifact_lookup_key": key, "secret_code": key}))
        .await;
    assert_eq!(resumed["plaintext_payload"], json!({"step": 2}));
    assert_eq!(resumed["position"], 5);
    assert_eq!(resumed["locale"], "fr");
    assert_eq!(resumed["revision_count"], 1);
}

#[tokio::test]
async fn update_with_wrong_secret_is_rejected() {
    let h = harness();
    let key = save(&h, json!({"step": 1})).await;
    let response = h
        .send(json!({
            "op": "update",
            "artifact_lookup_key": key,
            "secret_code": "WRONG",
            "plaintext_payload": {"step": 99}
        }))
        .await;
    assert_eq!(response["kind"], "NotFoundOrExpired");

    let resumed = h
        .send(json!({"op": "resume", "artifact_lookup_key": key, "secret_code": key}))
        .await;
    assert_eq!(resumed["plaintext_payload"], json!({"step": 1}));
}

#[tokio::test]
async fn expired_artifacts_read_as_absent() {
    let h = harness();
    let key = save(&h, json!({"old": true})).await;

    let locator = h.dispatcher.vault().locate(&key).await.unwrap();
    let mut record = h.store.get(&locator).await.unwrap();
    record.expires_at = Utc::now() - chrono::Duration::seconds(1);
    h.store.replace(&record).await.unwrap();

    let response = h
        .send(json!({"op": "resume", "artifact_lookup_key": key, "secret_code": key}))
        .await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["kind"], "NotFoundOrExpired");

    let entries = h.entries().await;
    let last = entries.last().unwrap();
    assert_eq!(last.error_class.as_deref(), Some("expired"));
    assert_eq!(last.artifact_id, Some(record.id));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let h = harness();
    let key = save(&h, json!({"bye": true})).await;

    let first = h
        .send(json!({"op": "delete", "artifact_lookup_key": key}))
        .await;
    assert_eq!(first, json!({"ok": true}));
    let second = h
        .send(json!({"op": "delete", "artifact_lookup_key": key}))
        .await;
    assert_eq!(second, json!({"ok": false}));
    let never = h
        .send(json!({"op": "delete", "artifact_lookup_key": "DR-333333"}))
        .await;
    assert_eq!(never, json!({"ok": false}));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn rate_limit_rejects_before_touching_the_vault() {
    let h = harness_with(
        Arc::new(RandomCodeGenerator::default()),
        RateLimitSettings {
            max_operations: 3,
            window_secs: 2,
            ..RateLimitSettings::default()
        },
        DispatchSettings::default(),
    );
    let key = save(&h, json!({"n": 1})).await;
    for _ in 0..2 {
        let response = h
            .send(json!({"op": "resume", "artifact_lookup_key": key, "secret_code": key}))
            .await;
        assert_eq!(response["ok"], true);
    }

    let limited = h
        .send(json!({"op": "delete", "artifact_lookup_key": key}))
        .await;
    assert_eq!(limited["ok"], false);
    assert_eq!(limited["kind"], "RateLimited");
    assert!(limited["reset_at"].is_string());
    assert_eq!(h.store.len(), 1, "rate limited delete must not run");

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let next_window = h
        .send(json!({"op": "resume", "artifact_lookup_key": key, "secret_code": key}))
        .await;
    assert_eq!(next_window["ok"], true);
}

#[tokio::test]
async fn validation_failures_are_reported_and_audited() {
    let h = harness();
    let cases = [
        json!({"op": "resume", "artifact_lookup_key": "not-a-key", "secret_code": "x"}),
        json!({"op": "resume", "artifact_lookup_key": "DR-7F3K9Q", "secret_code": "  "}),
        json!({"op": "save", "owner_scope_id": "org-2", "plaintext_payload": {"a": 1}}),
        json!({"op": "save", "owner_scope_id": "org-1", "plaintext_payload": {"a": 1}, "ttl_hint": "90d"}),
        json!({"op": "save", "owner_scope_id": "org-1", "plaintext_payload": null}),
        json!({"op": "save", "owner_scope_id": "org-1", "plaintext_payload": {"a": 1}, "locale": "en US"}),
        json!({"op": "explode"}),
    ];
    for case in &cases {
        let response = h.send(case.clone()).await;
        assert_eq!(response["kind"], "ValidationError", "case {case}");
    }
    assert!(h.store.is_empty());

    let entries = h.entries().await;
    assert_eq!(entries.len(), cases.len());
    assert!(entries
        .iter()
        .all(|e| e.outcome == AuditOutcome::Failure && e.error_class.as_deref() == Some("validation")));
    assert_eq!(entries.last().unwrap().operation, AuditOperation::Unrecognized);
}

#[tokio::test]
async fn oversized_payloads_are_rejected() {
    let h = harness_with(
        Arc::new(RandomCodeGenerator::default()),
        RateLimitSettings::default(),
        DispatchSettings {
            max_payload_bytes: 64,
            ..DispatchSettings::default()
        },
    );
    let response = h
        .send(json!({
            "op": "save",
            "owner_scope_id": "org-1",
            "plaintext_payload": {"text": "x".repeat(100)}
        }))
        .await;
    assert_eq!(response["kind"], "ValidationError");
}

#[tokio::test]
async fn timed_out_save_stores_nothing() {
    let h = harness_with(
        Arc::new(RandomCodeGenerator::default()),
        RateLimitSettings::default(),
        DispatchSettings {
            request_timeout_ms: 0,
            ..DispatchSettings::default()
        },
    );
    let response = h
        .send(json!({
            "op": "save",
            "owner_scope_id": "org-1",
            "plaintext_payload": {"a": 1}
        }))
        .await;
    assert_eq!(response["kind"], "InternalError");
    assert!(h.store.is_empty());
    let entries = h.entries().await;
    assert_eq!(entries[0].error_class.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn audit_has_one_content_free_entry_per_request() {
    let h = harness();
    let key = save(&h, json!({"witness": "Jane Roe saw the ledger"})).await;
    h.send(json!({"op": "resume", "artifact_lookup_key": key, "secret_code": key}))
        .await;
    h.send(json!({"op": "resume", "artifact_lookup_key": key, "secret_code": "hunter2-guess"}))
        .await;
    h.send(json!({
        "op": "update",
        "artifact_lookup_key": key,
        "secret_code": key,
        "plaintext_payload": {"witness": "amended statement"}
    }))
    .await;
    h.send(json!({"op": "delete", "artifact_lookup_key": key}))
        .await;
    h.send(json!({"op": "delete", "artifact_lookup_key": key}))
        .await;

    let entries = h.entries().await;
    let operations: Vec<_> = entries.iter().map(|e| e.operation).collect();
    assert_eq!(
        operations,
        vec![
            AuditOperation::Save,
            AuditOperation::Resume,
            AuditOperation::Resume,
            AuditOperation::Update,
            AuditOperation::Delete,
            AuditOperation::Delete,
        ]
    );
    assert!(entries.iter().all(|e| e.identity == "203.0.113.9"));
    for pair in entries.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].hash);
    }

    let dump = serde_json::to_string(&entries).unwrap();
    for needle in ["Jane Roe", "ledger", "amended", "hunter2", key.as_str()] {
        assert!(!dump.contains(needle), "audit trail leaked {needle}");
    }
}

#[tokio::test]
async fn handle_accepts_typed_requests() {
    let h = harness();
    let request = serde_json::from_value(json!({
        "op": "save",
        "owner_scope_id": "org-1",
        "plaintext_payload": [1, 2, 3]
    }))
    .unwrap();
    let response = h.dispatcher.handle(request, None).await;
    assert!(response.is_ok());
    assert!(matches!(response, Response::Saved(_)));
    assert_eq!(h.entries().await[0].identity, "unknown");
}
