//! End-to-end scenarios through `VaultEngine::from_config`.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use vaultline_core::audit::{AuditStorage, DegradedReason};
use vaultline_core::credentials::{FallbackReason, TokenSource};
use vaultline_core::error::{CryptoError, ErrorKind};
use vaultline_core::{
    AdvicePayload, AppendOutcome, AuditEvent, EncryptedBlob, KeyMode, StoreOutcome,
    VaultConfig, VaultEngine,
};
use vaultline_storage::{Category, RecordKind, RecordSource};

fn config(dir: &tempfile::TempDir, vars: &[(&str, &str)]) -> VaultConfig {
    let data_dir = dir.path().to_string_lossy().into_owned();
    let mut map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    map.insert("VAULTLINE_DATA_DIR".to_owned(), data_dir);
    VaultConfig::from_lookup(|name| map.get(name).cloned())
}

fn strong_key() -> String {
    STANDARD.encode([11u8; 32])
}

#[tokio::test]
async fn concrete_scenario_through_engine() {
    let dir = tempfile::tempdir().unwrap();
    let key = strong_key();
    let engine = VaultEngine::from_config(&config(&dir, &[("VAULTLINE_ENC_KEY", &key)]))
        .await
        .unwrap();

    let blob = engine.cipher.encrypt_json(&json!({"ok": true}), Some("audit:v1")).unwrap();
    let wire: serde_json::Value = serde_json::from_str(&blob.to_json().unwrap()).unwrap();
    assert_eq!(wire["v"], 1);
    assert_eq!(wire["alg"], "aes-256-gcm");

    let reparsed = EncryptedBlob::from_json(&blob.to_json().unwrap()).unwrap();
    let back: serde_json::Value = engine.cipher.decrypt_json(&reparsed, Some("audit:v1")).unwrap();
    assert_eq!(back, json!({"ok": true}));

    let err = engine
        .cipher
        .decrypt_json::<serde_json::Value>(&reparsed, Some("audit:v2"))
        .unwrap_err();
    assert!(matches!(err, CryptoError::AadMismatch { .. }));
}

#[tokio::test]
async fn production_with_strong_key_and_no_database() {
    let dir = tempfile::tempdir().unwrap();
    let key = strong_key();
    let engine = VaultEngine::from_config(&config(
        &dir,
        &[("VAULTLINE_ENC_KEY", &key), ("VAULTLINE_ENV", "production")],
    ))
    .await
    .unwrap();
    assert!(engine.keys.encryption_enabled());

    let outcome = engine
        .audit
        .append(AuditEvent::allowed("req-1", "identity", "verifier"))
        .await;
    assert_eq!(
        outcome,
        AppendOutcome::Stored {
            storage: AuditStorage::EncryptedFile
        }
    );
    assert!(dir.path().join("verification_audit.enc.jsonl").exists());
    assert!(!dir.path().join("verification_audit.jsonl").exists());

    let err = engine
        .credentials
        .store("item-1", "access-token", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!dir.path().join("credential_tokens.json").exists());
}

#[tokio::test]
async fn production_passphrase_is_rejected_but_audit_survives() {
    let dir = tempfile::tempdir().unwrap();
    let engine = VaultEngine::from_config(&config(
        &dir,
        &[
            ("VAULTLINE_ENC_KEY", "a memorable passphrase"),
            ("VAULTLINE_ENV", "production"),
        ],
    ))
    .await
    .unwrap();

    let err = engine.keys.require_usable().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WeakKeyRejected);
    assert_eq!(engine.keys.material().unwrap().mode(), KeyMode::Legacy);

    let outcome = engine
        .audit
        .append(AuditEvent::blocked("req-2", "identity", "verifier", "weak id"))
        .await;
    assert_eq!(
        outcome,
        AppendOutcome::Degraded {
            storage: AuditStorage::EncryptedFile,
            reason: DegradedReason::WeakKey,
        }
    );

    let err = engine
        .knowledge
        .upsert_advice(
            Category::Phone,
            "Acme Mobile",
            &AdvicePayload::new("switch plan", 10.0),
            RecordSource::Engine,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WeakKeyRejected);
}

#[tokio::test]
async fn production_passphrase_with_override() {
    let dir = tempfile::tempdir().unwrap();
    let engine = VaultEngine::from_config(&config(
        &dir,
        &[
            ("VAULTLINE_ENC_KEY", "a memorable passphrase"),
            ("VAULTLINE_ENV", "production"),
            ("VAULTLINE_ALLOW_LEGACY_KEYS", "1"),
        ],
    ))
    .await
    .unwrap();
    assert!(engine.keys.encryption_enabled());
}

#[tokio::test]
async fn development_without_key() {
    let dir = tempfile::tempdir().unwrap();
    let engine = VaultEngine::from_config(&config(&dir, &[])).await.unwrap();
    assert!(!engine.keys.encryption_enabled());

    let outcome = engine
        .audit
        .append(AuditEvent::allowed("req-3", "billing", "worker"))
        .await;
    assert_eq!(
        outcome,
        AppendOutcome::Degraded {
            storage: AuditStorage::PlainFile,
            reason: DegradedReason::KeyUnavailable,
        }
    );
    let readout = engine.audit.read(10).await;
    assert_eq!(readout.storage_name(), "plain-file");
    assert_eq!(readout.entries[0].entry().unwrap().event.request_id, "req-3");

    let stored = engine
        .credentials
        .store("item-1", "dev-token", Some("owner"))
        .await
        .unwrap();
    assert_eq!(
        stored,
        StoreOutcome::DevFallback {
            reason: FallbackReason::NoKey
        }
    );
    let tokens = engine.credentials.read_all(None).await.unwrap();
    assert_eq!(tokens.source, TokenSource::DevFile);
    assert_eq!(tokens.tokens[0].access_token, "dev-token");
}

#[tokio::test]
async fn fallback_key_slot_reads_what_primary_wrote() {
    let dir = tempfile::tempdir().unwrap();
    let key = strong_key();

    let writer = VaultEngine::from_config(&config(&dir, &[("VAULTLINE_ENC_KEY", &key)]))
        .await
        .unwrap();
    writer
        .audit
        .append(AuditEvent::allowed("req-4", "billing", "worker"))
        .await;

    let reader = VaultEngine::from_config(&config(
        &dir,
        &[
            ("VAULTLINE_FALLBACK_ENC_KEY", &key),
            ("VAULTLINE_ALLOW_FALLBACK_KEY", "true"),
        ],
    ))
    .await
    .unwrap();
    let readout = reader.audit.read(10).await;
    assert_eq!(readout.storage, Some(AuditStorage::EncryptedFile));
    assert!(readout.encrypted);
    assert_eq!(readout.entries[0].entry().unwrap().event.request_id, "req-4");
}

#[tokio::test]
async fn knowledge_vault_in_process() {
    let dir = tempfile::tempdir().unwrap();
    let key = strong_key();
    let engine = VaultEngine::from_config(&config(&dir, &[("VAULTLINE_ENC_KEY", &key)]))
        .await
        .unwrap();

    for value in [0.20, 0.30, 0.25] {
        engine
            .knowledge
            .upsert(
                RecordKind::Pattern,
                Category::Insurance,
                "Shield Mutual",
                value,
                RecordSource::Engine,
                None,
            )
            .await
            .unwrap();
    }
    let outcome = engine
        .knowledge
        .upsert(
            RecordKind::Pattern,
            Category::Insurance,
            "Shield Mutual",
            0.25,
            RecordSource::Manual,
            Some("verified by ops"),
        )
        .await
        .unwrap();
    let row = outcome.row().unwrap();
    assert_eq!(row.sample_count, 4);
    assert!((row.aggregate - 0.25).abs() < 1e-9);
    assert_eq!(row.source, RecordSource::Manual);

    engine
        .knowledge
        .upsert_advice(
            Category::Insurance,
            "Shield Mutual",
            &AdvicePayload::new("bundle home and auto", 18.0),
            RecordSource::Engine,
        )
        .await
        .unwrap();
    let batch = engine
        .knowledge
        .find_advice_batch(Category::Insurance, &["shield mutual", "Unknown Co"])
        .await
        .unwrap();
    assert_eq!(batch.items.len(), 1);
    assert_eq!(batch.dropped, 0);
    assert_eq!(batch.items[0].payload.title, "bundle home and auto");
}
