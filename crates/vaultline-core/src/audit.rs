//! Audit trail for verification and decision outcomes.
//!
//! Every decision produces one [`AuditEntry`], sealed with the process key
//! (no associated data: entries are self-contained) and appended as one line
//! to the preferred backend:
//!
//! 1. the shared list store, when configured and reachable;
//! 2. otherwise the local encrypted JSON-lines file;
//! 3. with no key at all, a clearly labeled plaintext file.
//!
//! The audit path never blocks the request it observes. Storage and key
//! failures become an [`AppendOutcome`], never an error.
//!
//! Retention differs per backend: the list store keeps the most recent
//! `audit_retention` entries (push and trim run as one atomic pipeline),
//! while both files grow without bound and must be rotated by operators.
//!
//! Reads do not merge backends. Once the list store answers a read, entries
//! that were written to the encrypted file while the list store was down are
//! not part of the readout; they remain only in the file.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vaultline_storage::{AuditLogBackend, FileLogBackend, ReadOrder};

use crate::config::VaultConfig;
use crate::crypto::{self, EncryptedBlob};
use crate::error::KeyError;
use crate::keys::{KeyMaterial, KeyResolver};

/// A decision outcome as handed in by the caller.
///
/// Payloads are expected to be scrubbed of secrets upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub request_id: String,
    pub ok: bool,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<serde_json::Value>,
    pub source: String,
}

impl AuditEvent {
    /// A successful, unblocked decision.
    #[must_use]
    pub fn allowed(
        request_id: impl Into<String>,
        domain: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            ok: true,
            blocked: false,
            reason: None,
            domain: domain.into(),
            verification: None,
            source: source.into(),
        }
    }

    /// A blocked decision with its reason.
    #[must_use]
    pub fn blocked(
        request_id: impl Into<String>,
        domain: impl Into<String>,
        source: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            ok: false,
            blocked: true,
            reason: Some(reason.into()),
            ..Self::allowed(request_id, domain, source)
        }
    }

    #[must_use]
    pub fn with_verification(mut self, verification: serde_json::Value) -> Self {
        self.verification = Some(verification);
        self
    }
}

/// A stamped audit entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub logged_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Where an entry was written or read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditStorage {
    ListStore,
    EncryptedFile,
    PlainFile,
}

impl AuditStorage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ListStore => "list-store",
            Self::EncryptedFile => "enc-file",
            Self::PlainFile => "plain-file",
        }
    }
}

impl fmt::Display for AuditStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an append landed somewhere other than the preferred encrypted store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedReason {
    /// No key is configured; the entry was written as plaintext.
    KeyUnavailable,
    /// Only a key that production policy rejects is configured; the entry was
    /// still encrypted with it and tagged `legacy`.
    WeakKey,
    /// The list store rejected the write; the entry went to the encrypted file.
    PrimaryUnavailable,
}

/// Result of [`AuditTrail::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Encrypted with a policy-compliant key and written to the preferred
    /// backend.
    Stored { storage: AuditStorage },
    /// Written, but in a degraded way. A weak key takes precedence over a
    /// list-store failover when both apply.
    Degraded {
        storage: AuditStorage,
        reason: DegradedReason,
    },
    /// Every backend tried rejected the entry.
    NotStored {
        attempted: AuditStorage,
        reason: String,
    },
}

impl AppendOutcome {
    /// Whether the entry was persisted anywhere.
    #[must_use]
    pub const fn ok(&self) -> bool {
        !matches!(self, Self::NotStored { .. })
    }

    /// The backend that took the entry (or was last tried).
    #[must_use]
    pub const fn storage(&self) -> AuditStorage {
        match self {
            Self::Stored { storage } | Self::Degraded { storage, .. } => *storage,
            Self::NotStored { attempted, .. } => *attempted,
        }
    }
}

/// One line read back from the audit log.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditRecord {
    /// An envelope that decrypted into an entry.
    Decrypted(AuditEntry),
    /// An envelope that could not be opened (no key, wrong key, tampering).
    Sealed {
        envelope: serde_json::Value,
        error: String,
    },
    /// A plaintext JSON line from before encryption was introduced, or from
    /// the degraded plaintext file.
    Legacy(serde_json::Value),
    /// A line that is not JSON at all.
    Raw(String),
}

impl AuditRecord {
    /// The entry, when the line is readable as one.
    #[must_use]
    pub fn entry(&self) -> Option<AuditEntry> {
        match self {
            Self::Decrypted(entry) => Some(entry.clone()),
            Self::Legacy(value) => serde_json::from_value(value.clone()).ok(),
            Self::Sealed { .. } | Self::Raw(_) => None,
        }
    }
}

/// Result of [`AuditTrail::read`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuditReadout {
    /// Backend the lines came from; `None` when nothing was found.
    pub storage: Option<AuditStorage>,
    /// Whether a key was available to open envelopes.
    pub encrypted: bool,
    pub order: ReadOrder,
    pub entries: Vec<AuditRecord>,
}

impl AuditReadout {
    fn empty() -> Self {
        Self {
            storage: None,
            encrypted: false,
            order: ReadOrder::NewestFirst,
            entries: Vec::new(),
        }
    }

    /// Storage descriptor, `none` when nothing was found.
    #[must_use]
    pub fn storage_name(&self) -> &'static str {
        self.storage.map_or("none", AuditStorage::as_str)
    }

    /// Entries reordered newest first regardless of backend.
    #[must_use]
    pub fn into_newest_first(mut self) -> Vec<AuditRecord> {
        if self.order == ReadOrder::StorageOrder {
            self.entries.reverse();
        }
        self.entries
    }
}

/// The audit trail store.
pub struct AuditTrail {
    keys: Arc<KeyResolver>,
    list_store: Option<Arc<dyn AuditLogBackend>>,
    encrypted_file: FileLogBackend,
    plain_file: FileLogBackend,
}

impl AuditTrail {
    /// Assemble a trail from explicit backends.
    #[must_use]
    pub fn new(
        keys: Arc<KeyResolver>,
        list_store: Option<Arc<dyn AuditLogBackend>>,
        encrypted_file: FileLogBackend,
        plain_file: FileLogBackend,
    ) -> Self {
        Self {
            keys,
            list_store,
            encrypted_file,
            plain_file,
        }
    }

    /// Build the trail described by `config`.
    ///
    /// An unreachable list store is logged and skipped; the trail then
    /// writes to the encrypted file.
    pub async fn from_config(config: &VaultConfig, keys: Arc<KeyResolver>) -> Self {
        let list_store = connect_list_store(config).await;
        Self::new(
            keys,
            list_store,
            FileLogBackend::new(config.audit_file_path(), AuditStorage::EncryptedFile.as_str()),
            FileLogBackend::new(config.audit_plain_file_path(), AuditStorage::PlainFile.as_str()),
        )
    }

    /// Whether appended entries are encrypted.
    #[must_use]
    pub fn encryption_enabled(&self) -> bool {
        self.keys.material().is_ok()
    }

    /// Stamp `event` and persist it. Never fails; see [`AppendOutcome`].
    pub async fn append(&self, event: AuditEvent) -> AppendOutcome {
        let entry = AuditEntry {
            logged_at: Utc::now(),
            event,
        };

        let (key, weak) = match self.keys.require_usable() {
            Ok(key) => (key, false),
            Err(KeyError::WeakKeyRejected { .. }) => match self.keys.material() {
                Ok(key) => (key, true),
                Err(_) => return self.append_plain(&entry).await,
            },
            Err(KeyError::Unavailable) => return self.append_plain(&entry).await,
        };

        let line = match seal_entry(key, &entry) {
            Ok(line) => line,
            Err(reason) => {
                warn!(request_id = %entry.event.request_id, %reason, "audit entry could not be sealed");
                return AppendOutcome::NotStored {
                    attempted: self.preferred_storage(),
                    reason,
                };
            }
        };
        if weak {
            warn!(
                request_id = %entry.event.request_id,
                "audit entry sealed with a passphrase-derived key rejected by production policy"
            );
        }

        let mut failover = false;
        if let Some(list_store) = &self.list_store {
            match list_store.append(&line).await {
                Ok(()) => return outcome(AuditStorage::ListStore, weak, false),
                Err(e) => {
                    warn!(backend = list_store.name(), error = %e, "audit list store write failed; falling back to encrypted file");
                    failover = true;
                }
            }
        }

        match self.encrypted_file.append(&line).await {
            Ok(()) => outcome(AuditStorage::EncryptedFile, weak, failover),
            Err(e) => {
                warn!(error = %e, "audit entry not stored");
                AppendOutcome::NotStored {
                    attempted: AuditStorage::EncryptedFile,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn append_plain(&self, entry: &AuditEntry) -> AppendOutcome {
        warn!(
            request_id = %entry.event.request_id,
            "no encryption key configured; writing audit entry as plaintext"
        );
        let written = match serde_json::to_string(entry) {
            Ok(line) => self.plain_file.append(&line).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match written {
            Ok(()) => AppendOutcome::Degraded {
                storage: AuditStorage::PlainFile,
                reason: DegradedReason::KeyUnavailable,
            },
            Err(reason) => {
                warn!(%reason, "plaintext audit entry not stored");
                AppendOutcome::NotStored {
                    attempted: AuditStorage::PlainFile,
                    reason,
                }
            }
        }
    }

    fn preferred_storage(&self) -> AuditStorage {
        if self.list_store.is_some() {
            AuditStorage::ListStore
        } else {
            AuditStorage::EncryptedFile
        }
    }

    /// Read up to `limit` recent entries from the first backend that has any.
    ///
    /// Order follows the backend: newest first for the list store, storage
    /// order (oldest of the window first) for files.
    pub async fn read(&self, limit: usize) -> AuditReadout {
        let key = self.keys.material().ok();

        if let Some(list_store) = &self.list_store {
            match list_store.read_recent(limit).await {
                Ok(lines) => {
                    return readout(AuditStorage::ListStore, list_store.order(), key, &lines);
                }
                Err(e) => warn!(backend = list_store.name(), error = %e, "audit list store read failed"),
            }
        }

        for (storage, file, key) in [
            (AuditStorage::EncryptedFile, &self.encrypted_file, key),
            (AuditStorage::PlainFile, &self.plain_file, None),
        ] {
            if !file.exists().await {
                continue;
            }
            match file.read_recent(limit).await {
                Ok(lines) => return readout(storage, file.order(), key, &lines),
                Err(e) => warn!(backend = %storage, error = %e, "audit file read failed"),
            }
        }

        debug!("no audit storage found");
        AuditReadout::empty()
    }
}

impl fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditTrail")
            .field("list_store", &self.list_store.as_ref().map(|b| b.name().to_owned()))
            .field("encrypted_file", &self.encrypted_file)
            .field("plain_file", &self.plain_file)
            .finish_non_exhaustive()
    }
}

fn outcome(storage: AuditStorage, weak: bool, failover: bool) -> AppendOutcome {
    if weak {
        AppendOutcome::Degraded {
            storage,
            reason: DegradedReason::WeakKey,
        }
    } else if failover {
        AppendOutcome::Degraded {
            storage,
            reason: DegradedReason::PrimaryUnavailable,
        }
    } else {
        AppendOutcome::Stored { storage }
    }
}

fn seal_entry(key: &KeyMaterial, entry: &AuditEntry) -> Result<String, String> {
    let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(entry).map_err(|e| e.to_string())?);
    crypto::seal(key, &plaintext, None)
        .and_then(|blob| blob.to_json())
        .map_err(|e| e.to_string())
}

fn readout(
    storage: AuditStorage,
    order: ReadOrder,
    key: Option<&KeyMaterial>,
    lines: &[String],
) -> AuditReadout {
    AuditReadout {
        storage: Some(storage),
        encrypted: key.is_some(),
        order,
        entries: lines.iter().map(|line| classify(line, key)).collect(),
    }
}

fn classify(line: &str, key: Option<&KeyMaterial>) -> AuditRecord {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return AuditRecord::Raw(line.to_owned());
    };
    if !EncryptedBlob::is_envelope(&value) {
        return AuditRecord::Legacy(value);
    }
    let Some(key) = key else {
        return AuditRecord::Sealed {
            envelope: value,
            error: KeyError::Unavailable.to_string(),
        };
    };

    let opened = serde_json::from_value::<EncryptedBlob>(value.clone())
        .map_err(|e| e.to_string())
        .and_then(|blob| crypto::open(key, &blob, None).map_err(|e| e.to_string()));
    match opened {
        Ok(plaintext) => {
            let plaintext = zeroize::Zeroizing::new(plaintext);
            if let Ok(entry) = serde_json::from_slice::<AuditEntry>(&plaintext) {
                AuditRecord::Decrypted(entry)
            } else {
                match serde_json::from_slice::<serde_json::Value>(&plaintext) {
                    Ok(inner) => AuditRecord::Legacy(inner),
                    Err(e) => AuditRecord::Sealed {
                        envelope: value,
                        error: e.to_string(),
                    },
                }
            }
        }
        Err(error) => AuditRecord::Sealed {
            envelope: value,
            error,
        },
    }
}

#[cfg(feature = "redis-backend")]
async fn connect_list_store(config: &VaultConfig) -> Option<Arc<dyn AuditLogBackend>> {
    let url = config.audit_redis_url.as_deref()?;
    match vaultline_storage::RedisListBackend::connect(url, &config.audit_list_key).await {
        Ok(backend) => {
            info!(key = %config.audit_list_key, retention = config.audit_retention, "audit list store connected");
            Some(Arc::new(backend.with_retention(config.audit_retention)))
        }
        Err(e) => {
            warn!(error = %e, "audit list store unreachable; using encrypted file");
            None
        }
    }
}

#[cfg(not(feature = "redis-backend"))]
async fn connect_list_store(config: &VaultConfig) -> Option<Arc<dyn AuditLogBackend>> {
    if config.audit_redis_url.is_some() {
        warn!("audit list store configured but the redis-backend feature is disabled");
    } else {
        info!("audit list store not configured; using encrypted file");
    }
    None
}
