//! Knowledge vault: aggregated observations about recurring merchants.
//!
//! Rows are keyed on `(kind, category, merchant_key)` where `merchant_key`
//! is the normalized merchant name. Every observation folds into the row as
//! a sample-count-weighted running average; the merge itself runs inside the
//! backend so concurrent observations of one key are never lost.
//!
//! Advice rows additionally carry an encrypted [`AdvicePayload`] bound (via
//! AAD) to `category` and `merchant_key`, so a payload copied onto another
//! row fails to decrypt instead of being silently reattached.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vaultline_storage::{
    Category, MemoryRecordBackend, Observation, RecordKind, RecordSource, VaultRecordBackend,
    VaultRow,
};

use crate::config::VaultConfig;
use crate::crypto::{EncryptedBlob, EnvelopeCipher};
use crate::error::{CryptoError, KnowledgeError};

/// Maximum length of a normalized merchant key, in characters.
pub const MERCHANT_KEY_MAX_LEN: usize = 80;

/// Maximum distinct merchants per batch lookup.
pub const BATCH_MAX_MERCHANTS: usize = 60;

/// Maximum distinct categories per batch lookup.
pub const BATCH_MAX_CATEGORIES: usize = 8;

/// Maximum rows returned by a batch lookup.
pub const BATCH_MAX_ROWS: usize = 400;

/// Normalize a merchant display name into its natural key.
///
/// Lowercases, replaces everything but ASCII letters, digits and whitespace
/// with a space, collapses whitespace, trims, and caps the result at
/// [`MERCHANT_KEY_MAX_LEN`] characters. An empty result means "no valid key".
#[must_use]
pub fn normalize_merchant(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                ' '
            }
        })
        .collect();
    let collapsed = mapped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MERCHANT_KEY_MAX_LEN).collect()
}

/// Associated data binding an advice payload to its row.
#[must_use]
pub fn advice_aad(category: Category, merchant_key: &str) -> String {
    format!("knowledge_vault:advice:v1:{category}:{merchant_key}")
}

/// Structured advice sealed into an advice row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvicePayload {
    #[serde(default = "advice_version")]
    pub v: u8,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub monthly_savings: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

const fn advice_version() -> u8 {
    1
}

impl AdvicePayload {
    /// Minimal advice with a title and the monthly savings it promises.
    #[must_use]
    pub fn new(title: impl Into<String>, monthly_savings: f64) -> Self {
        Self {
            v: advice_version(),
            title: title.into(),
            summary: None,
            monthly_savings,
            email_subject: None,
            email_body: None,
            provider_name: None,
            provider_url: None,
            rule: None,
            company: None,
        }
    }
}

/// Why an observation was not recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The merchant name normalizes to an empty key.
    EmptyMerchantKey,
    /// The observed value is NaN or infinite.
    NonFiniteValue,
    /// The observed value is zero or negative.
    NonPositiveValue,
}

/// Result of an upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// The observation was merged; the row as stored afterwards.
    Merged(VaultRow),
    Skipped { reason: SkipReason },
}

impl UpsertOutcome {
    #[must_use]
    pub fn row(&self) -> Option<&VaultRow> {
        match self {
            Self::Merged(row) => Some(row),
            Self::Skipped { .. } => None,
        }
    }
}

/// A decrypted advice row.
#[derive(Debug, Clone, PartialEq)]
pub struct AdviceRecord {
    pub row: VaultRow,
    pub payload: AdvicePayload,
}

/// Result of [`KnowledgeVault::find_advice_batch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdviceBatch {
    pub items: Vec<AdviceRecord>,
    /// Rows that failed to decrypt or failed the AAD binding.
    pub dropped: usize,
}

/// The knowledge vault store.
pub struct KnowledgeVault {
    cipher: EnvelopeCipher,
    backend: Arc<dyn VaultRecordBackend>,
}

impl KnowledgeVault {
    #[must_use]
    pub fn new(cipher: EnvelopeCipher, backend: Arc<dyn VaultRecordBackend>) -> Self {
        Self { cipher, backend }
    }

    /// Build the vault described by `config`: PostgreSQL when `DATABASE_URL`
    /// is set, otherwise an in-process table.
    ///
    /// # Errors
    ///
    /// Returns [`KnowledgeError::Storage`] if the configured database cannot
    /// be reached or its table cannot be created.
    pub async fn from_config(
        config: &VaultConfig,
        cipher: EnvelopeCipher,
    ) -> Result<Self, KnowledgeError> {
        let backend = record_backend(config).await?;
        Ok(Self::new(cipher, backend))
    }

    /// Fold one observation into the row for `(kind, category, merchant)`.
    ///
    /// The value is clamped to the kind's domain. A manual row stays manual.
    /// Incoming `notes` replace the stored notes; `None` keeps them.
    ///
    /// # Errors
    ///
    /// Returns [`KnowledgeError::Storage`] if the backend merge fails.
    pub async fn upsert(
        &self,
        kind: RecordKind,
        category: Category,
        merchant: &str,
        value: f64,
        source: RecordSource,
        notes: Option<&str>,
    ) -> Result<UpsertOutcome, KnowledgeError> {
        let merchant_key = normalize_merchant(merchant);
        if let Some(reason) = validate(&merchant_key, value) {
            debug!(%kind, %category, ?reason, "observation skipped");
            return Ok(UpsertOutcome::Skipped { reason });
        }

        let obs = Observation {
            kind,
            category,
            merchant: merchant.trim().to_owned(),
            merchant_key,
            value: kind.domain().clamp(value),
            source,
            notes: notes.map(str::trim).filter(|n| !n.is_empty()).map(str::to_owned),
            encrypted_payload: None,
        };
        let row = self.backend.merge(&obs).await?;
        debug!(%kind, %category, sample_count = row.sample_count, "observation merged");
        Ok(UpsertOutcome::Merged(row))
    }

    /// Seal `payload` bound to `(category, merchant_key)` and merge it into
    /// the advice row. The aggregate tracks the average monthly savings.
    ///
    /// # Errors
    ///
    /// - [`KnowledgeError::Crypto`] if no usable key is configured.
    /// - [`KnowledgeError::Storage`] if the backend merge fails.
    pub async fn upsert_advice(
        &self,
        category: Category,
        merchant: &str,
        payload: &AdvicePayload,
        source: RecordSource,
    ) -> Result<UpsertOutcome, KnowledgeError> {
        let merchant_key = normalize_merchant(merchant);
        if merchant_key.is_empty() {
            return Ok(UpsertOutcome::Skipped {
                reason: SkipReason::EmptyMerchantKey,
            });
        }
        if !payload.monthly_savings.is_finite() {
            return Ok(UpsertOutcome::Skipped {
                reason: SkipReason::NonFiniteValue,
            });
        }

        let aad = advice_aad(category, &merchant_key);
        let blob = self.cipher.encrypt_json(payload, Some(&aad))?;

        let obs = Observation {
            kind: RecordKind::Advice,
            category,
            merchant: merchant.trim().to_owned(),
            merchant_key,
            value: RecordKind::Advice.domain().clamp(payload.monthly_savings),
            source,
            notes: None,
            encrypted_payload: Some(blob.to_json()?),
        };
        let row = self.backend.merge(&obs).await?;
        debug!(%category, sample_count = row.sample_count, "advice merged");
        Ok(UpsertOutcome::Merged(row))
    }

    /// The active row for `(kind, category, merchant)`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`KnowledgeError::Storage`] if the lookup fails.
    pub async fn find_active(
        &self,
        kind: RecordKind,
        category: Category,
        merchant: &str,
    ) -> Result<Option<VaultRow>, KnowledgeError> {
        let merchant_key = normalize_merchant(merchant);
        if merchant_key.is_empty() {
            return Ok(None);
        }
        Ok(self.backend.find(kind, category, &merchant_key).await?)
    }

    /// Active rows matching any of `categories` and any of `merchants`.
    ///
    /// Inputs are deduplicated and bounded to [`BATCH_MAX_CATEGORIES`]
    /// categories and [`BATCH_MAX_MERCHANTS`] merchant keys (first seen
    /// wins); at most [`BATCH_MAX_ROWS`] rows come back, most recently seen
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`KnowledgeError::Storage`] if the lookup fails.
    pub async fn find_active_batch<S>(
        &self,
        kind: RecordKind,
        categories: &[Category],
        merchants: &[S],
    ) -> Result<Vec<VaultRow>, KnowledgeError>
    where
        S: AsRef<str>,
    {
        let mut wanted_categories: Vec<Category> = Vec::new();
        for category in categories {
            if !wanted_categories.contains(category) {
                wanted_categories.push(*category);
            }
        }
        wanted_categories.truncate(BATCH_MAX_CATEGORIES);

        let mut merchant_keys: Vec<String> = Vec::new();
        for key in merchants.iter().map(|m| normalize_merchant(m.as_ref())) {
            if !key.is_empty() && !merchant_keys.contains(&key) {
                merchant_keys.push(key);
            }
        }
        merchant_keys.truncate(BATCH_MAX_MERCHANTS);

        if wanted_categories.is_empty() || merchant_keys.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .backend
            .find_batch(kind, &wanted_categories, &merchant_keys, BATCH_MAX_ROWS)
            .await?)
    }

    /// Decrypt the advice for `(category, merchant)`.
    ///
    /// A missing row is `Ok(None)`. A row that fails the AAD binding or tag
    /// check is an error, never treated as absent.
    ///
    /// # Errors
    ///
    /// - [`KnowledgeError::Crypto`] with `AadMismatch`, `AuthenticationFailed`
    ///   or `InvalidEnvelope` for a misbound, tampered or malformed payload.
    /// - [`KnowledgeError::MalformedRow`] if the row carries no payload.
    /// - [`KnowledgeError::Storage`] if the lookup fails.
    pub async fn find_advice(
        &self,
        category: Category,
        merchant: &str,
    ) -> Result<Option<AdviceRecord>, KnowledgeError> {
        match self.find_active(RecordKind::Advice, category, merchant).await? {
            Some(row) => self.open_advice(row).map(Some),
            None => Ok(None),
        }
    }

    /// Decrypt advice for many merchants in one category.
    ///
    /// Unreadable rows are dropped and counted rather than failing the batch.
    ///
    /// # Errors
    ///
    /// - [`KnowledgeError::Crypto`] if no usable key is configured.
    /// - [`KnowledgeError::Storage`] if the lookup fails.
    pub async fn find_advice_batch<S>(
        &self,
        category: Category,
        merchants: &[S],
    ) -> Result<AdviceBatch, KnowledgeError>
    where
        S: AsRef<str>,
    {
        self.cipher
            .keys()
            .require_usable()
            .map_err(CryptoError::from)?;

        let rows = self
            .find_active_batch(RecordKind::Advice, &[category], merchants)
            .await?;

        let mut batch = AdviceBatch::default();
        for row in rows {
            let id = row.id;
            match self.open_advice(row) {
                Ok(record) => batch.items.push(record),
                Err(e) => {
                    warn!(row_id = %id, error = %e, "dropping unreadable advice row");
                    batch.dropped += 1;
                }
            }
        }
        if batch.dropped > 0 {
            warn!(%category, dropped = batch.dropped, kept = batch.items.len(), "advice batch partially readable");
        }
        Ok(batch)
    }

    fn open_advice(&self, row: VaultRow) -> Result<AdviceRecord, KnowledgeError> {
        let Some(raw) = row.encrypted_payload.as_deref() else {
            return Err(KnowledgeError::MalformedRow {
                id: row.id.to_string(),
                reason: "advice row carries no payload".to_owned(),
            });
        };
        let blob = EncryptedBlob::from_json(raw)?;
        let aad = advice_aad(row.category, &row.merchant_key);
        let payload = self.cipher.decrypt_json(&blob, Some(&aad))?;
        Ok(AdviceRecord { row, payload })
    }
}

impl std::fmt::Debug for KnowledgeVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeVault")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

fn validate(merchant_key: &str, value: f64) -> Option<SkipReason> {
    if merchant_key.is_empty() {
        Some(SkipReason::EmptyMerchantKey)
    } else if !value.is_finite() {
        Some(SkipReason::NonFiniteValue)
    } else if value <= 0.0 {
        Some(SkipReason::NonPositiveValue)
    } else {
        None
    }
}

#[cfg(feature = "postgres-backend")]
async fn record_backend(config: &VaultConfig) -> Result<Arc<dyn VaultRecordBackend>, KnowledgeError> {
    if let Some(url) = config.database_url.as_deref() {
        let backend = vaultline_storage::PostgresRecordBackend::connect(url).await?;
        info!("knowledge vault using postgres");
        return Ok(Arc::new(backend));
    }
    info!("knowledge vault using in-process table");
    Ok(Arc::new(MemoryRecordBackend::new()))
}

#[cfg(not(feature = "postgres-backend"))]
async fn record_backend(config: &VaultConfig) -> Result<Arc<dyn VaultRecordBackend>, KnowledgeError> {
    if config.database_url.is_some() {
        warn!("DATABASE_URL set but the postgres-backend feature is disabled");
    }
    info!("knowledge vault using in-process table");
    Ok(Arc::new(MemoryRecordBackend::new()))
}
