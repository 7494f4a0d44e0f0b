//! Credential store: one encrypted access token per external item.
//!
//! Production is fail-closed. A token is only ever written sealed, into the
//! relational store, under a policy-compliant key; anything less is a
//! [`CredentialError::Configuration`]. Outside production the store keeps
//! local development working by falling back to a plaintext
//! [`DevTokenFile`] when the key or the database is missing, or when the
//! database write fails.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use vaultline_storage::{DevTokenFile, PlainTokenRow, TokenBackend, TokenRow};

use crate::config::{Environment, VaultConfig};
use crate::crypto::{EncryptedBlob, EnvelopeCipher};
use crate::error::{CredentialError, CryptoError};

/// A decrypted token.
#[derive(Clone, PartialEq, Eq)]
pub struct StoredToken {
    pub item_id: String,
    pub owner_id: Option<String>,
    pub access_token: String,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredToken")
            .field("item_id", &self.item_id)
            .field("owner_id", &self.owner_id)
            .field("access_token", &"[REDACTED]")
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl From<PlainTokenRow> for StoredToken {
    fn from(row: PlainTokenRow) -> Self {
        Self {
            item_id: row.item_id,
            owner_id: row.owner_id,
            access_token: row.access_token,
            updated_at: row.updated_at,
        }
    }
}

/// Why a development write went to the plaintext file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    NoKey,
    NoDatabase,
    DatabaseWriteFailed,
}

/// Result of [`CredentialStore::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Sealed and upserted into the relational store.
    Encrypted,
    /// Written in plaintext to the developer file. Never happens in
    /// production.
    DevFallback { reason: FallbackReason },
}

/// Where a readout came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Database,
    DevFile,
    /// Database rows plus development writes that never reached it.
    DatabaseAndDevFile,
    /// Nothing could be read (filtered read without a database).
    None,
}

/// Result of [`CredentialStore::read_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenReadout {
    pub tokens: Vec<StoredToken>,
    /// Rows that failed to decrypt and were left out.
    pub dropped: usize,
    pub source: TokenSource,
}

impl TokenReadout {
    fn empty() -> Self {
        Self {
            tokens: Vec::new(),
            dropped: 0,
            source: TokenSource::None,
        }
    }

    fn dev_file(rows: Vec<PlainTokenRow>) -> Self {
        Self {
            tokens: rows.into_iter().map(StoredToken::from).collect(),
            dropped: 0,
            source: TokenSource::DevFile,
        }
    }
}

/// The credential store.
pub struct CredentialStore {
    cipher: EnvelopeCipher,
    database: Option<Arc<dyn TokenBackend>>,
    dev_file: DevTokenFile,
}

impl CredentialStore {
    #[must_use]
    pub fn new(
        cipher: EnvelopeCipher,
        database: Option<Arc<dyn TokenBackend>>,
        dev_file: DevTokenFile,
    ) -> Self {
        Self {
            cipher,
            database,
            dev_file,
        }
    }

    /// Build the store described by `config`.
    ///
    /// # Errors
    ///
    /// In production, returns [`CredentialError::Storage`] if the configured
    /// database cannot be reached. Outside production an unreachable
    /// database is logged and the dev file is used instead.
    pub async fn from_config(
        config: &VaultConfig,
        cipher: EnvelopeCipher,
    ) -> Result<Self, CredentialError> {
        let database = token_backend(config).await?;
        Ok(Self::new(
            cipher,
            database,
            DevTokenFile::new(config.dev_token_file_path()),
        ))
    }

    fn environment(&self) -> Environment {
        self.cipher.keys().environment()
    }

    /// Persist `access_token` for `item_id`, replacing any previous token.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::InvalidInput`] if `item_id` or the token is blank.
    /// - [`CredentialError::Configuration`] in production when no
    ///   policy-compliant key or no database is configured.
    /// - [`CredentialError::Storage`] in production when the database write
    ///   fails, or anywhere when the dev file cannot be written.
    pub async fn store(
        &self,
        item_id: &str,
        access_token: &str,
        owner_id: Option<&str>,
    ) -> Result<StoreOutcome, CredentialError> {
        let item_id = item_id.trim();
        let access_token = access_token.trim();
        if item_id.is_empty() {
            return Err(CredentialError::InvalidInput {
                reason: "item_id is empty",
            });
        }
        if access_token.is_empty() {
            return Err(CredentialError::InvalidInput {
                reason: "access token is empty",
            });
        }
        let owner_id = owner_id.map(str::trim).filter(|o| !o.is_empty());
        let production = self.environment().is_production();

        if let Err(e) = self.cipher.keys().require_usable() {
            if production {
                return Err(CredentialError::Configuration {
                    reason: e.to_string(),
                });
            }
            return self
                .dev_fallback(item_id, access_token, owner_id, FallbackReason::NoKey)
                .await;
        }

        let Some(database) = &self.database else {
            if production {
                return Err(CredentialError::Configuration {
                    reason: "no credential database configured".to_owned(),
                });
            }
            return self
                .dev_fallback(item_id, access_token, owner_id, FallbackReason::NoDatabase)
                .await;
        };

        let blob = self.cipher.encrypt_bytes(access_token.as_bytes(), None)?;
        let row = TokenRow {
            item_id: item_id.to_owned(),
            owner_id: owner_id.map(str::to_owned),
            encrypted_access_token: blob.to_json()?,
            updated_at: Utc::now(),
        };

        match database.upsert(&row).await {
            Ok(()) => {
                info!(item_id, "credential stored");
                Ok(StoreOutcome::Encrypted)
            }
            Err(e) if production => Err(e.into()),
            Err(e) => {
                warn!(item_id, error = %e, "credential database write failed");
                self.dev_fallback(
                    item_id,
                    access_token,
                    owner_id,
                    FallbackReason::DatabaseWriteFailed,
                )
                .await
            }
        }
    }

    async fn dev_fallback(
        &self,
        item_id: &str,
        access_token: &str,
        owner_id: Option<&str>,
        reason: FallbackReason,
    ) -> Result<StoreOutcome, CredentialError> {
        warn!(
            item_id,
            ?reason,
            path = %self.dev_file.path().display(),
            "storing credential UNENCRYPTED in the development token file"
        );
        self.dev_file.write(item_id, access_token, owner_id).await?;
        Ok(StoreOutcome::DevFallback { reason })
    }

    /// Decrypt every stored token, optionally for one owner, newest first.
    ///
    /// Rows that fail to decrypt are counted in
    /// [`TokenReadout::dropped`] and left out rather than failing the read.
    /// Outside production, unfiltered reads also include the dev file, so a
    /// token that fell back there (no key, failed write) stays readable even
    /// while a database is configured; for an item present in both, the newer
    /// write wins. Filtered reads never consult the dev file since it cannot
    /// guarantee tenant isolation.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::Configuration`] in production without a database.
    /// - [`CredentialError::Storage`] in production when the database read
    ///   fails, or when the dev file cannot be read.
    pub async fn read_all(&self, owner_id: Option<&str>) -> Result<TokenReadout, CredentialError> {
        let owner_id = owner_id.map(str::trim).filter(|o| !o.is_empty());
        let production = self.environment().is_production();

        let Some(database) = &self.database else {
            if production {
                return Err(CredentialError::Configuration {
                    reason: "no credential database configured".to_owned(),
                });
            }
            return self.read_dev_file(owner_id).await;
        };

        let rows = match database.list(owner_id).await {
            Ok(rows) => rows,
            Err(e) if production => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "credential database read failed; using development token file");
                return self.read_dev_file(owner_id).await;
            }
        };

        let mut readout = TokenReadout {
            tokens: Vec::with_capacity(rows.len()),
            dropped: 0,
            source: TokenSource::Database,
        };
        for row in rows {
            match self.open(&row) {
                Ok(access_token) => readout.tokens.push(StoredToken {
                    item_id: row.item_id,
                    owner_id: row.owner_id,
                    access_token,
                    updated_at: row.updated_at,
                }),
                Err(e) => {
                    warn!(item_id = %row.item_id, error = %e, "dropping undecryptable credential");
                    readout.dropped += 1;
                }
            }
        }
        if readout.dropped > 0 {
            warn!(
                dropped = readout.dropped,
                kept = readout.tokens.len(),
                "credential read partially succeeded"
            );
        }
        if !production && owner_id.is_none() {
            self.merge_dev_file(&mut readout).await;
        }
        Ok(readout)
    }

    async fn merge_dev_file(&self, readout: &mut TokenReadout) {
        let rows = match self.dev_file.read_all().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "development token file unreadable; database rows only");
                return;
            }
        };
        let mut merged = 0usize;
        for row in rows {
            match readout.tokens.iter_mut().find(|t| t.item_id == row.item_id) {
                Some(existing) if existing.updated_at >= row.updated_at => {}
                Some(existing) => {
                    *existing = StoredToken::from(row);
                    merged += 1;
                }
                None => {
                    readout.tokens.push(StoredToken::from(row));
                    merged += 1;
                }
            }
        }
        if merged > 0 {
            debug!(merged, "development token file merged into database readout");
            readout.source = TokenSource::DatabaseAndDevFile;
            readout.tokens.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        }
    }

    async fn read_dev_file(&self, owner_id: Option<&str>) -> Result<TokenReadout, CredentialError> {
        if owner_id.is_some() {
            return Ok(TokenReadout::empty());
        }
        Ok(TokenReadout::dev_file(self.dev_file.read_all().await?))
    }

    fn open(&self, row: &TokenRow) -> Result<String, CryptoError> {
        let blob = EncryptedBlob::from_json(&row.encrypted_access_token)?;
        let bytes = self.cipher.decrypt_bytes(&blob, None)?;
        String::from_utf8(bytes).map_err(|e| CryptoError::Serialization {
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("database", &self.database.is_some())
            .field("dev_file", &self.dev_file)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "postgres-backend")]
async fn token_backend(
    config: &VaultConfig,
) -> Result<Option<Arc<dyn TokenBackend>>, CredentialError> {
    let Some(url) = config.database_url.as_deref() else {
        return Ok(None);
    };
    match vaultline_storage::PostgresTokenBackend::connect(url).await {
        Ok(backend) => {
            info!("credential store using postgres");
            Ok(Some(Arc::new(backend)))
        }
        Err(e) if config.environment.is_production() => Err(e.into()),
        Err(e) => {
            warn!(error = %e, "credential database unreachable; development token file in use");
            Ok(None)
        }
    }
}

#[cfg(not(feature = "postgres-backend"))]
async fn token_backend(
    config: &VaultConfig,
) -> Result<Option<Arc<dyn TokenBackend>>, CredentialError> {
    if config.database_url.is_some() {
        warn!("DATABASE_URL set but the postgres-backend feature is disabled");
    }
    Ok(None)
}
