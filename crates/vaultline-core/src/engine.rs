//! One-call assembly of every store from a [`VaultConfig`].
//!
//! The key is resolved exactly once here and shared by reference with each
//! store. There is no hot rotation: restart the process to change keys.

use std::sync::Arc;

use tracing::info;

use crate::audit::AuditTrail;
use crate::config::VaultConfig;
use crate::credentials::CredentialStore;
use crate::crypto::EnvelopeCipher;
use crate::error::{CredentialError, KnowledgeError};
use crate::keys::KeyResolver;
use crate::knowledge::KnowledgeVault;

/// Errors from [`VaultEngine::from_config`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// Every store, wired to one key resolver.
#[derive(Debug)]
pub struct VaultEngine {
    pub keys: Arc<KeyResolver>,
    pub cipher: EnvelopeCipher,
    pub audit: AuditTrail,
    pub knowledge: KnowledgeVault,
    pub credentials: CredentialStore,
}

impl VaultEngine {
    /// Resolve the key and connect every configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the knowledge vault database is unreachable,
    /// or if the credential database is unreachable in production.
    pub async fn from_config(config: &VaultConfig) -> Result<Self, EngineError> {
        let keys = Arc::new(KeyResolver::from_config(config));
        let cipher = EnvelopeCipher::new(Arc::clone(&keys));

        let audit = AuditTrail::from_config(config, Arc::clone(&keys)).await;
        let knowledge = KnowledgeVault::from_config(config, cipher.clone()).await?;
        let credentials = CredentialStore::from_config(config, cipher.clone()).await?;

        info!(
            environment = ?config.environment,
            encryption = keys.encryption_enabled(),
            data_dir = %config.data_dir.display(),
            "vault engine ready"
        );

        Ok(Self {
            keys,
            cipher,
            audit,
            knowledge,
            credentials,
        })
    }
}
