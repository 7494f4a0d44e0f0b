//! Core library for `vaultline`.
//!
//! Contains key resolution and policy, the AES-256-GCM envelope cipher, and
//! the three stores built on it: the audit trail, the knowledge vault and the
//! credential store. This crate depends on `vaultline-storage` for the
//! backend traits and knows nothing about specific databases beyond the
//! optional adapters selected by feature flags.

pub mod audit;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod keys;
pub mod knowledge;
pub mod telemetry;

pub use audit::{AppendOutcome, AuditEntry, AuditEvent, AuditReadout, AuditRecord, AuditTrail};
pub use config::{Environment, VaultConfig};
pub use credentials::{CredentialStore, StoreOutcome, StoredToken, TokenReadout};
pub use crypto::{EncryptedBlob, EnvelopeCipher};
pub use engine::{EngineError, VaultEngine};
pub use error::ErrorKind;
pub use keys::{KeyMaterial, KeyMode, KeyResolver, KeySlot};
pub use knowledge::{AdvicePayload, KnowledgeVault, UpsertOutcome};
