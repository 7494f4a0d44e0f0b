//! Storage adapters for `vaultline`.
//!
//! This crate defines the persistence seams used by the vault engine and
//! knows nothing about keys or encryption. Every value handed to these
//! adapters has already been sealed by `vaultline-core`, apart from the two
//! explicitly labeled plaintext fallbacks (the degraded audit file and the
//! developer token file).
//!
//! Three seams are provided:
//!
//! - [`AuditLogBackend`]: list-style append with a recent-range read.
//!   [`RedisListBackend`] (feature `redis-backend`) is the shared low-latency
//!   store, [`FileLogBackend`] the local append-only fallback, and
//!   [`MemoryListBackend`] an in-process twin of the list store.
//! - [`VaultRecordBackend`]: relational upsert keyed on
//!   `(kind, category, merchant_key)`, implemented by
//!   [`PostgresRecordBackend`] (feature `postgres-backend`) and
//!   [`MemoryRecordBackend`].
//! - [`TokenBackend`]: relational upsert keyed on `item_id`, implemented by
//!   [`PostgresTokenBackend`] (feature `postgres-backend`) and
//!   [`MemoryTokenBackend`].

mod dev_tokens;
mod error;
mod file_log;
mod memory;
#[cfg(feature = "postgres-backend")]
mod postgres_backend;
mod records;
#[cfg(feature = "redis-backend")]
mod redis_backend;

pub use dev_tokens::{DevTokenFile, PlainTokenRow};
pub use error::StorageError;
pub use file_log::FileLogBackend;
pub use memory::{MemoryListBackend, MemoryRecordBackend, MemoryTokenBackend};
#[cfg(feature = "postgres-backend")]
pub use postgres_backend::{PostgresRecordBackend, PostgresTokenBackend};
pub use records::{
    AggregateDomain, Category, Observation, RecordKind, RecordSource, SAMPLE_COUNT_CAP, TokenRow,
    VaultRow,
};
#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisListBackend;

/// Default number of entries a list-style audit backend retains.
pub const DEFAULT_AUDIT_RETENTION: usize = 10_000;

/// Order in which an [`AuditLogBackend`] returns recent lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrder {
    /// Most recent line first (list stores, push-to-head semantics).
    NewestFirst,
    /// Oldest of the returned window first (append-only files).
    StorageOrder,
}

/// A list-style audit log.
///
/// Lines are opaque UTF-8 strings (one serialized envelope or, on the
/// degraded path, one labeled plaintext entry). Implementations must be safe
/// to share across async tasks.
#[async_trait::async_trait]
pub trait AuditLogBackend: Send + Sync + 'static {
    /// Short descriptor reported to callers (e.g. `list-store`, `enc-file`).
    fn name(&self) -> &str;

    /// Order of the lines returned by [`read_recent`](Self::read_recent).
    fn order(&self) -> ReadOrder;

    /// Append one line.
    ///
    /// Capped backends must push and trim as one atomic step so concurrent
    /// writers can never interleave between the two.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the backend rejects the write.
    async fn append(&self, line: &str) -> Result<(), StorageError>;

    /// Return at most `limit` of the most recent lines, in [`order`](Self::order).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the backend cannot be read.
    async fn read_recent(&self, limit: usize) -> Result<Vec<String>, StorageError>;
}

/// Relational upsert adapter for knowledge-vault rows.
#[async_trait::async_trait]
pub trait VaultRecordBackend: Send + Sync + 'static {
    /// Look up the active row for a natural key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the query fails.
    async fn find(
        &self,
        kind: RecordKind,
        category: Category,
        merchant_key: &str,
    ) -> Result<Option<VaultRow>, StorageError>;

    /// Look up active rows matching any of `categories` and any of
    /// `merchant_keys`, most recently seen first, at most `limit` rows.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the query fails.
    async fn find_batch(
        &self,
        kind: RecordKind,
        categories: &[Category],
        merchant_keys: &[String],
        limit: usize,
    ) -> Result<Vec<VaultRow>, StorageError>;

    /// Insert the first observation of a natural key or fold it into the
    /// existing row, atomically with respect to concurrent merges of the same
    /// key. Returns the row as stored after the merge.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the upsert fails.
    async fn merge(&self, obs: &Observation) -> Result<VaultRow, StorageError>;
}

/// Relational upsert adapter for credential rows.
#[async_trait::async_trait]
pub trait TokenBackend: Send + Sync + 'static {
    /// Insert or fully replace the row with the same `item_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the upsert fails.
    async fn upsert(&self, row: &TokenRow) -> Result<(), StorageError>;

    /// List rows, optionally restricted to one owner, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the query fails.
    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<TokenRow>, StorageError>;
}
