//! In-memory twins of the shared backends.
//!
//! Each type mirrors the semantics of its networked counterpart (push+trim
//! retention for the list store, natural-key upsert for the relational
//! stores) behind a `tokio::sync` lock. Nothing is persisted; use these for
//! tests and for embedding the engine without external services.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::{
    AuditLogBackend, Category, DEFAULT_AUDIT_RETENTION, Observation, ReadOrder, RecordKind,
    StorageError, TokenBackend, TokenRow, VaultRecordBackend, VaultRow,
};

/// An in-memory list store with push-to-head and a retention cap.
///
/// Push and trim happen under one lock, matching the atomic pipeline the
/// Redis backend issues.
#[derive(Debug, Clone)]
pub struct MemoryListBackend {
    lines: Arc<Mutex<VecDeque<String>>>,
    retention: usize,
}

impl MemoryListBackend {
    /// Create an empty list keeping the default 10 000 most recent lines.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_AUDIT_RETENTION)
    }

    /// Create an empty list keeping the `retention` most recent lines.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::new())),
            retention: retention.max(1),
        }
    }

    /// Number of lines currently retained.
    pub async fn len(&self) -> usize {
        self.lines.lock().await.len()
    }

    /// Whether the list is empty.
    pub async fn is_empty(&self) -> bool {
        self.lines.lock().await.is_empty()
    }
}

impl Default for MemoryListBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuditLogBackend for MemoryListBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "list-store"
    }

    fn order(&self) -> ReadOrder {
        ReadOrder::NewestFirst
    }

    async fn append(&self, line: &str) -> Result<(), StorageError> {
        let mut lines = self.lines.lock().await;
        lines.push_front(line.to_owned());
        lines.truncate(self.retention);
        Ok(())
    }

    async fn read_recent(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        let lines = self.lines.lock().await;
        Ok(lines.iter().take(limit).cloned().collect())
    }
}

type NaturalKey = (RecordKind, Category, String);

/// An in-memory vault table keyed on `(kind, category, merchant_key)`.
///
/// The merge runs under a single write lock, so concurrent observations of
/// the same natural key are serialized and none is lost.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordBackend {
    rows: Arc<RwLock<BTreeMap<NaturalKey, VaultRow>>>,
}

impl MemoryRecordBackend {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a row inactive, as an operator would. Returns whether it existed.
    pub async fn deactivate(&self, kind: RecordKind, category: Category, merchant_key: &str) -> bool {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&(kind, category, merchant_key.to_owned())) {
            Some(row) => {
                row.active = false;
                true
            }
            None => false,
        }
    }

    /// Overwrite a stored row verbatim. Used to simulate tampering and
    /// out-of-band edits in tests.
    pub async fn replace(&self, row: VaultRow) {
        let key = (row.kind, row.category, row.merchant_key.clone());
        self.rows.write().await.insert(key, row);
    }
}

#[async_trait::async_trait]
impl VaultRecordBackend for MemoryRecordBackend {
    async fn find(
        &self,
        kind: RecordKind,
        category: Category,
        merchant_key: &str,
    ) -> Result<Option<VaultRow>, StorageError> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(&(kind, category, merchant_key.to_owned()))
            .filter(|row| row.active)
            .cloned())
    }

    async fn find_batch(
        &self,
        kind: RecordKind,
        categories: &[Category],
        merchant_keys: &[String],
        limit: usize,
    ) -> Result<Vec<VaultRow>, StorageError> {
        let rows = self.rows.read().await;
        let mut found: Vec<VaultRow> = rows
            .values()
            .filter(|row| {
                row.active
                    && row.kind == kind
                    && categories.contains(&row.category)
                    && merchant_keys.contains(&row.merchant_key)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        found.truncate(limit);
        Ok(found)
    }

    async fn merge(&self, obs: &Observation) -> Result<VaultRow, StorageError> {
        let now = Utc::now();
        let mut rows = self.rows.write().await;
        let row = rows
            .entry((obs.kind, obs.category, obs.merchant_key.clone()))
            .and_modify(|row| row.absorb(obs, now))
            .or_insert_with(|| VaultRow::first(obs, now));
        Ok(row.clone())
    }
}

/// An in-memory credential table keyed on `item_id`.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenBackend {
    rows: Arc<RwLock<BTreeMap<String, TokenRow>>>,
}

impl MemoryTokenBackend {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored ciphertext of a row. Used to simulate corruption
    /// and key-epoch mismatches in tests.
    pub async fn corrupt(&self, item_id: &str, encrypted_access_token: &str) -> bool {
        let mut rows = self.rows.write().await;
        match rows.get_mut(item_id) {
            Some(row) => {
                encrypted_access_token.clone_into(&mut row.encrypted_access_token);
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl TokenBackend for MemoryTokenBackend {
    async fn upsert(&self, row: &TokenRow) -> Result<(), StorageError> {
        self.rows
            .write()
            .await
            .insert(row.item_id.clone(), row.clone());
        Ok(())
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<TokenRow>, StorageError> {
        let rows = self.rows.read().await;
        let mut found: Vec<TokenRow> = rows
            .values()
            .filter(|row| owner_id.is_none_or(|owner| row.owner_id.as_deref() == Some(owner)))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(found)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::RecordSource;

    fn observation(merchant_key: &str, value: f64) -> Observation {
        Observation {
            kind: RecordKind::Pattern,
            category: Category::Internet,
            merchant: merchant_key.to_uppercase(),
            merchant_key: merchant_key.to_owned(),
            value,
            source: RecordSource::Engine,
            notes: None,
            encrypted_payload: None,
        }
    }

    #[tokio::test]
    async fn list_reads_newest_first() {
        let list = MemoryListBackend::new();
        list.append("one").await.unwrap();
        list.append("two").await.unwrap();
        list.append("three").await.unwrap();
        let lines = list.read_recent(2).await.unwrap();
        assert_eq!(lines, vec!["three", "two"]);
    }

    #[tokio::test]
    async fn list_trims_to_retention() {
        let list = MemoryListBackend::with_retention(3);
        for i in 0..5 {
            list.append(&i.to_string()).await.unwrap();
        }
        assert_eq!(list.len().await, 3);
        assert_eq!(list.read_recent(10).await.unwrap(), vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn concurrent_list_appends_respect_cap() {
        let list = MemoryListBackend::with_retention(50);
        let mut handles = Vec::new();
        for worker in 0..8 {
            let list = list.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..20 {
                    list.append(&format!("{worker}-{i}")).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(list.len().await, 50);
    }

    #[tokio::test]
    async fn record_merge_inserts_then_averages() {
        let table = MemoryRecordBackend::new();
        let first = table.merge(&observation("fiberco", 0.2)).await.unwrap();
        assert_eq!(first.sample_count, 1);
        let second = table.merge(&observation("fiberco", 0.4)).await.unwrap();
        assert_eq!(second.sample_count, 2);
        assert_eq!(second.id, first.id);
        assert!((second.aggregate - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn concurrent_merges_lose_no_updates() {
        let table = MemoryRecordBackend::new();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                table.merge(&observation("fiberco", 0.5)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let row = table
            .find(RecordKind::Pattern, Category::Internet, "fiberco")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.sample_count, 32);
    }

    #[tokio::test]
    async fn find_skips_inactive_rows() {
        let table = MemoryRecordBackend::new();
        table.merge(&observation("fiberco", 0.2)).await.unwrap();
        assert!(
            table
                .deactivate(RecordKind::Pattern, Category::Internet, "fiberco")
                .await
        );
        let row = table
            .find(RecordKind::Pattern, Category::Internet, "fiberco")
            .await
            .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn find_batch_filters_and_limits() {
        let table = MemoryRecordBackend::new();
        for key in ["a", "b", "c"] {
            table.merge(&observation(key, 0.1)).await.unwrap();
        }
        let keys = vec!["a".to_owned(), "c".to_owned(), "zzz".to_owned()];
        let rows = table
            .find_batch(RecordKind::Pattern, &[Category::Internet], &keys, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let limited = table
            .find_batch(RecordKind::Pattern, &[Category::Internet], &keys, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let other_category = table
            .find_batch(RecordKind::Pattern, &[Category::Phone], &keys, 10)
            .await
            .unwrap();
        assert!(other_category.is_empty());
    }

    #[tokio::test]
    async fn token_upsert_replaces_by_item_id() {
        let table = MemoryTokenBackend::new();
        let mut row = TokenRow {
            item_id: "item-1".to_owned(),
            owner_id: Some("user-a".to_owned()),
            encrypted_access_token: "v1".to_owned(),
            updated_at: Utc::now(),
        };
        table.upsert(&row).await.unwrap();
        "v2".clone_into(&mut row.encrypted_access_token);
        table.upsert(&row).await.unwrap();

        let rows = table.list(None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].encrypted_access_token, "v2");
    }

    #[tokio::test]
    async fn token_list_filters_by_owner() {
        let table = MemoryTokenBackend::new();
        for (item, owner) in [("i1", "user-a"), ("i2", "user-b")] {
            table
                .upsert(&TokenRow {
                    item_id: item.to_owned(),
                    owner_id: Some(owner.to_owned()),
                    encrypted_access_token: "ct".to_owned(),
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let rows = table.list(Some("user-b")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_id, "i2");
    }
}
