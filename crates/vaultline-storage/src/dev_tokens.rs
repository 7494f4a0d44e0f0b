//! Developer-only credential file.
//!
//! Stores tokens **unencrypted** as a pretty-printed JSON array so local
//! development works without a database or key. The credential store never
//! touches this type in production.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::StorageError;

/// A plaintext token as kept in the developer file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainTokenRow {
    pub item_id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub access_token: String,
    pub updated_at: DateTime<Utc>,
}

/// The developer-only plaintext token file.
pub struct DevTokenFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DevTokenFile {
    /// Create a handle for the file at `path`. Nothing is touched until the
    /// first read or write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the token file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace the token for `item_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the file cannot be written,
    /// [`StorageError::Read`] if the existing file cannot be read, or
    /// [`StorageError::Corrupt`] if it cannot be parsed. A corrupt file is
    /// left untouched.
    pub async fn write(
        &self,
        item_id: &str,
        access_token: &str,
        owner_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;

        let mut rows = self.load().await?;
        rows.retain(|row| row.item_id != item_id);
        rows.push(PlainTokenRow {
            item_id: item_id.to_owned(),
            owner_id: owner_id.map(str::to_owned),
            access_token: access_token.to_owned(),
            updated_at: Utc::now(),
        });

        let body = serde_json::to_vec_pretty(&rows).map_err(|e| StorageError::Write {
            target: self.target(),
            reason: e.to_string(),
        })?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::Write {
                    target: self.target(),
                    reason: format!("failed to create directory '{}': {e}", dir.display()),
                })?;
        }
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| StorageError::Write {
                target: self.target(),
                reason: e.to_string(),
            })
    }

    /// Read every stored token. A missing file reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the file exists but cannot be read,
    /// or [`StorageError::Corrupt`] if it is not a JSON token array.
    pub async fn read_all(&self) -> Result<Vec<PlainTokenRow>, StorageError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn load(&self) -> Result<Vec<PlainTokenRow>, StorageError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::Read {
                    target: self.target(),
                    reason: e.to_string(),
                });
            }
        };
        serde_json::from_slice(&raw).map_err(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "dev token file is not a token array");
            StorageError::Corrupt {
                target: self.target(),
                reason: e.to_string(),
            }
        })
    }

    fn target(&self) -> String {
        self.path.display().to_string()
    }
}

impl std::fmt::Debug for DevTokenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevTokenFile")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = DevTokenFile::new(dir.path().join("tokens.json"));
        file.write("item-1", "access-sandbox-1", Some("user-a"))
            .await
            .unwrap();
        let rows = file.read_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].access_token, "access-sandbox-1");
        assert_eq!(rows[0].owner_id.as_deref(), Some("user-a"));
    }

    #[tokio::test]
    async fn write_replaces_same_item() {
        let dir = tempfile::tempdir().unwrap();
        let file = DevTokenFile::new(dir.path().join("tokens.json"));
        file.write("item-1", "old", None).await.unwrap();
        file.write("item-2", "other", None).await.unwrap();
        file.write("item-1", "new", None).await.unwrap();

        let rows = file.read_all().await.unwrap();
        assert_eq!(rows.len(), 2);
        let item = rows.iter().find(|r| r.item_id == "item-1").unwrap();
        assert_eq!(item.access_token, "new");
    }

    #[tokio::test]
    async fn garbage_file_is_corrupt_and_survives_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "not json").unwrap();
        let file = DevTokenFile::new(&path);

        let err = file.read_all().await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));

        let err = file.write("item-1", "tok", None).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json");
    }
}
