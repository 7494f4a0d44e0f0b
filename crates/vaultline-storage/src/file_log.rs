//! Append-only JSON-lines file backend.
//!
//! Each line is one serialized envelope (or, on the degraded path, one
//! labeled plaintext entry). The file is opened in append mode and is never
//! rewritten or truncated.
//!
//! Unlike the list store this backend is **not capped**: it grows without
//! bound until an operator rotates it. Deployments relying on it must arrange
//! external rotation.
//!
//! # Thread safety
//!
//! A `tokio::sync::Mutex` around the file handle serializes writes so lines
//! from concurrent appenders never interleave.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::{AuditLogBackend, ReadOrder, StorageError};

/// Audit log backend that appends lines to a local file.
pub struct FileLogBackend {
    path: PathBuf,
    name: String,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl FileLogBackend {
    /// Create a backend appending to `path`, reported to callers as `name`.
    ///
    /// The parent directory and file are created lazily on the first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>, name: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            name: name.into(),
            writer: Mutex::new(None),
        }
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file exists on disk yet.
    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    fn target(&self) -> String {
        self.path.display().to_string()
    }

    async fn open(&self) -> Result<tokio::fs::File, StorageError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::Open {
                    target: self.target(),
                    reason: format!("failed to create directory '{}': {e}", dir.display()),
                })?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StorageError::Open {
                target: self.target(),
                reason: e.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl AuditLogBackend for FileLogBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> ReadOrder {
        ReadOrder::StorageOrder
    }

    async fn append(&self, line: &str) -> Result<(), StorageError> {
        let mut buf = Vec::with_capacity(line.len().saturating_add(1));
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let file = guard.as_mut().ok_or_else(|| StorageError::Write {
            target: self.target(),
            reason: "file handle unexpectedly None after open".to_owned(),
        })?;

        let written = async {
            file.write_all(&buf).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            // Drop the handle so the next append reopens the file.
            *guard = None;
            return Err(StorageError::Write {
                target: self.target(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    async fn read_recent(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::Read {
                    target: self.target(),
                    reason: e.to_string(),
                });
            }
        };

        let lines: Vec<&str> = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let start = lines.len().saturating_sub(limit);
        Ok(lines[start..].iter().map(|l| (*l).to_owned()).collect())
    }
}

impl std::fmt::Debug for FileLogBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLogBackend")
            .field("path", &self.path)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
