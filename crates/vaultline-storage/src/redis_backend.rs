//! Redis list backend: the shared low-latency audit store.
//!
//! New lines are pushed to the head of a list and the list is trimmed to the
//! retention cap in the same `MULTI`/`EXEC` pipeline, so a trim issued by
//! another writer can never land between a push and its trim.
//!
//! Feature-gated behind `redis-backend`. Uses a multiplexed async
//! connection; timeouts are whatever the Redis client is configured with.

use redis::aio::MultiplexedConnection;

use crate::{AuditLogBackend, DEFAULT_AUDIT_RETENTION, ReadOrder, StorageError};

/// A capped audit list stored under one Redis key.
#[derive(Clone)]
pub struct RedisListBackend {
    conn: MultiplexedConnection,
    key: String,
    retention: usize,
}

impl std::fmt::Debug for RedisListBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisListBackend")
            .field("key", &self.key)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl RedisListBackend {
    /// Connect to Redis at `url` and use the list at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(url: &str, key: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(|e| StorageError::Open {
            target: key.to_owned(),
            reason: format!("invalid redis url: {e}"),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Open {
                target: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            conn,
            key: key.to_owned(),
            retention: DEFAULT_AUDIT_RETENTION,
        })
    }

    /// Keep only the `retention` most recent lines (minimum 1).
    #[must_use]
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// The list key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn trim_stop(&self) -> i64 {
        i64::try_from(self.retention.saturating_sub(1)).unwrap_or(i64::MAX)
    }
}

#[async_trait::async_trait]
impl AuditLogBackend for RedisListBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "list-store"
    }

    fn order(&self) -> ReadOrder {
        ReadOrder::NewestFirst
    }

    async fn append(&self, line: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&self.key)
            .arg(line)
            .ignore()
            .cmd("LTRIM")
            .arg(&self.key)
            .arg(0)
            .arg(self.trim_stop())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Write {
                target: self.key.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn read_recent(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = i64::try_from(limit.saturating_sub(1)).unwrap_or(i64::MAX);
        let mut conn = self.conn.clone();
        let lines: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Read {
                target: self.key.clone(),
                reason: e.to_string(),
            })?;
        Ok(lines)
    }
}
