//! PostgreSQL backends for vault rows and credential rows.
//!
//! Both tables enforce their natural keys with unique constraints and are
//! written with `INSERT … ON CONFLICT … DO UPDATE`. The vault merge computes
//! the weighted average, count cap and sticky source inside that single
//! statement, so concurrent observations of one key serialize on the row
//! lock instead of racing a read-modify-write.
//!
//! Feature-gated behind `postgres-backend`. Uses `sqlx` with the Tokio
//! runtime for fully async operations.

use std::str::FromStr;

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    Category, Observation, RecordKind, SAMPLE_COUNT_CAP, StorageError, TokenBackend, TokenRow,
    VaultRecordBackend, VaultRow,
};

const VAULT_TABLE: &str = "vault_records";
const TOKEN_TABLE: &str = "credential_tokens";

const VAULT_COLUMNS: &str = "id, kind, category, merchant, merchant_key, sample_count, \
     aggregate, source, active, notes, encrypted_payload, created_at, updated_at, last_seen_at";

async fn connect_pool(database_url: &str) -> Result<PgPool, StorageError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| StorageError::Open {
            target: "[redacted database url]".to_owned(),
            reason: e.to_string(),
        })
}

async fn run_migration(pool: &PgPool, table: &str, statements: &[&str]) -> Result<(), StorageError> {
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StorageError::Open {
                target: table.to_owned(),
                reason: format!("migration failed: {e}"),
            })?;
    }
    Ok(())
}

fn parse_column<T>(column: &str, raw: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
        index: column.to_owned(),
        source: e.into(),
    })
}

impl<'r> sqlx::FromRow<'r, PgRow> for VaultRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let category: String = row.try_get("category")?;
        let source: String = row.try_get("source")?;
        Ok(Self {
            id: row.try_get("id")?,
            kind: parse_column("kind", &kind)?,
            category: parse_column("category", &category)?,
            merchant: row.try_get("merchant")?,
            merchant_key: row.try_get("merchant_key")?,
            sample_count: row.try_get("sample_count")?,
            aggregate: row.try_get("aggregate")?,
            source: parse_column("source", &source)?,
            active: row.try_get("active")?,
            notes: row.try_get("notes")?,
            encrypted_payload: row.try_get("encrypted_payload")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
        })
    }
}

/// Vault rows stored in the `vault_records` table.
#[derive(Clone)]
pub struct PostgresRecordBackend {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresRecordBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresRecordBackend")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

impl PostgresRecordBackend {
    /// Connect to PostgreSQL and create the table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = connect_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool, creating the table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the migration fails.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StorageError> {
        run_migration(
            &pool,
            VAULT_TABLE,
            &[
                "CREATE TABLE IF NOT EXISTS vault_records (\
                    id                UUID             PRIMARY KEY, \
                    kind              TEXT             NOT NULL, \
                    category          TEXT             NOT NULL, \
                    merchant          TEXT             NOT NULL, \
                    merchant_key      TEXT             NOT NULL, \
                    sample_count      INTEGER          NOT NULL CHECK (sample_count >= 1), \
                    aggregate         DOUBLE PRECISION NOT NULL CHECK (aggregate >= 0), \
                    source            TEXT             NOT NULL, \
                    active            BOOLEAN          NOT NULL DEFAULT TRUE, \
                    notes             TEXT, \
                    encrypted_payload TEXT, \
                    created_at        TIMESTAMPTZ      NOT NULL DEFAULT now(), \
                    updated_at        TIMESTAMPTZ      NOT NULL DEFAULT now(), \
                    last_seen_at      TIMESTAMPTZ      NOT NULL DEFAULT now(), \
                    UNIQUE (kind, category, merchant_key)\
                )",
                "CREATE INDEX IF NOT EXISTS idx_vault_records_last_seen \
                 ON vault_records (kind, last_seen_at DESC)",
            ],
        )
        .await?;
        Ok(Self { pool })
    }

    /// Return a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl VaultRecordBackend for PostgresRecordBackend {
    async fn find(
        &self,
        kind: RecordKind,
        category: Category,
        merchant_key: &str,
    ) -> Result<Option<VaultRow>, StorageError> {
        sqlx::query_as::<_, VaultRow>(&format!(
            "SELECT {VAULT_COLUMNS} FROM vault_records \
             WHERE kind = $1 AND category = $2 AND merchant_key = $3 AND active \
             LIMIT 1"
        ))
        .bind(kind.as_str())
        .bind(category.as_str())
        .bind(merchant_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Read {
            target: VAULT_TABLE.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn find_batch(
        &self,
        kind: RecordKind,
        categories: &[Category],
        merchant_keys: &[String],
        limit: usize,
    ) -> Result<Vec<VaultRow>, StorageError> {
        let categories: Vec<&str> = categories.iter().map(|c| c.as_str()).collect();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sqlx::query_as::<_, VaultRow>(&format!(
            "SELECT {VAULT_COLUMNS} FROM vault_records \
             WHERE kind = $1 AND active \
               AND category = ANY($2) AND merchant_key = ANY($3) \
             ORDER BY last_seen_at DESC \
             LIMIT $4"
        ))
        .bind(kind.as_str())
        .bind(&categories)
        .bind(merchant_keys)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Read {
            target: VAULT_TABLE.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn merge(&self, obs: &Observation) -> Result<VaultRow, StorageError> {
        let (lo, hi) = obs.kind.domain().bounds();
        sqlx::query_as::<_, VaultRow>(&format!(
            "INSERT INTO vault_records AS t \
                (id, kind, category, merchant, merchant_key, sample_count, aggregate, \
                 source, active, notes, encrypted_payload, created_at, updated_at, last_seen_at) \
             VALUES ($1, $2, $3, $4, $5, 1, LEAST($10, GREATEST($9, $6)), \
                     $7, TRUE, $8, $11, now(), now(), now()) \
             ON CONFLICT (kind, category, merchant_key) DO UPDATE SET \
                merchant = EXCLUDED.merchant, \
                aggregate = LEAST($10, GREATEST($9, \
                    (t.aggregate * GREATEST(t.sample_count, 1) + $6) \
                    / (GREATEST(t.sample_count, 1) + 1))), \
                sample_count = LEAST(GREATEST(t.sample_count, 1) + 1, $12), \
                source = CASE WHEN t.source = 'manual' THEN 'manual' ELSE EXCLUDED.source END, \
                active = TRUE, \
                notes = COALESCE(EXCLUDED.notes, t.notes), \
                encrypted_payload = COALESCE(EXCLUDED.encrypted_payload, t.encrypted_payload), \
                updated_at = now(), \
                last_seen_at = now() \
             RETURNING {VAULT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(obs.kind.as_str())
        .bind(obs.category.as_str())
        .bind(&obs.merchant)
        .bind(&obs.merchant_key)
        .bind(obs.value)
        .bind(obs.source.as_str())
        .bind(obs.notes.as_deref())
        .bind(lo)
        .bind(hi)
        .bind(obs.encrypted_payload.as_deref())
        .bind(SAMPLE_COUNT_CAP)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            target: VAULT_TABLE.to_owned(),
            reason: e.to_string(),
        })
    }
}

/// Credential rows stored in the `credential_tokens` table.
#[derive(Clone)]
pub struct PostgresTokenBackend {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresTokenBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTokenBackend")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

impl PostgresTokenBackend {
    /// Connect to PostgreSQL and create the table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = connect_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool, creating the table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the migration fails.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StorageError> {
        run_migration(
            &pool,
            TOKEN_TABLE,
            &[
                "CREATE TABLE IF NOT EXISTS credential_tokens (\
                    item_id                TEXT        PRIMARY KEY, \
                    owner_id               TEXT, \
                    encrypted_access_token TEXT        NOT NULL, \
                    updated_at             TIMESTAMPTZ NOT NULL DEFAULT now()\
                )",
                "CREATE INDEX IF NOT EXISTS idx_credential_tokens_owner \
                 ON credential_tokens (owner_id, updated_at DESC)",
            ],
        )
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl TokenBackend for PostgresTokenBackend {
    async fn upsert(&self, row: &TokenRow) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO credential_tokens (item_id, owner_id, encrypted_access_token, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (item_id) DO UPDATE SET \
                owner_id = EXCLUDED.owner_id, \
                encrypted_access_token = EXCLUDED.encrypted_access_token, \
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&row.item_id)
        .bind(row.owner_id.as_deref())
        .bind(&row.encrypted_access_token)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            target: TOKEN_TABLE.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<TokenRow>, StorageError> {
        sqlx::query_as::<_, TokenRow>(
            "SELECT item_id, owner_id, encrypted_access_token, updated_at \
             FROM credential_tokens \
             WHERE ($1::TEXT IS NULL OR owner_id = $1) \
             ORDER BY updated_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Read {
            target: TOKEN_TABLE.to_owned(),
            reason: e.to_string(),
        })
    }
}
