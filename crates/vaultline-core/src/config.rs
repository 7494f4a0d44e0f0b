//! Engine configuration for `vaultline`.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `VAULTLINE_*` environment variables;
//! [`VaultConfig::from_lookup`] takes any lookup function so tests never
//! touch the process environment.

use std::fmt;
use std::path::PathBuf;

use vaultline_storage::DEFAULT_AUDIT_RETENTION;

/// Runtime environment, which selects the strict or permissive key policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Local development and tests. Legacy keys and plaintext dev fallbacks
    /// are permitted.
    #[default]
    Development,
    /// Production. Legacy keys need an explicit override and credential
    /// writes fail closed.
    Production,
}

impl Environment {
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Engine configuration.
#[derive(Clone)]
pub struct VaultConfig {
    /// Primary key material (base64 or hex 32 bytes, or a legacy passphrase).
    pub primary_key: Option<String>,
    /// Fallback key material, consulted only when `allow_fallback_key` is set.
    pub fallback_key: Option<String>,
    /// Whether the fallback key slot may be used.
    pub allow_fallback_key: bool,
    /// Whether passphrase-derived keys are allowed in production.
    pub allow_legacy_in_production: bool,
    /// Production or development policy.
    pub environment: Environment,
    /// Directory holding the audit files and the dev token file.
    pub data_dir: PathBuf,
    /// Redis URL of the shared audit list; `None` disables the list backend.
    pub audit_redis_url: Option<String>,
    /// Redis key of the shared audit list.
    pub audit_list_key: String,
    /// Number of entries the shared audit list retains.
    pub audit_retention: usize,
    /// PostgreSQL connection string for vault and token rows.
    pub database_url: Option<String>,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
}

impl VaultConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `VAULTLINE_ENC_KEY`: primary key material
    /// - `VAULTLINE_FALLBACK_ENC_KEY`: fallback key material
    /// - `VAULTLINE_ALLOW_FALLBACK_KEY`: `1`/`true` enables the fallback slot
    /// - `VAULTLINE_ALLOW_LEGACY_KEYS`: `1`/`true` allows passphrase keys in production
    /// - `VAULTLINE_ENV`: `production` selects production policy (default: development)
    /// - `VAULTLINE_DATA_DIR`: directory for local files (default: `./.data`)
    /// - `VAULTLINE_AUDIT_REDIS_URL`: enables the shared audit list
    /// - `VAULTLINE_AUDIT_LIST_KEY`: list key (default: `vaultline:audit:verification`)
    /// - `VAULTLINE_AUDIT_RETENTION`: list retention cap (default: `10000`)
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `VAULTLINE_LOG_LEVEL`: log filter (default: `info`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Values are trimmed and empty values count as unset.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let flag = |name: &str| {
            get(name).is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        };

        let environment = match get("VAULTLINE_ENV").map(|v| v.to_lowercase()).as_deref() {
            Some("production" | "prod") => Environment::Production,
            _ => Environment::Development,
        };

        let audit_retention = get("VAULTLINE_AUDIT_RETENTION")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_AUDIT_RETENTION);

        Self {
            primary_key: get("VAULTLINE_ENC_KEY"),
            fallback_key: get("VAULTLINE_FALLBACK_ENC_KEY"),
            allow_fallback_key: flag("VAULTLINE_ALLOW_FALLBACK_KEY"),
            allow_legacy_in_production: flag("VAULTLINE_ALLOW_LEGACY_KEYS"),
            environment,
            data_dir: get("VAULTLINE_DATA_DIR").map_or_else(|| PathBuf::from("./.data"), PathBuf::from),
            audit_redis_url: get("VAULTLINE_AUDIT_REDIS_URL"),
            audit_list_key: get("VAULTLINE_AUDIT_LIST_KEY")
                .unwrap_or_else(|| "vaultline:audit:verification".to_owned()),
            audit_retention,
            database_url: get("DATABASE_URL"),
            log_level: get("VAULTLINE_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
        }
    }

    /// Encrypted audit log file.
    #[must_use]
    pub fn audit_file_path(&self) -> PathBuf {
        self.data_dir.join("verification_audit.enc.jsonl")
    }

    /// Plaintext audit log file, written only when no key exists.
    #[must_use]
    pub fn audit_plain_file_path(&self) -> PathBuf {
        self.data_dir.join("verification_audit.jsonl")
    }

    /// Developer-only plaintext token file.
    #[must_use]
    pub fn dev_token_file_path(&self) -> PathBuf {
        self.data_dir.join("credential_tokens.json")
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("VaultConfig")
            .field("primary_key", &redact(&self.primary_key))
            .field("fallback_key", &redact(&self.fallback_key))
            .field("allow_fallback_key", &self.allow_fallback_key)
            .field("allow_legacy_in_production", &self.allow_legacy_in_production)
            .field("environment", &self.environment)
            .field("data_dir", &self.data_dir)
            .field("audit_redis_url", &redact(&self.audit_redis_url))
            .field("audit_list_key", &self.audit_list_key)
            .field("audit_retention", &self.audit_retention)
            .field("database_url", &redact(&self.database_url))
            .field("log_level", &self.log_level)
            .finish()
    }
}
