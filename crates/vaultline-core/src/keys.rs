//! Key resolution and key policy.
//!
//! Configured secret material becomes a 32-byte AES-256 key plus a strength
//! classification:
//!
//! - **Strict**: the secret decodes (base64, then hex) to exactly 32 bytes
//!   and is used as-is.
//! - **Legacy**: anything else non-empty is treated as a passphrase and
//!   hashed with SHA-256. Tolerated in development; rejected in production
//!   unless explicitly overridden.
//!
//! A [`KeyResolver`] is built once at process start and shared by reference
//! with every store. There is no hot rotation: the material it holds is fixed
//! for the life of the process, and existing ciphertexts stay readable only
//! while the same secret remains configured.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{Environment, VaultConfig};
use crate::error::KeyError;

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Strength classification of resolved key material.
///
/// Serialized as `strong` / `legacy` in envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyMode {
    /// 32 random bytes supplied directly.
    #[serde(rename = "strong")]
    Strict,
    /// Derived from a passphrase by hashing.
    #[serde(rename = "legacy")]
    Legacy,
}

/// Which configuration slot produced the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySlot {
    Primary,
    Fallback,
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// A resolved 256-bit key. Zeroized on drop, never serialized, and redacted
/// from `Debug` output.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: [u8; KEY_LEN],
    #[zeroize(skip)]
    mode: KeyMode,
    #[zeroize(skip)]
    source: KeySlot,
}

impl KeyMaterial {
    /// Build key material from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN], mode: KeyMode, source: KeySlot) -> Self {
        Self {
            bytes,
            mode,
            source,
        }
    }

    /// Borrow the raw key bytes.
    ///
    /// Use with care: the caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    #[must_use]
    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    #[must_use]
    pub fn source(&self) -> KeySlot {
        self.source
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"[REDACTED]")
            .field("mode", &self.mode)
            .field("source", &self.source)
            .finish()
    }
}

/// Resolve configured secrets into key material.
///
/// The primary secret wins whenever it is non-empty. The fallback secret is
/// consulted only when the primary is empty and `allow_fallback` is set.
///
/// # Errors
///
/// Returns [`KeyError::Unavailable`] if no permitted slot holds a secret.
pub fn resolve(
    primary: Option<&str>,
    fallback: Option<&str>,
    allow_fallback: bool,
) -> Result<KeyMaterial, KeyError> {
    fn non_empty(s: Option<&str>) -> Option<&str> {
        s.map(str::trim).filter(|s| !s.is_empty())
    }

    if let Some(secret) = non_empty(primary) {
        return Ok(interpret(secret, KeySlot::Primary));
    }
    if allow_fallback {
        if let Some(secret) = non_empty(fallback) {
            return Ok(interpret(secret, KeySlot::Fallback));
        }
    }
    Err(KeyError::Unavailable)
}

fn interpret(secret: &str, source: KeySlot) -> KeyMaterial {
    match parse_strict(secret) {
        Some(bytes) => KeyMaterial::from_bytes(bytes, KeyMode::Strict, source),
        None => KeyMaterial::from_bytes(derive_legacy(secret), KeyMode::Legacy, source),
    }
}

/// Decode `secret` as base64, then hex, accepting only exactly 32 bytes.
fn parse_strict(secret: &str) -> Option<[u8; KEY_LEN]> {
    let from_base64 = [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(secret).ok().filter(|b| b.len() == KEY_LEN));

    let mut decoded = from_base64
        .or_else(|| hex::decode(secret).ok().filter(|b| b.len() == KEY_LEN))?;
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&decoded);
    decoded.zeroize();
    Some(key)
}

fn derive_legacy(secret: &str) -> [u8; KEY_LEN] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Holds the process-wide key and applies the production key policy.
pub struct KeyResolver {
    material: Option<KeyMaterial>,
    environment: Environment,
    allow_legacy_in_production: bool,
}

impl KeyResolver {
    /// Wrap already-resolved material (or none) with a policy.
    #[must_use]
    pub fn new(
        material: Option<KeyMaterial>,
        environment: Environment,
        allow_legacy_in_production: bool,
    ) -> Self {
        Self {
            material,
            environment,
            allow_legacy_in_production,
        }
    }

    /// Resolve the configured key slots and capture the policy flags.
    #[must_use]
    pub fn from_config(config: &VaultConfig) -> Self {
        let material = match resolve(
            config.primary_key.as_deref(),
            config.fallback_key.as_deref(),
            config.allow_fallback_key,
        ) {
            Ok(material) => {
                info!(slot = %material.source(), mode = ?material.mode(), "encryption key resolved");
                if material.mode() == KeyMode::Legacy {
                    warn!(slot = %material.source(), "encryption key is passphrase-derived; configure 32 random bytes (base64 or hex)");
                }
                Some(material)
            }
            Err(_) => {
                warn!("no encryption key configured");
                None
            }
        };
        Self::new(
            material,
            config.environment,
            config.allow_legacy_in_production,
        )
    }

    /// The key, regardless of policy.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Unavailable`] if no key is configured.
    pub fn material(&self) -> Result<&KeyMaterial, KeyError> {
        self.material.as_ref().ok_or(KeyError::Unavailable)
    }

    /// The key, if it satisfies the policy for the current environment.
    ///
    /// # Errors
    ///
    /// - [`KeyError::Unavailable`] if no key is configured.
    /// - [`KeyError::WeakKeyRejected`] if the key is legacy, the environment
    ///   is production, and no legacy override is set.
    pub fn require_usable(&self) -> Result<&KeyMaterial, KeyError> {
        let material = self.material()?;
        if material.mode() == KeyMode::Legacy
            && self.environment.is_production()
            && !self.allow_legacy_in_production
        {
            return Err(KeyError::WeakKeyRejected {
                slot: material.source(),
            });
        }
        Ok(material)
    }

    /// Whether [`require_usable`](Self::require_usable) would succeed.
    #[must_use]
    pub fn encryption_enabled(&self) -> bool {
        self.require_usable().is_ok()
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }
}

impl fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyResolver")
            .field("material", &self.material)
            .field("environment", &self.environment)
            .field("allow_legacy_in_production", &self.allow_legacy_in_production)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const RAW: [u8; 32] = [7u8; 32];

    fn b64_key() -> String {
        STANDARD.encode(RAW)
    }

    #[test]
    fn base64_32_bytes_is_strict() {
        let key = resolve(Some(&b64_key()), None, false).unwrap();
        assert_eq!(key.mode(), KeyMode::Strict);
        assert_eq!(key.source(), KeySlot::Primary);
        assert_eq!(key.as_bytes(), &RAW);
    }

    #[test]
    fn hex_32_bytes_is_strict() {
        let key = resolve(Some(&hex::encode(RAW)), None, false).unwrap();
        assert_eq!(key.mode(), KeyMode::Strict);
        assert_eq!(key.as_bytes(), &RAW);
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let key = resolve(Some(&format!("  {}\n", b64_key())), None, false).unwrap();
        assert_eq!(key.mode(), KeyMode::Strict);
    }

    #[test]
    fn short_base64_is_legacy() {
        let short = STANDARD.encode([1u8; 16]);
        let key = resolve(Some(&short), None, false).unwrap();
        assert_eq!(key.mode(), KeyMode::Legacy);
    }

    #[test]
    fn passphrase_is_hashed() {
        let key = resolve(Some("correct horse battery staple"), None, false).unwrap();
        assert_eq!(key.mode(), KeyMode::Legacy);
        let expected: [u8; 32] = Sha256::digest(b"correct horse battery staple").into();
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn fallback_used_only_when_allowed() {
        let key = resolve(None, Some(&b64_key()), true).unwrap();
        assert_eq!(key.source(), KeySlot::Fallback);
        assert_eq!(key.mode(), KeyMode::Strict);

        let denied = resolve(Some(""), Some(&b64_key()), false);
        assert!(matches!(denied, Err(KeyError::Unavailable)));
    }

    #[test]
    fn primary_wins_over_fallback() {
        let key = resolve(Some("passphrase"), Some(&b64_key()), true).unwrap();
        assert_eq!(key.source(), KeySlot::Primary);
        assert_eq!(key.mode(), KeyMode::Legacy);
    }

    #[test]
    fn nothing_configured_is_unavailable() {
        assert!(matches!(resolve(None, None, true), Err(KeyError::Unavailable)));
    }

    #[test]
    fn blank_primary_falls_through_to_fallback() {
        let key = resolve(Some("   \t"), Some(&format!("  {}  ", b64_key())), true).unwrap();
        assert_eq!(key.source(), KeySlot::Fallback);
        assert_eq!(key.mode(), KeyMode::Strict);

        let blank_both = resolve(Some(" "), Some("\n"), true);
        assert!(matches!(blank_both, Err(KeyError::Unavailable)));
    }

    #[test]
    fn legacy_rejected_in_production() {
        let key = resolve(Some("passphrase"), None, false).unwrap();
        let resolver = KeyResolver::new(Some(key), Environment::Production, false);
        assert!(matches!(
            resolver.require_usable(),
            Err(KeyError::WeakKeyRejected {
                slot: KeySlot::Primary
            })
        ));
        assert!(!resolver.encryption_enabled());
        assert!(resolver.material().is_ok());
    }

    #[test]
    fn legacy_allowed_in_development() {
        let key = resolve(Some("passphrase"), None, false).unwrap();
        let resolver = KeyResolver::new(Some(key), Environment::Development, false);
        assert_eq!(resolver.require_usable().unwrap().mode(), KeyMode::Legacy);
    }

    #[test]
    fn legacy_override_in_production() {
        let key = resolve(Some("passphrase"), None, false).unwrap();
        let resolver = KeyResolver::new(Some(key), Environment::Production, true);
        assert!(resolver.require_usable().is_ok());
    }

    #[test]
    fn strict_accepted_in_production() {
        let key = resolve(Some(&b64_key()), None, false).unwrap();
        let resolver = KeyResolver::new(Some(key), Environment::Production, false);
        assert!(resolver.encryption_enabled());
    }

    #[test]
    fn missing_key_is_unavailable() {
        let resolver = KeyResolver::new(None, Environment::Development, false);
        assert!(matches!(resolver.require_usable(), Err(KeyError::Unavailable)));
    }

    #[test]
    fn from_config_respects_fallback_switch() {
        let config = VaultConfig {
            fallback_key: Some(b64_key()),
            allow_fallback_key: true,
            ..VaultConfig::default()
        };
        let resolver = KeyResolver::from_config(&config);
        assert_eq!(resolver.material().unwrap().source(), KeySlot::Fallback);
    }

    #[test]
    fn debug_redacts_bytes() {
        let key = resolve(Some(&b64_key()), None, false).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("7, 7"));
    }
}
