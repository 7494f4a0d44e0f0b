//! Error types for `vaultline-core`.
//!
//! Each variant carries enough context to diagnose the problem without a
//! debugger. Crypto errors never include key material or plaintext, only
//! key slots, modes, or operation descriptions.
//!
//! Every error maps onto an [`ErrorKind`], the coarse taxonomy callers use to
//! pick a user-facing message ("not configured", "try again").

use vaultline_storage::StorageError;

use crate::keys::KeySlot;

/// Coarse classification shared by every error in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No usable key, or a required backend is not configured.
    Configuration,
    /// A passphrase-derived key was presented in production without override.
    WeakKeyRejected,
    /// Unrecognized version or algorithm, bad encoding, or bad IV/tag length.
    InvalidEnvelope,
    /// The context-binding check failed.
    AadMismatch,
    /// AEAD tag verification failed (tampering or wrong key).
    AuthenticationFailed,
    /// A backend read or write failed.
    StorageUnavailable,
    /// The caller passed an empty identifier or an unusable value.
    InvalidInput,
}

/// Errors from key resolution and key policy.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// No key material is configured in any permitted slot.
    #[error("no encryption key configured")]
    Unavailable,

    /// A legacy passphrase-derived key is not allowed in production.
    #[error(
        "key from {slot} slot is passphrase-derived; production requires a 32-byte random key (base64 or hex)"
    )]
    WeakKeyRejected { slot: KeySlot },
}

impl KeyError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable => ErrorKind::Configuration,
            Self::WeakKeyRejected { .. } => ErrorKind::WeakKeyRejected,
        }
    }
}

/// Errors from the envelope cipher.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The key policy refused to hand out a key.
    #[error("key unavailable: {0}")]
    Key(#[from] KeyError),

    /// The envelope is malformed. Raised before any cryptographic call.
    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// The envelope is not bound to the expected context.
    #[error("associated data mismatch: {reason}")]
    AadMismatch { reason: &'static str },

    /// AES-256-GCM tag verification failed (wrong key, corrupted ciphertext,
    /// or tampered tag or AAD).
    #[error("authentication failed: ciphertext, tag or associated data was modified, or the key is wrong")]
    AuthenticationFailed,

    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// The payload could not be serialized or deserialized.
    #[error("payload serialization failed: {reason}")]
    Serialization { reason: String },
}

impl CryptoError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Key(e) => e.kind(),
            Self::InvalidEnvelope { .. } | Self::Serialization { .. } => {
                ErrorKind::InvalidEnvelope
            }
            Self::AadMismatch { .. } => ErrorKind::AadMismatch,
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            Self::Encryption { .. } => ErrorKind::Configuration,
        }
    }
}

/// Errors from the knowledge vault store.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    /// Encrypting or decrypting a row payload failed.
    #[error("vault crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The relational backend failed.
    #[error("vault storage error: {0}")]
    Storage(#[from] StorageError),

    /// A stored row is inconsistent with its kind.
    #[error("vault row {id} is malformed: {reason}")]
    MalformedRow { id: String, reason: String },
}

impl KnowledgeError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Crypto(e) => e.kind(),
            Self::Storage(_) => ErrorKind::StorageUnavailable,
            Self::MalformedRow { .. } => ErrorKind::InvalidEnvelope,
        }
    }
}

/// Errors from the credential store.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Production policy refuses to persist or read tokens.
    #[error("credential store not configured: {reason}")]
    Configuration { reason: String },

    /// Encrypting the token failed.
    #[error("credential crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The relational backend failed.
    #[error("credential storage error: {0}")]
    Storage(#[from] StorageError),

    /// Missing item id or token.
    #[error("invalid credential input: {reason}")]
    InvalidInput { reason: &'static str },
}

impl CredentialError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Crypto(e) => e.kind(),
            Self::Storage(_) => ErrorKind::StorageUnavailable,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
        }
    }
}
