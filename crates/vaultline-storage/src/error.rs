//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger. Values are never included: they are ciphertext at
//! best and plaintext fallbacks at worst.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open or connect to the backend.
    #[error("failed to open storage at '{target}': {reason}")]
    Open { target: String, reason: String },

    /// Failed to read from the backend.
    #[error("failed to read '{target}': {reason}")]
    Read { target: String, reason: String },

    /// Failed to write to the backend.
    #[error("failed to write '{target}': {reason}")]
    Write { target: String, reason: String },

    /// A stored row or line could not be decoded into its typed form.
    #[error("corrupt record in '{target}': {reason}")]
    Corrupt { target: String, reason: String },
}

impl StorageError {
    /// Name of the table, list key, or file the error refers to.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Open { target, .. }
            | Self::Read { target, .. }
            | Self::Write { target, .. }
            | Self::Corrupt { target, .. } => target,
        }
    }
}
