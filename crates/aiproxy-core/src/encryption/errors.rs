//! Error type for the encryption service.

/// Result type alias for encryption operations.
pub type EncryptionResult<T> = std::result::Result<T, EncryptionError>;

/// Errors produced by [`crate::encryption::EncryptionService`].
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    EncryptFailed(String),

    #[error("decryption failed: {0}")]
    DecryptFailed(String),

    #[error("invalid ciphertext encoding: {0}")]
    InvalidEncoding(String),
}

impl EncryptionError {
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey(message.into())
    }
}
