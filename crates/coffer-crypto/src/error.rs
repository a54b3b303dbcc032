//! Error types for Coffer cryptography.

use thiserror::Error;

/// Errors raised by the cipher, key-derivation, and credential layers.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Instance already finalized")]
    AlreadyFinalized,

    #[error("Encryption/decryption failure: {0}")]
    EncryptionDecryption(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid IV: expected {expected} bytes, got {actual}")]
    InvalidIv { expected: usize, actual: usize },

    #[error("Password authentication failure")]
    PasswordAuthenticationFailure,

    #[error("Credential secret derivation failed: {0}")]
    SecretDerivation(String),

    #[error("Credential invalid: {0}")]
    CredentialInvalid(String),
}

/// Result type alias for cryptographic operations.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;
