use thiserror::Error;

/// Failures reported by a secret-store backend.
#[derive(Error, Debug)]
pub enum SecretStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Access denied for '{identifier}' by policy {policy}")]
    AccessDenied { identifier: String, policy: String },

    #[error("Platform secret store error ({code}): {message}")]
    Platform { code: i32, message: String },

    #[error("Secret store is corrupted: {0}")]
    Corrupted(String),

    #[error("Secret store credentials rejected")]
    InvalidCredentials,
}

impl SecretStoreError {
    /// Whether retrying the same idempotent call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SecretStoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            SecretStoreError::Platform { .. } => true,
            _ => false,
        }
    }

    /// Backend-specific error code, where one exists.
    pub fn code(&self) -> Option<i32> {
        match self {
            SecretStoreError::Platform { code, .. } => Some(*code),
            SecretStoreError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<bincode::Error> for SecretStoreError {
    fn from(err: bincode::Error) -> Self {
        SecretStoreError::Serialization(err.to_string())
    }
}

/// Key lifecycle failures.
#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Key storage failed for '{identifier}': {source}")]
    KeyStorageFailed {
        identifier: String,
        #[source]
        source: SecretStoreError,
    },

    #[error("Key retrieval failed for '{identifier}': {reason}")]
    KeyRetrievalFailed { identifier: String, reason: String },

    #[error("Key deletion failed for '{identifier}': {source}")]
    KeyDeletionFailed {
        identifier: String,
        #[source]
        source: SecretStoreError,
    },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Secret store backend error: {0}")]
    Backend(#[from] SecretStoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Encryption, derivation and MAC failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Algorithm not supported: {0}")]
    AlgorithmNotSupported(String),

    #[error("Insufficient key size: expected {expected} bits, got {actual}")]
    InsufficientKeySize { expected: usize, actual: usize },
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error for callers composing several subsystems.
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("General error: {0}")]
    General(String),
}

impl From<anyhow::Error> for SecurityError {
    fn from(err: anyhow::Error) -> Self {
        SecurityError::General(err.to_string())
    }
}

pub type Result<T, E = SecurityError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = SecretStoreError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(io.is_transient());

        let denied = SecretStoreError::AccessDenied {
            identifier: "k".into(),
            policy: "WhenUnlocked".into(),
        };
        assert!(!denied.is_transient());
        assert_eq!(denied.code(), None);

        let platform = SecretStoreError::Platform { code: -25300, message: "not found".into() };
        assert_eq!(platform.code(), Some(-25300));
    }

    #[test]
    fn test_decryption_error_leaks_nothing() {
        assert_eq!(CryptoError::DecryptionFailed.to_string(), "Decryption failed");
    }
}
