//! Key model, secret-store backends and the key lifecycle built on them.

pub mod backend;
pub mod key;
pub mod store;

pub use backend::{AccessGate, DeviceLockGate, EncryptedFileStore, MemorySecretStore, OpenGate, SecretStore};
#[cfg(feature = "platform-keyring")]
pub use backend::KeyringSecretStore;
pub use key::{
    DerivationContext, DerivationMethod, KeyAccessibility, KeyAlgorithm, KeyMetadata, SecureKey,
    SecurityLevel,
};
pub use store::KeyStore;
