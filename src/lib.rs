//! On-device security core for WealthWise: key lifecycle over pluggable
//! secret stores, authenticated encryption, and device integrity validation
//! with background monitoring.

pub mod config;
pub mod crypto;
pub mod error;
pub mod integrity;
pub mod keystore;
pub mod logging;
pub mod security;
pub mod services;

pub use config::SecurityConfig;
pub use crypto::{CipherService, DomainCipher, EncryptedData};
pub use error::{CryptoError, KeyStoreError, Result, SecretStoreError, SecurityError};
pub use integrity::{IntegrityValidator, SecurityEvent, ValidationResult};
pub use keystore::{KeyStore, SecureKey};
pub use services::SecurityServices;
