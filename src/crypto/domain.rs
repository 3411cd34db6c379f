use std::sync::Arc;
use tracing::{debug, info};

use super::cipher::CipherService;
use super::encrypted_data::EncryptedData;
use crate::error::{CryptoError, KeyStoreError, Result};
use crate::keystore::{KeyAccessibility, KeyAlgorithm, KeyMetadata, KeyStore, SecureKey};

/// Encryption by key identifier for domain code (transactions, budgets,
/// goals). Callers hand over plaintext and get the combined encoding back;
/// key material never leaves this type.
#[derive(Clone)]
pub struct DomainCipher {
    keystore: Arc<KeyStore>,
    cipher: CipherService,
}

impl DomainCipher {
    pub fn new(keystore: Arc<KeyStore>, cipher: CipherService) -> Self {
        Self { keystore, cipher }
    }

    pub fn encrypt(&self, plaintext: &[u8], key_identifier: &str) -> Result<Vec<u8>> {
        let key = self.load(key_identifier)?;
        let sealed = self.cipher.encrypt(plaintext, &key)?;
        debug!(key_identifier, bytes = plaintext.len(), "Encrypted domain record");
        Ok(sealed.to_combined())
    }

    pub fn decrypt(&self, combined: &[u8], key_identifier: &str) -> Result<Vec<u8>> {
        let key = self.load(key_identifier)?;
        // Short input is reported like any other unauthentic payload.
        let sealed = EncryptedData::from_combined(combined, key.algorithm(), key.security_level())
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(self.cipher.decrypt(&sealed, &key)?)
    }

    /// Provisions an AES-256-GCM key under `identifier` unless one exists.
    pub fn ensure_key(&self, identifier: &str) -> Result<KeyMetadata> {
        if let Some(metadata) = self.keystore.metadata(identifier)? {
            return Ok(metadata);
        }
        let key = self
            .keystore
            .generate(identifier, KeyAlgorithm::Aes256Gcm, KeyAccessibility::default())?;
        info!(identifier, "Provisioned domain key");
        Ok(key.metadata().clone())
    }

    fn load(&self, identifier: &str) -> Result<SecureKey> {
        Ok(self
            .keystore
            .retrieve(identifier)?
            .ok_or_else(|| KeyStoreError::KeyNotFound(identifier.to_string()))?)
    }
}
