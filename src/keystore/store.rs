use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::backend::{access_denied, SecretStore};
use super::key::{KeyAccessibility, KeyAlgorithm, KeyMetadata, SecureKey, SecurityLevel};
use crate::crypto::{CipherService, EncryptedData};
use crate::error::{CryptoError, KeyStoreError, SecretStoreError};
use crate::security::secure_rng;

const RECORD_FORMAT_VERSION: u8 = 1;
const BACKUP_MAGIC: &[u8; 4] = b"WWKB";
const BACKUP_VERSION: u8 = 1;
const STAGING_SUFFIX: &str = ".rotating";

/// What one backend entry holds: descriptor and bytes together, so a single
/// put or delete covers both.
#[derive(Serialize)]
struct StoredKeyRecordRef<'a> {
    format_version: u8,
    metadata: &'a KeyMetadata,
    key_data: &'a [u8],
}

#[derive(Deserialize)]
struct StoredKeyRecord {
    format_version: u8,
    metadata: KeyMetadata,
    key_data: Vec<u8>,
}

/// Key lifecycle on top of a secret-store backend.
pub struct KeyStore {
    backend: Arc<dyn SecretStore>,
    cipher: CipherService,
    known_identifiers: RwLock<BTreeSet<String>>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn SecretStore>) -> Self {
        Self {
            backend,
            cipher: CipherService::new(),
            known_identifiers: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Fresh random key sized to `algorithm`, persisted before it is returned.
    pub fn generate(
        &self,
        identifier: &str,
        algorithm: KeyAlgorithm,
        accessibility: KeyAccessibility,
    ) -> Result<SecureKey, KeyStoreError> {
        if !self.backend.supports(accessibility) {
            return Err(KeyStoreError::KeyGenerationFailed(format!(
                "{} backend cannot hold {} keys",
                self.backend.name(),
                accessibility
            )));
        }
        let material = secure_rng::random::bytes(algorithm.key_size_bytes())
            .map_err(|e| KeyStoreError::KeyGenerationFailed(e.to_string()))?;
        let level = match algorithm {
            KeyAlgorithm::Aes128Gcm => SecurityLevel::Minimal,
            _ => SecurityLevel::High,
        };
        let key = SecureKey::new(identifier, algorithm, material, accessibility, level, None)
            .map_err(|e| KeyStoreError::KeyGenerationFailed(e.to_string()))?;

        self.store(&key, identifier, accessibility)?;
        info!(identifier, %algorithm, %accessibility, "Generated key");
        Ok(key)
    }

    /// Derives a key from a password and persists it under `identifier`.
    pub fn derive(
        &self,
        identifier: &str,
        password: &str,
        salt: &[u8],
        security_level: SecurityLevel,
        accessibility: KeyAccessibility,
    ) -> Result<SecureKey, KeyStoreError> {
        let key = self
            .cipher
            .derive_key_for_level(password, salt, security_level)?
            .with_identifier(identifier)
            .with_accessibility(accessibility);
        self.store(&key, identifier, accessibility)?;
        info!(identifier, level = ?security_level, "Derived and stored key");
        Ok(key)
    }

    /// Replaces whatever is stored under `identifier`. Policies the backend
    /// cannot honour are refused before anything is written.
    pub fn store(
        &self,
        key: &SecureKey,
        identifier: &str,
        accessibility: KeyAccessibility,
    ) -> Result<(), KeyStoreError> {
        validate_identifier(identifier)?;
        if !self.backend.supports(accessibility) {
            return Err(storage_failed(identifier, access_denied(identifier, accessibility)));
        }
        let key = key
            .duplicate()
            .with_identifier(identifier)
            .with_accessibility(accessibility);
        let record = encode_record(&key)?;

        self.with_retry(|| self.backend.delete(identifier))
            .map_err(|source| storage_failed(identifier, source))?;
        self.with_retry(|| self.backend.put(identifier, &record, accessibility))
            .map_err(|source| storage_failed(identifier, source))?;

        self.remember(identifier);
        debug!(identifier, backend = self.backend.name(), "Stored key");
        Ok(())
    }

    pub fn retrieve(&self, identifier: &str) -> Result<Option<SecureKey>, KeyStoreError> {
        let raw = match self.backend.get(identifier) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(SecretStoreError::Corrupted(reason)) => {
                return Err(KeyStoreError::KeyRetrievalFailed {
                    identifier: identifier.to_string(),
                    reason,
                })
            }
            Err(e) => return Err(KeyStoreError::Backend(e)),
        };
        let key = decode_record(raw.expose_secret()).map_err(|reason| {
            error!(identifier, %reason, "Stored key entry is unreadable");
            KeyStoreError::KeyRetrievalFailed {
                identifier: identifier.to_string(),
                reason,
            }
        })?;
        self.remember(identifier);
        Ok(Some(key))
    }

    /// Removing an absent key succeeds.
    pub fn delete(&self, identifier: &str) -> Result<(), KeyStoreError> {
        self.with_retry(|| self.backend.delete(identifier))
            .map_err(|source| {
                error!(identifier, error = %source, "Key deletion failed");
                KeyStoreError::KeyDeletionFailed {
                    identifier: identifier.to_string(),
                    source,
                }
            })?;
        if let Ok(mut known) = self.known_identifiers.write() {
            known.remove(identifier);
        }
        debug!(identifier, "Deleted key");
        Ok(())
    }

    pub fn exists(&self, identifier: &str) -> Result<bool, KeyStoreError> {
        Ok(self.backend.contains(identifier)?)
    }

    pub fn metadata(&self, identifier: &str) -> Result<Option<KeyMetadata>, KeyStoreError> {
        Ok(self.retrieve(identifier)?.map(|key| key.metadata().clone()))
    }

    /// Replaces the key with fresh material of the same algorithm, policy
    /// and level. The new key is staged first and then swapped in with one
    /// `put`, so the identifier always resolves to a complete key.
    pub fn rotate(&self, identifier: &str) -> Result<SecureKey, KeyStoreError> {
        let current = self
            .retrieve(identifier)?
            .ok_or_else(|| KeyStoreError::KeyNotFound(identifier.to_string()))?;
        let staging = staging_identifier(identifier);

        // Left over from an interrupted rotation.
        self.with_retry(|| self.backend.delete(&staging))
            .map_err(|source| storage_failed(&staging, source))?;

        let material = secure_rng::random::bytes(current.algorithm().key_size_bytes())
            .map_err(|e| KeyStoreError::KeyGenerationFailed(e.to_string()))?;
        let replacement = SecureKey::new(
            identifier,
            current.algorithm(),
            material,
            current.accessibility(),
            current.security_level(),
            None,
        )
        .map_err(|e| KeyStoreError::KeyGenerationFailed(e.to_string()))?;
        let record = encode_record(&replacement)?;

        self.with_retry(|| self.backend.put(&staging, &record, replacement.accessibility()))
            .map_err(|source| storage_failed(&staging, source))?;
        self.with_retry(|| self.backend.put(identifier, &record, replacement.accessibility()))
            .map_err(|source| storage_failed(identifier, source))?;
        if let Err(e) = self.with_retry(|| self.backend.delete(&staging)) {
            warn!(identifier, error = %e, "Rotated key but could not remove staging entry");
        }

        info!(identifier, algorithm = %replacement.algorithm(), "Rotated key");
        Ok(replacement)
    }

    /// Re-stores the same key bytes under a different policy.
    pub fn update_accessibility(
        &self,
        identifier: &str,
        accessibility: KeyAccessibility,
    ) -> Result<SecureKey, KeyStoreError> {
        let key = self
            .retrieve(identifier)?
            .ok_or_else(|| KeyStoreError::KeyNotFound(identifier.to_string()))?
            .with_accessibility(accessibility);
        self.store(&key, identifier, accessibility)?;
        info!(identifier, %accessibility, "Updated key accessibility");
        Ok(key)
    }

    /// Exports the key sealed under `wrapping_key`.
    pub fn backup(&self, identifier: &str, wrapping_key: &SecureKey) -> Result<Vec<u8>, KeyStoreError> {
        let key = self
            .retrieve(identifier)?
            .ok_or_else(|| KeyStoreError::KeyNotFound(identifier.to_string()))?;
        let record = encode_record(&key)?;
        let sealed = self.cipher.encrypt(&record, wrapping_key)?;

        let combined = sealed.to_combined();
        let mut out = Vec::with_capacity(6 + combined.len());
        out.extend_from_slice(BACKUP_MAGIC);
        out.push(BACKUP_VERSION);
        out.push(wrapping_key.algorithm().code());
        out.extend_from_slice(&combined);

        info!(identifier, wrapping_algorithm = %wrapping_key.algorithm(), "Exported key backup");
        Ok(out)
    }

    /// Imports a backup, storing it under `new_identifier` when given.
    pub fn restore(
        &self,
        backup: &[u8],
        wrapping_key: &SecureKey,
        new_identifier: Option<&str>,
    ) -> Result<SecureKey, KeyStoreError> {
        if backup.len() < 6 || &backup[..4] != BACKUP_MAGIC {
            return Err(KeyStoreError::InvalidKeyFormat("not a key backup".to_string()));
        }
        if backup[4] != BACKUP_VERSION {
            return Err(KeyStoreError::InvalidKeyFormat(format!(
                "unsupported backup version {}",
                backup[4]
            )));
        }
        if backup[5] != wrapping_key.algorithm().code() {
            return Err(KeyStoreError::InvalidKeyFormat(format!(
                "backup was wrapped with algorithm code {}, key is {}",
                backup[5],
                wrapping_key.algorithm()
            )));
        }

        let sealed = EncryptedData::from_combined(
            &backup[6..],
            wrapping_key.algorithm(),
            wrapping_key.security_level(),
        )
        .map_err(|e| KeyStoreError::InvalidKeyFormat(e.to_string()))?;
        let record = Zeroizing::new(self.cipher.decrypt(&sealed, wrapping_key).map_err(|e| match e {
            CryptoError::DecryptionFailed => {
                KeyStoreError::InvalidKeyFormat("backup could not be authenticated".to_string())
            }
            other => KeyStoreError::Crypto(other),
        })?);
        let key = decode_record(&record).map_err(KeyStoreError::InvalidKeyFormat)?;

        let identifier = new_identifier.unwrap_or(key.identifier()).to_string();
        let accessibility = key.accessibility();
        let key = key.with_identifier(&identifier);
        self.store(&key, &identifier, accessibility)?;
        info!(identifier = %identifier, "Restored key from backup");
        Ok(key)
    }

    /// Stored identifiers, sorted, without rotation staging entries. Also
    /// refreshes the in-memory set returned by `known_identifiers`.
    pub fn list_identifiers(&self) -> Result<Vec<String>, KeyStoreError> {
        let mut identifiers: Vec<String> = self
            .backend
            .list()?
            .into_iter()
            .filter(|id| !id.ends_with(STAGING_SUFFIX))
            .collect();
        identifiers.sort();
        identifiers.dedup();

        if let Ok(mut known) = self.known_identifiers.write() {
            *known = identifiers.iter().cloned().collect();
        }
        Ok(identifiers)
    }

    pub fn known_identifiers(&self) -> Vec<String> {
        self.known_identifiers
            .read()
            .map(|known| known.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remember(&self, identifier: &str) {
        if let Ok(mut known) = self.known_identifiers.write() {
            known.insert(identifier.to_string());
        }
    }

    /// Runs an idempotent backend call, retrying once on a transient error.
    fn with_retry<T>(
        &self,
        op: impl Fn() -> Result<T, SecretStoreError>,
    ) -> Result<T, SecretStoreError> {
        match op() {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Transient secret store error, retrying once");
                op()
            }
            other => other,
        }
    }
}

fn validate_identifier(identifier: &str) -> Result<(), KeyStoreError> {
    if identifier.is_empty() || identifier.len() > 256 {
        return Err(KeyStoreError::InvalidKeyFormat(
            "identifier must be 1 to 256 bytes".to_string(),
        ));
    }
    if identifier.ends_with(STAGING_SUFFIX) {
        return Err(KeyStoreError::InvalidKeyFormat(format!(
            "identifiers may not end with '{}'",
            STAGING_SUFFIX
        )));
    }
    Ok(())
}

fn staging_identifier(identifier: &str) -> String {
    format!("{}{}", identifier, STAGING_SUFFIX)
}

fn storage_failed(identifier: &str, source: SecretStoreError) -> KeyStoreError {
    error!(identifier, error = %source, "Key storage failed");
    KeyStoreError::KeyStorageFailed {
        identifier: identifier.to_string(),
        source,
    }
}

fn encode_record(key: &SecureKey) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
    let record = StoredKeyRecordRef {
        format_version: RECORD_FORMAT_VERSION,
        metadata: key.metadata(),
        key_data: key.expose_bytes(),
    };
    bincode::serialize(&record)
        .map(Zeroizing::new)
        .map_err(|e| KeyStoreError::InvalidKeyFormat(format!("record encoding failed: {}", e)))
}

fn decode_record(bytes: &[u8]) -> Result<SecureKey, String> {
    let StoredKeyRecord {
        format_version,
        metadata,
        key_data,
    } = bincode::deserialize(bytes).map_err(|e| format!("bad record encoding: {}", e))?;
    let mut key_data = Zeroizing::new(key_data);
    if format_version != RECORD_FORMAT_VERSION {
        return Err(format!("unknown record format version {}", format_version));
    }
    SecureKey::from_parts(std::mem::take(&mut *key_data), metadata).map_err(|e| e.to_string())
}
