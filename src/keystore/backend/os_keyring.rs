use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyring::Entry;
use secrecy::{Secret, SecretVec};
use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::SecretStore;
use crate::error::SecretStoreError;
use crate::keystore::key::KeyAccessibility;

const INDEX_ACCOUNT: &str = "__wealthwise_index__";

/// OS credential store (Keychain, Credential Manager, Secret Service).
/// Values are stored base64 encoded with the policy name in front; the
/// policy itself is enforced by the OS store's own defaults.
pub struct KeyringSecretStore {
    service: String,
    index_lock: Mutex<()>,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            index_lock: Mutex::new(()),
        }
    }

    fn entry(&self, account: &str) -> Result<Entry, SecretStoreError> {
        Entry::new(&self.service, account).map_err(platform_error)
    }

    fn read_index(&self) -> Result<BTreeSet<String>, SecretStoreError> {
        match self.entry(INDEX_ACCOUNT)?.get_password() {
            Ok(raw) => Ok(raw
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(keyring::Error::NoEntry) => Ok(BTreeSet::new()),
            Err(e) => Err(platform_error(e)),
        }
    }

    fn write_index(&self, index: &BTreeSet<String>) -> Result<(), SecretStoreError> {
        let entry = self.entry(INDEX_ACCOUNT)?;
        if index.is_empty() {
            return match entry.delete_password() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(platform_error(e)),
            };
        }
        let joined = index.iter().cloned().collect::<Vec<_>>().join("\n");
        entry.set_password(&joined).map_err(platform_error)
    }

    fn update_index(&self, apply: impl FnOnce(&mut BTreeSet<String>) -> bool) -> Result<(), SecretStoreError> {
        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| SecretStoreError::Corrupted("keyring index lock poisoned".to_string()))?;
        let mut index = self.read_index()?;
        if apply(&mut index) {
            self.write_index(&index)?;
        }
        Ok(())
    }
}

impl SecretStore for KeyringSecretStore {
    fn put(
        &self,
        identifier: &str,
        secret: &[u8],
        accessibility: KeyAccessibility,
    ) -> Result<(), SecretStoreError> {
        if identifier == INDEX_ACCOUNT {
            return Err(SecretStoreError::AccessDenied {
                identifier: identifier.to_string(),
                policy: "reserved".to_string(),
            });
        }
        let encoded = Zeroizing::new(format!("{}:{}", accessibility, STANDARD.encode(secret)));
        self.entry(identifier)?
            .set_password(&encoded)
            .map_err(platform_error)?;
        self.update_index(|index| index.insert(identifier.to_string()))?;
        debug!(identifier, service = %self.service, "Stored keyring entry");
        Ok(())
    }

    fn get(&self, identifier: &str) -> Result<Option<SecretVec<u8>>, SecretStoreError> {
        let raw = match self.entry(identifier)?.get_password() {
            Ok(raw) => Zeroizing::new(raw),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(platform_error(e)),
        };
        let (_, payload) = raw
            .split_once(':')
            .ok_or_else(|| SecretStoreError::Corrupted(format!("entry '{}' has no policy prefix", identifier)))?;
        let bytes = STANDARD
            .decode(payload)
            .map_err(|e| SecretStoreError::Corrupted(format!("entry '{}' is not base64: {}", identifier, e)))?;
        Ok(Some(Secret::new(bytes)))
    }

    fn delete(&self, identifier: &str) -> Result<(), SecretStoreError> {
        match self.entry(identifier)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(platform_error(e)),
        }
        self.update_index(|index| index.remove(identifier))
    }

    fn list(&self) -> Result<Vec<String>, SecretStoreError> {
        Ok(self.read_index()?.into_iter().collect())
    }

    fn name(&self) -> &'static str {
        "keyring"
    }
}

fn platform_error(err: keyring::Error) -> SecretStoreError {
    let code = match &err {
        keyring::Error::NoStorageAccess(_) => -2,
        keyring::Error::PlatformFailure(_) => -3,
        _ => -1,
    };
    warn!(code, error = %err, "Keyring operation failed");
    SecretStoreError::Platform {
        code,
        message: err.to_string(),
    }
}
