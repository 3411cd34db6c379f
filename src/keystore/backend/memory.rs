use secrecy::{Secret, SecretVec};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use zeroize::Zeroizing;

use super::{access_denied, AccessGate, OpenGate, SecretStore};
use crate::error::SecretStoreError;
use crate::keystore::key::KeyAccessibility;

struct MemoryEntry {
    secret: Zeroizing<Vec<u8>>,
    accessibility: KeyAccessibility,
}

/// Process-local secret store. Nothing survives the process.
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    gate: Arc<dyn AccessGate>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::with_gate(Arc::new(OpenGate))
    }

    pub fn with_gate(gate: Arc<dyn AccessGate>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            gate,
        }
    }

    fn poisoned() -> SecretStoreError {
        SecretStoreError::Corrupted("memory store lock poisoned".to_string())
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for MemorySecretStore {
    fn put(
        &self,
        identifier: &str,
        secret: &[u8],
        accessibility: KeyAccessibility,
    ) -> Result<(), SecretStoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(
            identifier.to_string(),
            MemoryEntry {
                secret: Zeroizing::new(secret.to_vec()),
                accessibility,
            },
        );
        Ok(())
    }

    fn get(&self, identifier: &str) -> Result<Option<SecretVec<u8>>, SecretStoreError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        match entries.get(identifier) {
            None => Ok(None),
            Some(entry) if !self.gate.permits(entry.accessibility) => {
                Err(access_denied(identifier, entry.accessibility))
            }
            Some(entry) => Ok(Some(Secret::new(entry.secret.to_vec()))),
        }
    }

    fn delete(&self, identifier: &str) -> Result<(), SecretStoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.remove(identifier);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, SecretStoreError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.keys().cloned().collect())
    }

    fn contains(&self, identifier: &str) -> Result<bool, SecretStoreError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.contains_key(identifier))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
