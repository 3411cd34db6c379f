use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use secrecy::{ExposeSecret, Secret, SecretString, SecretVec};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};
use zeroize::Zeroize;

use super::{access_denied, AccessGate, OpenGate, SecretStore};
use crate::error::SecretStoreError;
use crate::keystore::key::KeyAccessibility;
use crate::security::secure_rng;

const STORE_FORMAT_VERSION: u8 = 1;
const CANARY: &[u8] = b"wealthwise encrypted file store";
pub(crate) const MIN_KDF_ITERATIONS: u32 = 10_000;

#[derive(Serialize, Deserialize, Clone)]
struct SealedEntry {
    ciphertext: Vec<u8>,
    nonce: [u8; 12],
    accessibility: KeyAccessibility,
    stored_at: i64,
}

/// On-disk image: KDF parameters, a sealed canary that proves the
/// passphrase, and the sealed entries.
#[derive(Serialize, Deserialize)]
struct StoreImage {
    version: u8,
    salt: [u8; 32],
    iterations: u32,
    canary_nonce: [u8; 12],
    canary: Vec<u8>,
    entries: BTreeMap<String, SealedEntry>,
}

/// Single-file store whose entries are sealed with ChaCha20-Poly1305 under a
/// key stretched from a passphrase. The identifier and policy are bound as
/// associated data, so entries cannot be swapped or re-labelled on disk.
pub struct EncryptedFileStore {
    path: PathBuf,
    store_key: Secret<[u8; 32]>,
    image: Mutex<StoreImage>,
    gate: Arc<dyn AccessGate>,
}

impl EncryptedFileStore {
    /// Opens the store at `path`, creating it when absent. `iterations` only
    /// applies to a new store; an existing one keeps its persisted count.
    pub fn open<P: AsRef<Path>>(
        path: P,
        passphrase: &SecretString,
        iterations: u32,
    ) -> Result<Self, SecretStoreError> {
        Self::open_with_gate(path, passphrase, iterations, Arc::new(OpenGate))
    }

    pub fn open_with_gate<P: AsRef<Path>>(
        path: P,
        passphrase: &SecretString,
        iterations: u32,
        gate: Arc<dyn AccessGate>,
    ) -> Result<Self, SecretStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let existing = match fs::read(&path) {
            Ok(data) if !data.is_empty() => Some(data),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let (store_key, image) = match existing {
            Some(data) => {
                let image: StoreImage = bincode::deserialize(&data)
                    .map_err(|e| SecretStoreError::Corrupted(format!("unreadable store file: {}", e)))?;
                if image.version != STORE_FORMAT_VERSION {
                    return Err(SecretStoreError::Corrupted(format!(
                        "unsupported store version {}",
                        image.version
                    )));
                }
                let store_key = derive_store_key(passphrase, &image.salt, image.iterations);
                let canary_aad = canary_aad(&image.salt);
                ChaCha20Poly1305::new(Key::from_slice(store_key.expose_secret()))
                    .decrypt(
                        Nonce::from_slice(&image.canary_nonce),
                        Payload { msg: &image.canary, aad: &canary_aad },
                    )
                    .map_err(|_| SecretStoreError::InvalidCredentials)?;
                debug!(path = %path.display(), entries = image.entries.len(), "Opened encrypted file store");
                (store_key, image)
            }
            None => {
                let salt = secure_rng::random::array::<32>().map_err(rng_failure)?;
                let iterations = iterations.max(MIN_KDF_ITERATIONS);
                let store_key = derive_store_key(passphrase, &salt, iterations);
                let canary_nonce = secure_rng::random::array::<12>().map_err(rng_failure)?;
                let canary_aad = canary_aad(&salt);
                let canary = ChaCha20Poly1305::new(Key::from_slice(store_key.expose_secret()))
                    .encrypt(
                        Nonce::from_slice(&canary_nonce),
                        Payload { msg: CANARY, aad: &canary_aad },
                    )
                    .map_err(|_| SecretStoreError::Corrupted("failed to seal store canary".to_string()))?;
                let image = StoreImage {
                    version: STORE_FORMAT_VERSION,
                    salt,
                    iterations,
                    canary_nonce,
                    canary,
                    entries: BTreeMap::new(),
                };
                write_image(&path, &image)?;
                info!(path = %path.display(), iterations, "Created encrypted file store");
                (store_key, image)
            }
        };

        Ok(Self {
            path,
            store_key,
            image: Mutex::new(image),
            gate,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.store_key.expose_secret()))
    }

    fn lock_image(&self) -> Result<std::sync::MutexGuard<'_, StoreImage>, SecretStoreError> {
        self.image
            .lock()
            .map_err(|_| SecretStoreError::Corrupted("file store lock poisoned".to_string()))
    }
}

impl SecretStore for EncryptedFileStore {
    fn put(
        &self,
        identifier: &str,
        secret: &[u8],
        accessibility: KeyAccessibility,
    ) -> Result<(), SecretStoreError> {
        let nonce = secure_rng::random::array::<12>().map_err(rng_failure)?;
        let aad = entry_aad(identifier, accessibility);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: secret, aad: &aad })
            .map_err(|_| SecretStoreError::Corrupted(format!("failed to seal entry '{}'", identifier)))?;

        let entry = SealedEntry {
            ciphertext,
            nonce,
            accessibility,
            stored_at: chrono::Utc::now().timestamp(),
        };

        let mut image = self.lock_image()?;
        let previous = image.entries.insert(identifier.to_string(), entry);
        if let Err(e) = write_image(&self.path, &image) {
            error!(identifier, error = %e, "Failed to persist file store, rolling back entry");
            match previous {
                Some(old) => image.entries.insert(identifier.to_string(), old),
                None => image.entries.remove(identifier),
            };
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, identifier: &str) -> Result<Option<SecretVec<u8>>, SecretStoreError> {
        let entry = {
            let image = self.lock_image()?;
            match image.entries.get(identifier) {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            }
        };

        if !self.gate.permits(entry.accessibility) {
            return Err(access_denied(identifier, entry.accessibility));
        }

        let aad = entry_aad(identifier, entry.accessibility);
        let plaintext = self
            .cipher()
            .decrypt(
                Nonce::from_slice(&entry.nonce),
                Payload { msg: &entry.ciphertext, aad: &aad },
            )
            .map_err(|_| SecretStoreError::Corrupted(format!("entry '{}' failed authentication", identifier)))?;
        Ok(Some(Secret::new(plaintext)))
    }

    fn delete(&self, identifier: &str) -> Result<(), SecretStoreError> {
        let mut image = self.lock_image()?;
        if let Some(removed) = image.entries.remove(identifier) {
            if let Err(e) = write_image(&self.path, &image) {
                image.entries.insert(identifier.to_string(), removed);
                return Err(e);
            }
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, SecretStoreError> {
        Ok(self.lock_image()?.entries.keys().cloned().collect())
    }

    fn contains(&self, identifier: &str) -> Result<bool, SecretStoreError> {
        Ok(self.lock_image()?.entries.contains_key(identifier))
    }

    fn name(&self) -> &'static str {
        "encrypted-file"
    }
}

fn derive_store_key(passphrase: &SecretString, salt: &[u8], iterations: u32) -> Secret<[u8; 32]> {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.expose_secret().as_bytes(), salt, iterations, &mut key);
    let secret = Secret::new(key);
    key.zeroize();
    secret
}

fn entry_aad(identifier: &str, accessibility: KeyAccessibility) -> Vec<u8> {
    format!("{}\u{0}{}", identifier, accessibility).into_bytes()
}

fn canary_aad(salt: &[u8]) -> Vec<u8> {
    let mut aad = CANARY.to_vec();
    aad.extend_from_slice(salt);
    aad
}

/// Writes through a temp file in the same directory and renames it over the
/// target, so a crash leaves either the old or the new image.
fn write_image(path: &Path, image: &StoreImage) -> Result<(), SecretStoreError> {
    let data = bincode::serialize(image)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SecretStoreError::Io(e.error))?;
    Ok(())
}

fn rng_failure(err: anyhow::Error) -> SecretStoreError {
    SecretStoreError::Platform {
        code: -1,
        message: format!("random generator unavailable: {}", err),
    }
}
