use secrecy::SecretString;
use std::sync::Arc;
use tracing::info;

use crate::config::{BackendKind, KeyStoreConfig, SecurityConfig};
use crate::crypto::{CipherService, DomainCipher};
use crate::error::{ConfigError, KeyStoreError, Result};
use crate::integrity::{DeviceProbe, IntegrityValidator};
use crate::keystore::{EncryptedFileStore, KeyStore, MemorySecretStore, SecretStore};

/// The wired security core. Build one per process and hand out clones of
/// the parts that callers need.
#[derive(Clone)]
pub struct SecurityServices {
    keystore: Arc<KeyStore>,
    cipher: CipherService,
    integrity: IntegrityValidator,
}

impl SecurityServices {
    /// Builds every service from configuration against the running host.
    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        config.validate()?;
        let backend = open_backend(&config.keystore)?;
        let cipher = CipherService::with_chunk_size(config.cipher.chunk_size)?;
        let integrity = IntegrityValidator::new(&config.integrity)?;
        Ok(Self::assemble(backend, cipher, integrity))
    }

    /// Builds the services over a caller-supplied secret store and probe.
    pub fn with_parts(
        config: &SecurityConfig,
        backend: Arc<dyn SecretStore>,
        probe: Arc<dyn DeviceProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let cipher = CipherService::with_chunk_size(config.cipher.chunk_size)?;
        let integrity = IntegrityValidator::builder(&config.integrity).probe(probe).build()?;
        Ok(Self::assemble(backend, cipher, integrity))
    }

    fn assemble(backend: Arc<dyn SecretStore>, cipher: CipherService, integrity: IntegrityValidator) -> Self {
        let keystore = Arc::new(KeyStore::new(backend));
        info!(backend = keystore.backend_name(), "Security services ready");
        Self {
            keystore,
            cipher,
            integrity,
        }
    }

    pub fn keystore(&self) -> Arc<KeyStore> {
        self.keystore.clone()
    }

    pub fn cipher(&self) -> &CipherService {
        &self.cipher
    }

    pub fn integrity(&self) -> &IntegrityValidator {
        &self.integrity
    }

    /// The plaintext-in, ciphertext-out contract for domain code.
    pub fn domain_cipher(&self) -> DomainCipher {
        DomainCipher::new(self.keystore.clone(), self.cipher.clone())
    }
}

fn open_backend(config: &KeyStoreConfig) -> Result<Arc<dyn SecretStore>> {
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(MemorySecretStore::new())),
        BackendKind::EncryptedFile => {
            let passphrase = std::env::var(&config.passphrase_env).map_err(|_| {
                ConfigError::Invalid(format!(
                    "encrypted-file backend requires a passphrase in ${}",
                    config.passphrase_env
                ))
            })?;
            let passphrase = SecretString::new(passphrase);
            let path = config.resolved_path();
            let store = EncryptedFileStore::open(&path, &passphrase, config.kdf_iterations)
                .map_err(KeyStoreError::from)?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "platform-keyring")]
        BackendKind::Keyring => Ok(Arc::new(crate::keystore::KeyringSecretStore::new(
            config.keyring_service.clone(),
        ))),
        #[cfg(not(feature = "platform-keyring"))]
        BackendKind::Keyring => Err(ConfigError::Invalid(
            "keyring backend requires the platform-keyring feature".to_string(),
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::StaticProbe;
    use crate::keystore::{KeyAccessibility, KeyAlgorithm};

    #[tokio::test]
    async fn test_services_wire_together() {
        let services = SecurityServices::with_parts(
            &SecurityConfig::default(),
            Arc::new(MemorySecretStore::new()),
            Arc::new(StaticProbe::default()),
        )
        .unwrap();

        let domain = services.domain_cipher();
        domain.ensure_key("accounts").unwrap();
        let sealed = domain.encrypt(b"balance: 1200.00", "accounts").unwrap();
        assert_eq!(domain.decrypt(&sealed, "accounts").unwrap(), b"balance: 1200.00");

        let key = services
            .keystore()
            .generate("budgets", KeyAlgorithm::ChaCha20Poly1305, KeyAccessibility::WhenUnlocked)
            .unwrap();
        let data = services.cipher().encrypt(b"groceries", &key).unwrap();
        assert_eq!(services.cipher().decrypt(&data, &key).unwrap(), b"groceries");

        assert!(services.integrity().validate_now().await.is_valid);
    }

    #[test]
    fn test_memory_backend_from_config() {
        let mut config = SecurityConfig::default();
        config.keystore.backend = BackendKind::Memory;
        let services = SecurityServices::from_config(&config).unwrap();
        assert_eq!(services.keystore().backend_name(), "memory");
    }

    #[test]
    fn test_file_backend_requires_passphrase() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = SecurityConfig::default();
        config.keystore.path = Some(dir.path().join("keystore.bin"));
        config.keystore.passphrase_env = "WEALTHWISE_TEST_UNSET_PASSPHRASE".to_string();
        let result = SecurityServices::from_config(&config);
        assert!(matches!(
            result,
            Err(crate::error::SecurityError::Config(ConfigError::Invalid(_)))
        ));
    }
}
