use aes_gcm::{
    aead::{consts::{U12, U16}, generic_array::GenericArray, AeadCore, AeadInPlace, KeyInit},
    Aes128Gcm, Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use super::encrypted_data::{EncryptedData, NONCE_LEN, TAG_LEN};
use crate::error::CryptoError;
use crate::keystore::key::{
    DerivationContext, DerivationMethod, KeyAccessibility, KeyAlgorithm, SecureKey, SecurityLevel,
};
use crate::security::secure_rng;

type HmacSha256 = Hmac<Sha256>;

/// Stateless symmetric primitives. Keys are always passed in; the service
/// never looks anything up.
#[derive(Clone, Debug)]
pub struct CipherService {
    chunk_size: usize,
}

impl Default for CipherService {
    fn default() -> Self {
        Self {
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl CipherService {
    pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;
    pub const MIN_ITERATIONS: u32 = 10_000;
    pub const MIN_SALT_LEN: usize = 16;
    /// Largest chunk whose combined encoding still fits a u32 length prefix.
    pub const MAX_CHUNK_SIZE: usize = u32::MAX as usize - NONCE_LEN - TAG_LEN;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(chunk_size: usize) -> Result<Self, CryptoError> {
        if chunk_size == 0 {
            return Err(CryptoError::InvalidData("chunk size must be non-zero".to_string()));
        }
        if chunk_size > Self::MAX_CHUNK_SIZE {
            return Err(CryptoError::InvalidData(format!(
                "chunk size {} exceeds {}",
                chunk_size,
                Self::MAX_CHUNK_SIZE
            )));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Seals `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8], key: &SecureKey) -> Result<EncryptedData, CryptoError> {
        self.encrypt_with_aad(plaintext, key, &[])
    }

    pub fn decrypt(&self, data: &EncryptedData, key: &SecureKey) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_with_aad(data, key, &[])
    }

    pub(crate) fn encrypt_with_aad(
        &self,
        plaintext: &[u8],
        key: &SecureKey,
        aad: &[u8],
    ) -> Result<EncryptedData, CryptoError> {
        check_aead_key(key)?;
        if plaintext.is_empty() {
            return Err(CryptoError::InvalidData("plaintext is empty".to_string()));
        }

        let nonce = secure_rng::random::array::<NONCE_LEN>()
            .map_err(|e| CryptoError::EncryptionFailed(format!("nonce generation failed: {}", e)))?;
        let mut buffer = plaintext.to_vec();
        let tag = match key.algorithm() {
            KeyAlgorithm::Aes128Gcm => seal::<Aes128Gcm>(key.expose_bytes(), &nonce, aad, &mut buffer),
            KeyAlgorithm::Aes256Gcm => seal::<Aes256Gcm>(key.expose_bytes(), &nonce, aad, &mut buffer),
            KeyAlgorithm::ChaCha20Poly1305 => {
                seal::<ChaCha20Poly1305>(key.expose_bytes(), &nonce, aad, &mut buffer)
            }
            other => Err(CryptoError::AlgorithmNotSupported(other.to_string())),
        };
        let tag = match tag {
            Ok(tag) => tag,
            Err(e) => {
                buffer.zeroize();
                return Err(e);
            }
        };

        Ok(EncryptedData {
            ciphertext: buffer,
            nonce,
            tag,
            algorithm: key.algorithm(),
            security_level: key.security_level(),
            key_identifier: Some(key.identifier().to_string()),
            timestamp: Utc::now(),
        })
    }

    pub(crate) fn decrypt_with_aad(
        &self,
        data: &EncryptedData,
        key: &SecureKey,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        check_aead_key(key)?;
        if data.algorithm != key.algorithm() {
            return Err(CryptoError::InvalidKey(format!(
                "data sealed with {}, key is {}",
                data.algorithm,
                key.algorithm()
            )));
        }

        let mut buffer = data.ciphertext.clone();
        let opened = match key.algorithm() {
            KeyAlgorithm::Aes128Gcm => open::<Aes128Gcm>(key.expose_bytes(), &data.nonce, aad, &mut buffer, &data.tag),
            KeyAlgorithm::Aes256Gcm => open::<Aes256Gcm>(key.expose_bytes(), &data.nonce, aad, &mut buffer, &data.tag),
            KeyAlgorithm::ChaCha20Poly1305 => {
                open::<ChaCha20Poly1305>(key.expose_bytes(), &data.nonce, aad, &mut buffer, &data.tag)
            }
            other => Err(CryptoError::AlgorithmNotSupported(other.to_string())),
        };
        match opened {
            Ok(()) => Ok(buffer),
            Err(e) => {
                buffer.zeroize();
                Err(e)
            }
        }
    }

    /// PBKDF2-HMAC-SHA256. The same inputs always yield the same key.
    pub fn derive_key(
        &self,
        password: &str,
        salt: &[u8],
        iterations: u32,
        security_level: SecurityLevel,
    ) -> Result<SecureKey, CryptoError> {
        if password.is_empty() {
            return Err(CryptoError::KeyDerivationFailed("password is empty".to_string()));
        }
        if iterations < Self::MIN_ITERATIONS {
            return Err(CryptoError::KeyDerivationFailed(format!(
                "{} iterations is below the minimum of {}",
                iterations,
                Self::MIN_ITERATIONS
            )));
        }
        if salt.len() < Self::MIN_SALT_LEN {
            return Err(CryptoError::KeyDerivationFailed(format!(
                "salt is {} bytes, need at least {}",
                salt.len(),
                Self::MIN_SALT_LEN
            )));
        }

        let algorithm = security_level.algorithm();
        let mut derived = Zeroizing::new(vec![0u8; algorithm.key_size_bytes()]);
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut derived);

        let identifier = format!("pbkdf2:{}", hex::encode(&Sha256::digest(salt)[..8]));
        debug!(%identifier, iterations, %algorithm, "Derived key from password");

        SecureKey::new(
            identifier,
            algorithm,
            std::mem::take(&mut *derived),
            KeyAccessibility::default(),
            security_level,
            Some(DerivationContext {
                method: DerivationMethod::Pbkdf2HmacSha256,
                iterations,
                salt: salt.to_vec(),
            }),
        )
    }

    pub fn derive_key_for_level(
        &self,
        password: &str,
        salt: &[u8],
        security_level: SecurityLevel,
    ) -> Result<SecureKey, CryptoError> {
        self.derive_key(password, salt, security_level.recommended_iterations(), security_level)
    }

    /// Fresh AEAD key for the level. Not persisted anywhere.
    pub fn generate_random_key(&self, security_level: SecurityLevel) -> Result<SecureKey, CryptoError> {
        self.generate_key(security_level.algorithm(), security_level)
    }

    /// Fresh key for HMAC-SHA256 tagging.
    pub fn generate_mac_key(&self) -> Result<SecureKey, CryptoError> {
        self.generate_key(KeyAlgorithm::HmacSha256, SecurityLevel::High)
    }

    pub(crate) fn generate_key(
        &self,
        algorithm: KeyAlgorithm,
        security_level: SecurityLevel,
    ) -> Result<SecureKey, CryptoError> {
        let material = secure_rng::random::bytes(algorithm.key_size_bytes())
            .map_err(|e| CryptoError::InvalidKey(format!("random generator unavailable: {}", e)))?;
        let suffix = secure_rng::random::array::<8>()
            .map_err(|e| CryptoError::InvalidKey(format!("random generator unavailable: {}", e)))?;
        SecureKey::new(
            format!("ephemeral:{}", hex::encode(suffix)),
            algorithm,
            material,
            KeyAccessibility::default(),
            security_level,
            None,
        )
    }

    pub fn hash(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    pub fn hmac(&self, data: &[u8], key: &SecureKey) -> Result<[u8; 32], CryptoError> {
        if key.algorithm() != KeyAlgorithm::HmacSha256 {
            return Err(CryptoError::InvalidKey(format!(
                "{} key cannot be used for HMAC-SHA256",
                key.algorithm()
            )));
        }
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key.expose_bytes())
            .map_err(|_| CryptoError::InvalidKey("HMAC key rejected".to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Constant-time tag comparison; any error reads as a mismatch.
    pub fn verify_hmac(&self, data: &[u8], tag: &[u8], key: &SecureKey) -> bool {
        match self.hmac(data, key) {
            Ok(expected) => expected.ct_eq(tag).into(),
            Err(_) => false,
        }
    }
}

fn check_aead_key(key: &SecureKey) -> Result<(), CryptoError> {
    let algorithm = key.algorithm();
    if !algorithm.is_aead() {
        return Err(CryptoError::InvalidKey(format!(
            "{} is not an authenticated encryption algorithm",
            algorithm
        )));
    }
    if key.expose_bytes().len() != algorithm.key_size_bytes() {
        return Err(CryptoError::InvalidKey(format!(
            "{} needs a {}-byte key",
            algorithm,
            algorithm.key_size_bytes()
        )));
    }
    Ok(())
}

fn seal<C>(key: &[u8], nonce: &[u8; NONCE_LEN], aad: &[u8], buffer: &mut [u8]) -> Result<[u8; TAG_LEN], CryptoError>
where
    C: KeyInit + AeadInPlace + AeadCore<NonceSize = U12, TagSize = U16>,
{
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKey("key length rejected".to_string()))?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)
        .map_err(|_| CryptoError::EncryptionFailed("AEAD seal failed".to_string()))?;
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(tag.as_slice());
    Ok(out)
}

fn open<C>(
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8; TAG_LEN],
) -> Result<(), CryptoError>
where
    C: KeyInit + AeadInPlace + AeadCore<NonceSize = U12, TagSize = U16>,
{
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKey("key length rejected".to_string()))?;
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}
