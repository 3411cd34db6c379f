use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret, SecretVec};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// Algorithms a stored key can be bound to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    HmacSha256,
    X25519,
}

impl KeyAlgorithm {
    pub const fn key_size_bits(&self) -> usize {
        match self {
            KeyAlgorithm::Aes128Gcm => 128,
            KeyAlgorithm::Aes256Gcm
            | KeyAlgorithm::ChaCha20Poly1305
            | KeyAlgorithm::HmacSha256
            | KeyAlgorithm::X25519 => 256,
        }
    }

    pub const fn key_size_bytes(&self) -> usize {
        self.key_size_bits() / 8
    }

    /// Whether the algorithm provides authenticated encryption.
    pub const fn is_aead(&self) -> bool {
        matches!(
            self,
            KeyAlgorithm::Aes128Gcm | KeyAlgorithm::Aes256Gcm | KeyAlgorithm::ChaCha20Poly1305
        )
    }

    /// Stable one-byte tag used in the binary layouts.
    pub const fn code(&self) -> u8 {
        match self {
            KeyAlgorithm::Aes128Gcm => 1,
            KeyAlgorithm::Aes256Gcm => 2,
            KeyAlgorithm::ChaCha20Poly1305 => 3,
            KeyAlgorithm::HmacSha256 => 4,
            KeyAlgorithm::X25519 => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(KeyAlgorithm::Aes128Gcm),
            2 => Some(KeyAlgorithm::Aes256Gcm),
            3 => Some(KeyAlgorithm::ChaCha20Poly1305),
            4 => Some(KeyAlgorithm::HmacSha256),
            5 => Some(KeyAlgorithm::X25519),
            _ => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Aes128Gcm => write!(f, "AES-128-GCM"),
            KeyAlgorithm::Aes256Gcm => write!(f, "AES-256-GCM"),
            KeyAlgorithm::ChaCha20Poly1305 => write!(f, "ChaCha20-Poly1305"),
            KeyAlgorithm::HmacSha256 => write!(f, "HMAC-SHA256"),
            KeyAlgorithm::X25519 => write!(f, "X25519"),
        }
    }
}

/// When the platform may release a key to the process.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum KeyAccessibility {
    WhenUnlocked,
    AfterFirstUnlock,
    #[default]
    WhenUnlockedThisDeviceOnly,
    AfterFirstUnlockThisDeviceOnly,
    WhenPasscodeSetThisDeviceOnly,
    /// Requires a biometric match against the currently enrolled set.
    BiometryCurrentSet,
    /// Bound to a hardware enclave; never leaves the device.
    SecureEnclave,
}

impl KeyAccessibility {
    /// Policies that must not be satisfied while the device is locked.
    pub const fn requires_unlocked_device(&self) -> bool {
        !matches!(
            self,
            KeyAccessibility::AfterFirstUnlock | KeyAccessibility::AfterFirstUnlockThisDeviceOnly
        )
    }

    pub const fn requires_user_presence(&self) -> bool {
        matches!(self, KeyAccessibility::BiometryCurrentSet)
    }

    pub const fn is_device_bound(&self) -> bool {
        !matches!(
            self,
            KeyAccessibility::WhenUnlocked | KeyAccessibility::AfterFirstUnlock
        )
    }
}

impl fmt::Display for KeyAccessibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Strength tier requested by callers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SecurityLevel {
    Minimal,
    #[default]
    Standard,
    High,
    Maximum,
    Quantum,
}

impl SecurityLevel {
    /// Symmetric algorithm used for keys generated or derived at this level.
    pub const fn algorithm(&self) -> KeyAlgorithm {
        match self {
            SecurityLevel::Minimal => KeyAlgorithm::Aes128Gcm,
            _ => KeyAlgorithm::Aes256Gcm,
        }
    }

    /// PBKDF2-HMAC-SHA256 work factor recommended for this level.
    pub const fn recommended_iterations(&self) -> u32 {
        match self {
            SecurityLevel::Minimal => 10_000,
            SecurityLevel::Standard => 100_000,
            SecurityLevel::High => 210_000,
            SecurityLevel::Maximum => 310_000,
            SecurityLevel::Quantum => 600_000,
        }
    }

    pub const fn code(&self) -> u8 {
        match self {
            SecurityLevel::Minimal => 0,
            SecurityLevel::Standard => 1,
            SecurityLevel::High => 2,
            SecurityLevel::Maximum => 3,
            SecurityLevel::Quantum => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SecurityLevel::Minimal),
            1 => Some(SecurityLevel::Standard),
            2 => Some(SecurityLevel::High),
            3 => Some(SecurityLevel::Maximum),
            4 => Some(SecurityLevel::Quantum),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerivationMethod {
    Pbkdf2HmacSha256,
}

/// How a password-derived key was produced.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DerivationContext {
    pub method: DerivationMethod,
    pub iterations: u32,
    pub salt: Vec<u8>,
}

/// Everything about a key except its bytes; safe to list and log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyMetadata {
    pub identifier: String,
    pub algorithm: KeyAlgorithm,
    pub key_size: usize,
    pub created_at: DateTime<Utc>,
    pub accessibility: KeyAccessibility,
    pub security_level: SecurityLevel,
    pub derivation: Option<DerivationContext>,
}

/// Key material plus its descriptor. The bytes are zeroized on drop and are
/// only reachable from inside the crate.
pub struct SecureKey {
    data: SecretVec<u8>,
    metadata: KeyMetadata,
}

impl SecureKey {
    /// Builds a key, checking that the byte length matches the algorithm.
    pub fn new(
        identifier: impl Into<String>,
        algorithm: KeyAlgorithm,
        key_data: Vec<u8>,
        accessibility: KeyAccessibility,
        security_level: SecurityLevel,
        derivation: Option<DerivationContext>,
    ) -> Result<Self, CryptoError> {
        let metadata = KeyMetadata {
            identifier: identifier.into(),
            algorithm,
            key_size: algorithm.key_size_bits(),
            created_at: Utc::now(),
            accessibility,
            security_level,
            derivation,
        };
        Self::from_parts(key_data, metadata)
    }

    /// Rebuilds a key from persisted parts, enforcing the size invariant.
    pub(crate) fn from_parts(key_data: Vec<u8>, metadata: KeyMetadata) -> Result<Self, CryptoError> {
        let data = Secret::new(key_data);
        let actual = data.expose_secret().len() * 8;
        if metadata.key_size != metadata.algorithm.key_size_bits() {
            return Err(CryptoError::InvalidKey(format!(
                "{} requires {} bits, metadata declares {}",
                metadata.algorithm,
                metadata.algorithm.key_size_bits(),
                metadata.key_size
            )));
        }
        if actual != metadata.key_size {
            return Err(CryptoError::InsufficientKeySize {
                expected: metadata.key_size,
                actual,
            });
        }
        Ok(Self { data, metadata })
    }

    pub fn identifier(&self) -> &str {
        &self.metadata.identifier
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.metadata.algorithm
    }

    pub fn key_size(&self) -> usize {
        self.metadata.key_size
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.metadata.created_at
    }

    pub fn accessibility(&self) -> KeyAccessibility {
        self.metadata.accessibility
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.metadata.security_level
    }

    pub fn derivation(&self) -> Option<&DerivationContext> {
        self.metadata.derivation.as_ref()
    }

    pub fn metadata(&self) -> &KeyMetadata {
        &self.metadata
    }

    pub(crate) fn expose_bytes(&self) -> &[u8] {
        self.data.expose_secret()
    }

    /// Explicit copy for the few places that must hand a key to two owners.
    pub(crate) fn duplicate(&self) -> SecureKey {
        SecureKey {
            data: Secret::new(self.data.expose_secret().clone()),
            metadata: self.metadata.clone(),
        }
    }

    pub(crate) fn with_identifier(mut self, identifier: &str) -> SecureKey {
        self.metadata.identifier = identifier.to_string();
        self
    }

    pub(crate) fn with_accessibility(mut self, accessibility: KeyAccessibility) -> SecureKey {
        self.metadata.accessibility = accessibility;
        self
    }
}

impl PartialEq for SecureKey {
    fn eq(&self, other: &Self) -> bool {
        let same_bytes: bool = self.expose_bytes().ct_eq(other.expose_bytes()).into();
        same_bytes && self.metadata == other.metadata
    }
}

impl fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureKey")
            .field("identifier", &self.metadata.identifier)
            .field("algorithm", &self.metadata.algorithm)
            .field("key_size", &self.metadata.key_size)
            .field("data", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(KeyAlgorithm::Aes128Gcm, 16)]
    #[case(KeyAlgorithm::Aes256Gcm, 32)]
    #[case(KeyAlgorithm::ChaCha20Poly1305, 32)]
    #[case(KeyAlgorithm::HmacSha256, 32)]
    #[case(KeyAlgorithm::X25519, 32)]
    fn test_key_size_invariant(#[case] algorithm: KeyAlgorithm, #[case] bytes: usize) {
        let key = SecureKey::new(
            "k",
            algorithm,
            vec![7u8; bytes],
            KeyAccessibility::default(),
            SecurityLevel::Standard,
            None,
        )
        .expect("size matches algorithm");
        assert_eq!(key.key_size(), bytes * 8);
        assert_eq!(KeyAlgorithm::from_code(algorithm.code()), Some(algorithm));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = SecureKey::new(
            "k",
            KeyAlgorithm::Aes256Gcm,
            vec![0u8; 16],
            KeyAccessibility::default(),
            SecurityLevel::Standard,
            None,
        )
        .unwrap_err();
        assert_eq!(err, CryptoError::InsufficientKeySize { expected: 256, actual: 128 });
    }

    #[test]
    fn test_debug_redacts_bytes() {
        let key = SecureKey::new(
            "ledger",
            KeyAlgorithm::Aes256Gcm,
            vec![0xAB; 32],
            KeyAccessibility::default(),
            SecurityLevel::High,
            None,
        )
        .unwrap();
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }

    #[test]
    fn test_security_level_mapping() {
        assert_eq!(SecurityLevel::Minimal.algorithm(), KeyAlgorithm::Aes128Gcm);
        assert_eq!(SecurityLevel::Quantum.algorithm(), KeyAlgorithm::Aes256Gcm);
        assert!(SecurityLevel::High.recommended_iterations() > SecurityLevel::Standard.recommended_iterations());
    }
}
