use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::cipher::CipherService;
use super::encrypted_data::EncryptedData;
use crate::error::CryptoError;
use crate::keystore::key::{KeyAccessibility, KeyAlgorithm, SecureKey, SecurityLevel};
use crate::security::secure_rng;

const WRAP_INFO: &[u8] = b"wealthwise hybrid wrap v1";

/// Payload sealed for an X25519 recipient.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HybridCiphertext {
    pub ephemeral_public_key: [u8; 32],
    pub wrapped_key: EncryptedData,
    pub payload: EncryptedData,
}

impl HybridCiphertext {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self).map_err(|e| CryptoError::InvalidData(format!("bundle encoding failed: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        bincode::deserialize(bytes).map_err(|e| CryptoError::InvalidData(format!("malformed bundle: {}", e)))
    }
}

impl CipherService {
    /// New X25519 private key for receiving hybrid payloads.
    pub fn generate_agreement_key(&self, identifier: &str) -> Result<SecureKey, CryptoError> {
        Ok(self
            .generate_key(KeyAlgorithm::X25519, SecurityLevel::High)?
            .with_identifier(identifier))
    }

    pub fn public_key(&self, key: &SecureKey) -> Result<[u8; 32], CryptoError> {
        let secret = agreement_secret(key)?;
        Ok(PublicKey::from(&secret).to_bytes())
    }

    pub fn encrypt_hybrid(
        &self,
        plaintext: &[u8],
        recipient_public_key: &[u8; 32],
    ) -> Result<HybridCiphertext, CryptoError> {
        let ephemeral_bytes = Zeroizing::new(
            secure_rng::random::array::<32>()
                .map_err(|e| CryptoError::EncryptionFailed(format!("random generator unavailable: {}", e)))?,
        );
        let ephemeral = StaticSecret::from(*ephemeral_bytes);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let recipient = PublicKey::from(*recipient_public_key);

        let shared = ephemeral.diffie_hellman(&recipient);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey("recipient public key is a low-order point".to_string()));
        }
        let wrap_key = wrapping_key(shared.as_bytes(), &ephemeral_public, recipient_public_key)?;

        let message_key = self.generate_random_key(SecurityLevel::High)?;
        let payload = self.encrypt(plaintext, &message_key)?;
        let wrapped_key = self.encrypt(message_key.expose_bytes(), &wrap_key)?;

        Ok(HybridCiphertext {
            ephemeral_public_key: ephemeral_public,
            wrapped_key,
            payload,
        })
    }

    pub fn decrypt_hybrid(
        &self,
        bundle: &HybridCiphertext,
        recipient_private_key: &SecureKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let secret = agreement_secret(recipient_private_key)?;
        let recipient_public = PublicKey::from(&secret).to_bytes();
        let shared = secret.diffie_hellman(&PublicKey::from(bundle.ephemeral_public_key));
        if !shared.was_contributory() {
            return Err(CryptoError::DecryptionFailed);
        }
        let wrap_key = wrapping_key(shared.as_bytes(), &bundle.ephemeral_public_key, &recipient_public)?;

        let message_bytes = Zeroizing::new(self.decrypt(&bundle.wrapped_key, &wrap_key)?);
        let message_key = SecureKey::new(
            "hybrid-message",
            KeyAlgorithm::Aes256Gcm,
            message_bytes.to_vec(),
            KeyAccessibility::default(),
            SecurityLevel::High,
            None,
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;
        self.decrypt(&bundle.payload, &message_key)
    }
}

fn agreement_secret(key: &SecureKey) -> Result<StaticSecret, CryptoError> {
    if key.algorithm() != KeyAlgorithm::X25519 {
        return Err(CryptoError::InvalidKey(format!("{} is not an X25519 key", key.algorithm())));
    }
    let mut bytes = Zeroizing::new([0u8; 32]);
    bytes.copy_from_slice(key.expose_bytes());
    Ok(StaticSecret::from(*bytes))
}

/// HKDF-SHA256 over the shared secret, salted with both public keys.
fn wrapping_key(shared: &[u8; 32], ephemeral_public: &[u8; 32], recipient_public: &[u8; 32]) -> Result<SecureKey, CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new(vec![0u8; 32]);
    hk.expand(WRAP_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed("HKDF expand failed".to_string()))?;

    SecureKey::new(
        "hybrid-wrap",
        KeyAlgorithm::Aes256Gcm,
        okm.to_vec(),
        KeyAccessibility::default(),
        SecurityLevel::High,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hybrid_round_trip() {
        let service = CipherService::new();
        let recipient = service.generate_agreement_key("household-sync").unwrap();
        let public = service.public_key(&recipient).unwrap();

        let bundle = service.encrypt_hybrid(b"shared expense report", &public).unwrap();
        assert_eq!(bundle.payload.algorithm, KeyAlgorithm::Aes256Gcm);

        let restored = HybridCiphertext::from_bytes(&bundle.to_bytes().unwrap()).unwrap();
        assert_eq!(
            service.decrypt_hybrid(&restored, &recipient).unwrap(),
            b"shared expense report"
        );
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let service = CipherService::new();
        let recipient = service.generate_agreement_key("a").unwrap();
        let stranger = service.generate_agreement_key("b").unwrap();
        let bundle = service
            .encrypt_hybrid(b"secret", &service.public_key(&recipient).unwrap())
            .unwrap();
        assert_eq!(
            service.decrypt_hybrid(&bundle, &stranger),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_low_order_point_rejected() {
        let service = CipherService::new();
        assert!(matches!(
            service.encrypt_hybrid(b"x", &[0u8; 32]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_symmetric_key_is_not_agreement_key() {
        let service = CipherService::new();
        let aes = service.generate_random_key(SecurityLevel::High).unwrap();
        assert!(matches!(service.public_key(&aes), Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_each_bundle_uses_fresh_ephemeral() {
        let service = CipherService::new();
        let recipient = service.generate_agreement_key("r").unwrap();
        let public = service.public_key(&recipient).unwrap();
        let a = service.encrypt_hybrid(b"m", &public).unwrap();
        let b = service.encrypt_hybrid(b"m", &public).unwrap();
        assert_ne!(a.ephemeral_public_key, b.ephemeral_public_key);
    }
}
