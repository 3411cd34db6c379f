use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::keystore::key::{KeyAlgorithm, SecurityLevel};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const ENVELOPE_VERSION: u8 = 1;

/// Output of one AEAD seal. The combined encoding
/// `nonce || tag || ciphertext` is the persisted layout.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EncryptedData {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub algorithm: KeyAlgorithm,
    pub security_level: SecurityLevel,
    pub key_identifier: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EncryptedData {
    pub fn to_combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Splits a combined blob. The algorithm and level are not part of the
    /// layout, so the caller supplies them.
    pub fn from_combined(
        bytes: &[u8],
        algorithm: KeyAlgorithm,
        security_level: SecurityLevel,
    ) -> Result<Self, CryptoError> {
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::InvalidData(format!(
                "combined payload is {} bytes, need at least {}",
                bytes.len(),
                NONCE_LEN + TAG_LEN
            )));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&bytes[NONCE_LEN..NONCE_LEN + TAG_LEN]);

        Ok(Self {
            ciphertext: bytes[NONCE_LEN + TAG_LEN..].to_vec(),
            nonce,
            tag,
            algorithm,
            security_level,
            key_identifier: None,
            timestamp: Utc::now(),
        })
    }

    /// Self-describing encoding carrying every field.
    pub fn to_envelope(&self) -> Result<Vec<u8>, CryptoError> {
        let body = bincode::serialize(self)
            .map_err(|e| CryptoError::InvalidData(format!("envelope encoding failed: {}", e)))?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(ENVELOPE_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_envelope(bytes: &[u8]) -> Result<Self, CryptoError> {
        match bytes.split_first() {
            Some((&ENVELOPE_VERSION, body)) => bincode::deserialize(body)
                .map_err(|e| CryptoError::InvalidData(format!("malformed envelope: {}", e))),
            Some((version, _)) => Err(CryptoError::InvalidData(format!(
                "unsupported envelope version {}",
                version
            ))),
            None => Err(CryptoError::InvalidData("empty envelope".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> EncryptedData {
        EncryptedData {
            ciphertext: b"opaque ciphertext".to_vec(),
            nonce: [3u8; NONCE_LEN],
            tag: [9u8; TAG_LEN],
            algorithm: KeyAlgorithm::Aes256Gcm,
            security_level: SecurityLevel::High,
            key_identifier: Some("transactions".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_combined_layout() {
        let data = sample();
        let combined = data.to_combined();
        assert_eq!(&combined[..NONCE_LEN], &data.nonce);
        assert_eq!(&combined[NONCE_LEN..NONCE_LEN + TAG_LEN], &data.tag);
        assert_eq!(&combined[NONCE_LEN + TAG_LEN..], data.ciphertext.as_slice());

        let decoded = EncryptedData::from_combined(&combined, data.algorithm, data.security_level).unwrap();
        assert_eq!(decoded.nonce, data.nonce);
        assert_eq!(decoded.tag, data.tag);
        assert_eq!(decoded.ciphertext, data.ciphertext);
        assert_eq!(decoded.to_combined(), combined);
    }

    #[test]
    fn test_short_combined_rejected() {
        let err = EncryptedData::from_combined(&[0u8; 27], KeyAlgorithm::Aes256Gcm, SecurityLevel::High)
            .unwrap_err();
        assert!(matches!(err, CryptoError::InvalidData(_)));
    }

    #[test]
    fn test_envelope_keeps_metadata() {
        let data = sample();
        let envelope = data.to_envelope().unwrap();
        assert_eq!(EncryptedData::from_envelope(&envelope).unwrap(), data);

        let mut bumped = envelope.clone();
        bumped[0] = 99;
        assert!(EncryptedData::from_envelope(&bumped).is_err());
        assert!(EncryptedData::from_envelope(&[]).is_err());
    }
}
