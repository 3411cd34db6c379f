//! Chunked sealing for payloads too large to hold as one AEAD message.
//!
//! Layout: `WWCH` magic, version byte, algorithm byte, big-endian u32 chunk
//! count, then per chunk a big-endian u32 length followed by that chunk's
//! combined bytes. Every chunk binds its index and the total count as
//! associated data.

#[cfg(feature = "parallel-crypto")]
use rayon::prelude::*;
use tracing::debug;
use zeroize::Zeroizing;

use super::cipher::CipherService;
use super::encrypted_data::EncryptedData;
use crate::error::CryptoError;
use crate::keystore::key::{KeyAlgorithm, SecureKey};

const CHUNK_MAGIC: &[u8; 4] = b"WWCH";
const CHUNK_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 1 + 4;

fn chunk_aad(index: u32, count: u32) -> [u8; 12] {
    let mut aad = [0u8; 12];
    aad[..4].copy_from_slice(CHUNK_MAGIC);
    aad[4..8].copy_from_slice(&index.to_be_bytes());
    aad[8..].copy_from_slice(&count.to_be_bytes());
    aad
}

impl CipherService {
    pub fn encrypt_chunked(&self, data: &[u8], key: &SecureKey) -> Result<Vec<u8>, CryptoError> {
        if data.is_empty() {
            return Err(CryptoError::InvalidData("payload is empty".to_string()));
        }
        let count = u32::try_from(data.len().div_ceil(self.chunk_size()))
            .map_err(|_| CryptoError::InvalidData("payload needs more than u32::MAX chunks".to_string()))?;

        let seal_chunk = |(index, chunk): (usize, &[u8])| -> Result<Vec<u8>, CryptoError> {
            let aad = chunk_aad(index as u32, count);
            Ok(self.encrypt_with_aad(chunk, key, &aad)?.to_combined())
        };

        #[cfg(feature = "parallel-crypto")]
        let sealed: Vec<Vec<u8>> = data
            .par_chunks(self.chunk_size())
            .enumerate()
            .map(seal_chunk)
            .collect::<Result<_, _>>()?;
        #[cfg(not(feature = "parallel-crypto"))]
        let sealed: Vec<Vec<u8>> = data
            .chunks(self.chunk_size())
            .enumerate()
            .map(seal_chunk)
            .collect::<Result<_, _>>()?;

        let body_len: usize = sealed.iter().map(|c| 4 + c.len()).sum();
        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        out.extend_from_slice(CHUNK_MAGIC);
        out.push(CHUNK_VERSION);
        out.push(key.algorithm().code());
        out.extend_from_slice(&count.to_be_bytes());
        for chunk in &sealed {
            let len = u32::try_from(chunk.len())
                .map_err(|_| CryptoError::EncryptionFailed("sealed chunk exceeds u32::MAX bytes".to_string()))?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(chunk);
        }

        debug!(chunks = count, bytes = data.len(), "Sealed chunked payload");
        Ok(out)
    }

    pub fn decrypt_chunked(&self, bytes: &[u8], key: &SecureKey) -> Result<Vec<u8>, CryptoError> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != CHUNK_MAGIC {
            return Err(CryptoError::InvalidData("not a chunked payload".to_string()));
        }
        if bytes[4] != CHUNK_VERSION {
            return Err(CryptoError::InvalidData(format!("unsupported chunk version {}", bytes[4])));
        }
        let algorithm = KeyAlgorithm::from_code(bytes[5])
            .ok_or_else(|| CryptoError::AlgorithmNotSupported(format!("algorithm code {}", bytes[5])))?;
        if algorithm != key.algorithm() {
            return Err(CryptoError::InvalidKey(format!(
                "payload sealed with {}, key is {}",
                algorithm,
                key.algorithm()
            )));
        }
        let count = read_u32(&bytes[6..10]);
        if count == 0 {
            return Err(CryptoError::InvalidData("chunk count is zero".to_string()));
        }

        // Sized to the input so authenticated chunks are never left behind in
        // a reallocated buffer; wiped if a later chunk fails.
        let mut plaintext = Zeroizing::new(Vec::with_capacity(bytes.len()));
        let mut cursor = HEADER_LEN;
        for index in 0..count {
            let len = bytes
                .get(cursor..cursor + 4)
                .map(read_u32)
                .ok_or(CryptoError::DecryptionFailed)? as usize;
            cursor += 4;
            let end = cursor.checked_add(len).ok_or(CryptoError::DecryptionFailed)?;
            let chunk = bytes.get(cursor..end).ok_or(CryptoError::DecryptionFailed)?;
            cursor = end;

            let sealed = EncryptedData::from_combined(chunk, algorithm, key.security_level())
                .map_err(|_| CryptoError::DecryptionFailed)?;
            let opened = Zeroizing::new(self.decrypt_with_aad(&sealed, key, &chunk_aad(index, count))?);
            plaintext.extend_from_slice(&opened);
        }
        if cursor != bytes.len() {
            return Err(CryptoError::DecryptionFailed);
        }
        Ok(std::mem::take(&mut *plaintext))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::key::SecurityLevel;

    fn setup() -> (CipherService, SecureKey, Vec<u8>) {
        let service = CipherService::with_chunk_size(16).unwrap();
        let key = service.generate_random_key(SecurityLevel::High).unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        (service, key, data)
    }

    /// Byte ranges of each chunk record (length prefix included).
    fn chunk_spans(bytes: &[u8]) -> Vec<(usize, usize)> {
        let count = read_u32(&bytes[6..10]) as usize;
        let mut spans = Vec::with_capacity(count);
        let mut cursor = HEADER_LEN;
        for _ in 0..count {
            let len = read_u32(&bytes[cursor..cursor + 4]) as usize;
            spans.push((cursor, cursor + 4 + len));
            cursor += 4 + len;
        }
        spans
    }

    #[test]
    fn test_chunked_round_trip() {
        let (service, key, data) = setup();
        let sealed = service.encrypt_chunked(&data, &key).unwrap();
        assert_eq!(&sealed[..4], b"WWCH");
        assert_eq!(read_u32(&sealed[6..10]), 7);
        assert_eq!(service.decrypt_chunked(&sealed, &key).unwrap(), data);
    }

    #[test]
    fn test_exact_multiple_of_chunk_size() {
        let service = CipherService::with_chunk_size(10).unwrap();
        let key = service.generate_random_key(SecurityLevel::Standard).unwrap();
        let data = vec![5u8; 30];
        let sealed = service.encrypt_chunked(&data, &key).unwrap();
        assert_eq!(read_u32(&sealed[6..10]), 3);
        assert_eq!(service.decrypt_chunked(&sealed, &key).unwrap(), data);
    }

    #[test]
    fn test_reordered_chunks_rejected() {
        let (service, key, data) = setup();
        let sealed = service.encrypt_chunked(&data, &key).unwrap();
        let spans = chunk_spans(&sealed);

        let mut reordered = sealed[..HEADER_LEN].to_vec();
        reordered.extend_from_slice(&sealed[spans[1].0..spans[1].1]);
        reordered.extend_from_slice(&sealed[spans[0].0..spans[0].1]);
        reordered.extend_from_slice(&sealed[spans[2].0..]);
        assert_eq!(
            service.decrypt_chunked(&reordered, &key),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let (service, key, data) = setup();
        let sealed = service.encrypt_chunked(&data, &key).unwrap();
        let spans = chunk_spans(&sealed);

        let dropped_tail = &sealed[..spans[spans.len() - 1].0];
        assert!(service.decrypt_chunked(dropped_tail, &key).is_err());

        // Rewriting the count to hide the dropped chunk breaks every chunk's AAD.
        let mut recounted = dropped_tail.to_vec();
        recounted[6..10].copy_from_slice(&((spans.len() - 1) as u32).to_be_bytes());
        assert_eq!(
            service.decrypt_chunked(&recounted, &key),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_duplicated_chunk_rejected() {
        let (service, key, data) = setup();
        let sealed = service.encrypt_chunked(&data, &key).unwrap();
        let spans = chunk_spans(&sealed);

        let mut duplicated = sealed[..spans[1].0].to_vec();
        duplicated.extend_from_slice(&sealed[spans[0].0..spans[0].1]);
        duplicated.extend_from_slice(&sealed[spans[2].0..]);
        assert!(service.decrypt_chunked(&duplicated, &key).is_err());
    }

    #[test]
    fn test_late_chunk_failure_returns_nothing() {
        let (service, key, data) = setup();
        let mut sealed = service.encrypt_chunked(&data, &key).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(
            service.decrypt_chunked(&sealed, &key),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_bad_header_rejected() {
        let (service, key, data) = setup();
        let mut sealed = service.encrypt_chunked(&data, &key).unwrap();
        sealed[0] = b'X';
        assert!(matches!(
            service.decrypt_chunked(&sealed, &key),
            Err(CryptoError::InvalidData(_))
        ));
    }
}
