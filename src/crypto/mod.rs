pub mod chunked;
pub mod cipher;
pub mod domain;
pub mod encrypted_data;
pub mod hybrid;

pub use cipher::CipherService;
pub use domain::DomainCipher;
pub use encrypted_data::{EncryptedData, NONCE_LEN, TAG_LEN};
pub use hybrid::HybridCiphertext;
