use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Empty token")]
    Empty,

    #[error("Unknown content kind prefix in token '{0}'")]
    UnknownKind(String),
}
