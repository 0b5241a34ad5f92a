use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskTankError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] crate::pairing::PairingError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key generation failed: no secure randomness available")]
    KeyGeneration,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key: expected {expected} bytes of base64")]
    InvalidKey { expected: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid public key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature")]
    InvalidSignature,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record id does not match its contents")]
    IdMismatch,

    #[error("Record signature is invalid")]
    BadSignature,

    #[error("Malformed record: {0}")]
    Malformed(String),
}

impl From<IdentityError> for RecordError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::InvalidKeyBytes => RecordError::Malformed("bad pubkey".into()),
            IdentityError::InvalidSignature => RecordError::BadSignature,
        }
    }
}
