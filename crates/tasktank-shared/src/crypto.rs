use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

/// Symmetric key shared by every device syncing a tank (or a device group).
///
/// Holding it is both the capability to read/write and the encryption
/// secret, so `Debug` never prints it. Travels as standard base64.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EncKey([u8; SYMMETRIC_KEY_SIZE]);

impl EncKey {
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let invalid = CryptoError::InvalidKey {
            expected: SYMMETRIC_KEY_SIZE,
        };
        let bytes = STANDARD.decode(s.trim()).map_err(|_| invalid.clone())?;
        let arr: [u8; SYMMETRIC_KEY_SIZE] = bytes.try_into().map_err(|_| invalid)?;
        Ok(Self(arr))
    }

    /// Short non-secret label for logs and map keys.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        hex::encode(&hash.as_bytes()[..4])
    }
}

impl std::fmt::Debug for EncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncKey({})", self.fingerprint())
    }
}

impl Serialize for EncKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for EncKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EncKey::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

pub fn generate_key() -> Result<EncKey, CryptoError> {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng
        .try_fill_bytes(&mut key)
        .map_err(|_| CryptoError::KeyGeneration)?;
    Ok(EncKey(key))
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns base64(nonce || ciphertext)
pub fn encrypt(key: &EncKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(output))
}

/// Never panics: wrong keys, foreign traffic and garbage all come back as
/// `DecryptionFailed`.
pub fn decrypt(key: &EncKey, encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let data = STANDARD
        .decode(encoded.trim())
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub fn seal_json<T: Serialize>(key: &EncKey, value: &T) -> Result<String, CryptoError> {
    let plaintext = serde_json::to_vec(value).map_err(|_| CryptoError::EncryptionFailed)?;
    encrypt(key, &plaintext)
}

/// Decrypt and parse in one step. `None` covers both wrong key and bad JSON.
pub fn open_json<T: DeserializeOwned>(key: &EncKey, encoded: &str) -> Option<T> {
    let plaintext = decrypt(key, encoded).ok()?;
    serde_json::from_slice(&plaintext).ok()
}

/// Content hash used as the file checksum (hex BLAKE3).
pub fn checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
