use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{KDF_CONTEXT_AUTHOR_KEY, PUBKEY_SIZE};
use crate::crypto::EncKey;
use crate::error::IdentityError;

/// Pseudonymous record author derived from a shared key.
///
/// Every holder of the same `EncKey` derives the same author, so relays see
/// one stable pubkey per tank while device identity stays inside the
/// encrypted payloads.
#[derive(Clone)]
pub struct AuthorIdentity {
    signing_key: SigningKey,
}

impl AuthorIdentity {
    pub fn derive(key: &EncKey) -> Self {
        let seed = blake3::derive_key(KDF_CONTEXT_AUTHOR_KEY, key.as_bytes());
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn pubkey(&self) -> AuthorPubkey {
        AuthorPubkey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for AuthorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthorIdentity({})", self.pubkey().short())
    }
}

// Author identity = Ed25519 public key (32 bytes), hex on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuthorPubkey(pub [u8; PUBKEY_SIZE]);

impl AuthorPubkey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidKeyBytes)?;
        let arr: [u8; PUBKEY_SIZE] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for AuthorPubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for AuthorPubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AuthorPubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AuthorPubkey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Verify an Ed25519 signature against an author pubkey.
pub fn verify_signature(
    pubkey: &AuthorPubkey,
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(&pubkey.0).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature =
        Signature::from_slice(signature_bytes).map_err(|_| IdentityError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
