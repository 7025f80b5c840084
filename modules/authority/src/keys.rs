//! Ed25519 authority keys

use cryptoxide::ed25519::{self, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use std::{fmt, str::FromStr};
use stoa_common::BlockHash;
use thiserror::Error;

/// Ed25519 public key of an authority
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

#[derive(Debug, Error, PartialEq)]
pub enum KeyError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid size {actual}, expecting {expected}")]
    InvalidSize { expected: usize, actual: usize },
}

impl PublicKey {
    pub const SIZE: usize = PUBLIC_KEY_LENGTH;

    /// Check a signature over a block id
    pub fn verify(&self, id: &BlockHash, signature: &[u8]) -> bool {
        let Ok(signature) = <[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
            return false;
        };
        ed25519::verify(id.as_ref(), &self.0, &signature)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0
    }
}

impl From<[u8; PUBLIC_KEY_LENGTH]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes = <[u8; PUBLIC_KEY_LENGTH]>::try_from(value).map_err(|_| KeyError::InvalidSize {
            expected: Self::SIZE,
            actual: value.len(),
        })?;
        Ok(Self(bytes))
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(hex::decode(s)?.as_slice())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey<Ed25519>").field(&hex::encode(self.0)).finish()
    }
}

/// Signing half of an authority key, for the local block producer and tests
#[derive(Clone)]
pub struct AuthorityKey {
    keypair: [u8; 64],
    public: PublicKey,
}

impl AuthorityKey {
    /// Derive a key pair from a 32 byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let (keypair, public) = ed25519::keypair(seed);
        Self {
            keypair,
            public: PublicKey(public),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Sign a block id
    pub fn sign(&self, id: &BlockHash) -> Vec<u8> {
        ed25519::signature(id.as_ref(), &self.keypair).to_vec()
    }
}

impl FromStr for AuthorityKey {
    type Err = KeyError;

    /// Parse a hex encoded seed
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let seed = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| KeyError::InvalidSize {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self::from_seed(&seed))
    }
}

impl fmt::Debug for AuthorityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityKey").field("public", &self.public).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_only_for_signed_id() {
        let key = AuthorityKey::from_seed(&[1; 32]);
        let id = BlockHash::new([5; 32]);
        let signature = key.sign(&id);
        assert!(key.public_key().verify(&id, &signature));
        assert!(!key.public_key().verify(&BlockHash::new([6; 32]), &signature));
        assert!(!AuthorityKey::from_seed(&[2; 32]).public_key().verify(&id, &signature));
    }

    #[test]
    fn truncated_signature_is_rejected() {
        let key = AuthorityKey::from_seed(&[1; 32]);
        let id = BlockHash::new([5; 32]);
        assert!(!key.public_key().verify(&id, &key.sign(&id)[..32]));
    }

    #[test]
    fn public_key_parses_from_display() {
        let public = AuthorityKey::from_seed(&[3; 32]).public_key();
        assert_eq!(public.to_string().parse::<PublicKey>().unwrap(), public);
        assert!(matches!(
            "abcd".parse::<PublicKey>(),
            Err(KeyError::InvalidSize { actual: 2, .. })
        ));
    }
}
