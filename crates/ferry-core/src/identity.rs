//! Peer identities.
//!
//! A [`PeerId`] is the BLAKE3 hash of a peer's Ed25519 public key. Peers prove
//! ownership of an id by presenting the public key and signing with the
//! matching [`Keypair`].

use crate::error::IdentityError;
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain separator for peer id derivation
const PEER_ID_CONTEXT: &[u8] = b"ferry-peer-id-v1";

/// 256-bit peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Length of a peer id in bytes
    pub const LEN: usize = 32;

    /// Derive a peer id from an Ed25519 public key
    #[must_use]
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(PEER_ID_CONTEXT);
        hasher.update(public_key);
        Self(*hasher.finalize().as_bytes())
    }

    /// Build a peer id from raw bytes
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidLength`] unless `bytes` is exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| IdentityError::InvalidLength {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    /// Generate a random peer id (tests and simulations)
    #[must_use]
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Owned byte vector, as carried on the wire
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Abbreviated hex form for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// Ed25519 keypair identifying the local host
pub struct Keypair {
    inner: ed25519_dalek::SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG
    #[must_use]
    pub fn generate() -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a keypair from its 32-byte seed
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte seed, for persisting the identity
    #[must_use]
    pub fn seed(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Public key bytes
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.inner.verifying_key().to_bytes()
    }

    /// Peer id derived from the public key
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    /// Sign a message, returning the 64-byte signature
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.inner.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Verify a signature made by `public_key`
///
/// # Errors
///
/// Returns [`IdentityError::InvalidPublicKey`] for malformed keys and
/// [`IdentityError::InvalidSignature`] when verification fails.
pub fn verify_signature(
    public_key: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let key = ed25519_dalek::VerifyingKey::from_bytes(public_key)
        .map_err(|_| IdentityError::InvalidPublicKey)?;
    let signature = ed25519_dalek::Signature::from_slice(signature)
        .map_err(|_| IdentityError::InvalidSignature)?;
    key.verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_keypair_is_stable() {
        let keypair = Keypair::from_seed(&[7u8; 32]);
        assert_eq!(keypair.peer_id(), Keypair::from_seed(&[7u8; 32]).peer_id());
        assert_ne!(keypair.peer_id(), Keypair::from_seed(&[8u8; 32]).peer_id());
    }

    #[test]
    fn test_peer_id_text_roundtrip() {
        let id = PeerId::random();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_peer_id_rejects_short_bytes() {
        let err = PeerId::from_bytes(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            IdentityError::InvalidLength {
                expected: 32,
                actual: 3
            }
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"reservation");
        assert!(verify_signature(&keypair.public_key(), b"reservation", &sig).is_ok());
        assert_eq!(
            verify_signature(&keypair.public_key(), b"tampered", &sig),
            Err(IdentityError::InvalidSignature)
        );
    }
}
