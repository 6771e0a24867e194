//! Reservation vouchers.
//!
//! A voucher is the relay's signed statement that `peer` holds a reservation
//! until `expiration`. It carries the relay's public key so the holder can
//! check the signature against the relay's peer id.

use crate::error::{RelayError, Result};
use ferry_core::identity::verify_signature;
use ferry_core::{Keypair, PeerId};
use serde::{Deserialize, Serialize};

/// Signing domain separator
const VOUCHER_DOMAIN: &[u8] = b"ferry-relay-reservation-voucher:";

/// Reservation statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// Relay granting the reservation
    pub relay: PeerId,
    /// Peer holding the reservation
    pub peer: PeerId,
    /// Expiry as unix seconds
    pub expiration: u64,
}

impl Voucher {
    fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(VOUCHER_DOMAIN.len() + 72);
        bytes.extend_from_slice(VOUCHER_DOMAIN);
        bytes.extend_from_slice(self.relay.as_bytes());
        bytes.extend_from_slice(self.peer.as_bytes());
        bytes.extend_from_slice(&self.expiration.to_be_bytes());
        bytes
    }
}

/// Voucher plus relay signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVoucher {
    /// Signed statement
    pub voucher: Voucher,
    /// Relay's Ed25519 public key
    pub public_key: [u8; 32],
    /// Ed25519 signature over the statement
    pub signature: Vec<u8>,
}

impl SignedVoucher {
    /// Sign `voucher` with the relay's keypair
    #[must_use]
    pub fn sign(keypair: &Keypair, voucher: Voucher) -> Self {
        Self {
            signature: keypair.sign(&voucher.signing_bytes()),
            public_key: keypair.public_key(),
            voucher,
        }
    }

    /// Check the signature and that the voucher binds `relay` to `peer`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidVoucher`] describing the first mismatch.
    pub fn verify(&self, relay: PeerId, peer: PeerId) -> Result<()> {
        if PeerId::from_public_key(&self.public_key) != relay {
            return Err(RelayError::InvalidVoucher("key does not match relay".into()));
        }
        if self.voucher.relay != relay {
            return Err(RelayError::InvalidVoucher("issued by another relay".into()));
        }
        if self.voucher.peer != peer {
            return Err(RelayError::InvalidVoucher("issued to another peer".into()));
        }
        verify_signature(&self.public_key, &self.voucher.signing_bytes(), &self.signature)
            .map_err(|_| RelayError::InvalidVoucher("bad signature".into()))
    }

    /// Encode for the wire
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Decode from the wire
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidVoucher`] for undecodable bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|_| RelayError::InvalidVoucher("undecodable".into()))
    }
}
