//! Definition of Stoa common types

use crate::hash::BlockHash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height, genesis is 0
pub type BlockHeight = u64;

/// Opaque identifier of a connected peer, assigned by the transport
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Identity of an authority: its index in the rotation and its public key
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthorityId {
    pub index: usize,
    pub public_key: [u8; 32],
}

impl fmt::Display for AuthorityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authority-{} ({})", self.index, hex::encode(&self.public_key[..8]))
    }
}

/// Where a transaction lives on the canonical chain
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
pub struct TxLookupEntry {
    #[n(0)]
    pub block_id: BlockHash,
    #[n(1)]
    pub height: BlockHeight,
    #[n(2)]
    pub index: u32,
}
