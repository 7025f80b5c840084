//! Stoa authority engine
//! Validates blocks against a fixed round-robin rotation of ed25519 authorities

mod keys;

pub use keys::{AuthorityKey, KeyError, PublicKey};

use anyhow::{bail, Result};
use stoa_common::{AuthorityId, Block, BlockHash, BlockHeight, Header, TxHash};
use std::collections::HashSet;
use stoa_common::merkle::merkle_root;
use thiserror::Error;

/// Consensus engine selected by configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusKind {
    #[default]
    Authority,
}

/// The chain context the engine needs to classify a block
pub trait ChainReader {
    /// Height of a known block, if we have it
    fn height_of(&self, hash: &BlockHash) -> Option<BlockHeight>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("duplicate transaction {tx}")]
    DuplicateTransaction { tx: TxHash },

    #[error("transaction root mismatch: header has {header}, computed {computed}")]
    InvalidTxRoot { header: BlockHash, computed: BlockHash },

    #[error("no authorities configured")]
    NoAuthorities,

    #[error("block at height {height} not signed by authority {index}")]
    InvalidSignature { height: BlockHeight, index: usize },

    #[error("block timestamp {timestamp} is ahead of local time {now}")]
    FutureBlock { timestamp: u64, now: u64 },

    #[error("unknown ancestor {parent}")]
    UnknownAncestor { parent: BlockHash },

    #[error("invalid block number {actual}, expected {expected}")]
    InvalidNumber { expected: BlockHeight, actual: BlockHeight },

    #[error("header not signed by any authority")]
    UnknownAuthor,
}

impl AuthorityError {
    /// Errors that say where a block belongs rather than that it is invalid
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthorityError::FutureBlock { .. } | AuthorityError::UnknownAncestor { .. }
        )
    }
}

/// Round-robin proof-of-authority validator
#[derive(Debug, Clone)]
pub struct AuthorityEngine {
    kind: ConsensusKind,
    authorities: Vec<PublicKey>,
}

impl AuthorityEngine {
    pub fn new(authorities: Vec<PublicKey>) -> Self {
        Self {
            kind: ConsensusKind::Authority,
            authorities,
        }
    }

    /// Build from hex encoded public keys, in rotation order
    pub fn from_hex_keys(kind: ConsensusKind, keys: &[String]) -> Result<Self> {
        if keys.is_empty() {
            bail!(AuthorityError::NoAuthorities);
        }
        let authorities = keys.iter().map(|k| k.parse::<PublicKey>()).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { kind, authorities })
    }

    pub fn kind(&self) -> ConsensusKind {
        self.kind
    }

    pub fn authorities(&self) -> &[PublicKey] {
        &self.authorities
    }

    /// Index and key of the authority whose turn it is at `height`
    pub fn scheduled(&self, height: BlockHeight) -> Option<(usize, &PublicKey)> {
        if self.authorities.is_empty() {
            return None;
        }
        let index = (height % self.authorities.len() as u64) as usize;
        Some((index, &self.authorities[index]))
    }

    /// The authority whose key verifies the header signature
    pub fn author(&self, header: &Header) -> Result<AuthorityId, AuthorityError> {
        let id = header.compute_id();
        self.authorities
            .iter()
            .position(|key| key.verify(&id, &header.signature))
            .map(|index| AuthorityId {
                index,
                public_key: self.authorities[index].to_bytes(),
            })
            .ok_or(AuthorityError::UnknownAuthor)
    }

    /// Structural, signature and placement checks for a block.
    ///
    /// `now` is local unix time in seconds.
    pub fn verify_block(
        &self,
        chain: &dyn ChainReader,
        block: &Block,
        now: u64,
    ) -> Result<(), AuthorityError> {
        let header = block.header();

        let tx_ids = block.tx_ids();
        let mut seen = HashSet::with_capacity(tx_ids.len());
        if let Some(tx) = tx_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(AuthorityError::DuplicateTransaction { tx: *tx });
        }

        let computed = merkle_root(&tx_ids);
        if computed != header.tx_root {
            return Err(AuthorityError::InvalidTxRoot {
                header: header.tx_root,
                computed,
            });
        }

        let (index, key) = self.scheduled(header.height).ok_or(AuthorityError::NoAuthorities)?;
        if !key.verify(&block.id(), &header.signature) {
            return Err(AuthorityError::InvalidSignature {
                height: header.height,
                index,
            });
        }

        if header.timestamp > now {
            return Err(AuthorityError::FutureBlock {
                timestamp: header.timestamp,
                now,
            });
        }

        let parent_height = chain
            .height_of(&header.prev_id)
            .ok_or(AuthorityError::UnknownAncestor {
                parent: header.prev_id,
            })?;

        if header.height != parent_height + 1 {
            return Err(AuthorityError::InvalidNumber {
                expected: parent_height + 1,
                actual: header.height,
            });
        }

        Ok(())
    }
}
