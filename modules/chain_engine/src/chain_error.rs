//! Error types for chain engine operations.

use stoa_common::{BlockHash, BlockHeight};
use stoa_module_authority::AuthorityError;

/// Errors returned by [`Blockchain`](crate::blockchain::Blockchain) operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The block was rejected before and is cached as bad.
    #[error("known bad block {hash}")]
    KnownBadBlock { hash: BlockHash },

    /// Structural, signature or placement check failed.
    #[error(transparent)]
    Authority(#[from] AuthorityError),

    /// The application state refused the block.
    #[error("block {hash} rejected by ledger: {reason}")]
    Ledger { hash: BlockHash, reason: String },

    /// The store holds a different genesis than the one configured.
    #[error("genesis mismatch: stored {stored}, configured {configured}")]
    GenesisMismatch {
        stored: BlockHash,
        configured: BlockHash,
    },

    /// Rewind target is above the current head.
    #[error("cannot rewind to {target}, head is at {head}")]
    InvalidRewind {
        target: BlockHeight,
        head: BlockHeight,
    },

    /// Storage failure or corruption; the node must stop.
    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),
}

impl ChainError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Fatal(_) | ChainError::GenesisMismatch { .. })
    }
}

impl From<anyhow::Error> for ChainError {
    fn from(error: anyhow::Error) -> Self {
        ChainError::Fatal(error)
    }
}
