//! Application state interface: the ledger engine the chain drives.

use crate::block::Block;
use crate::hash::BlockHash;
use anyhow::Result;
use std::sync::{Mutex, PoisonError};

/// Callbacks into the ledger, invoked by the chain engine while it holds
/// the insertion lock
pub trait ApplicationState: Send + Sync {
    /// Validate a block against the current ledger view
    fn check_block(&self, block: &Block) -> Result<()>;

    /// Execute a block, staging its effects
    fn process_block(&self, block: &Block) -> Result<()>;

    /// Make the staged effects of `block_id` durable
    fn commit(&self, block_id: &BlockHash) -> Result<()>;

    /// Reset the ledger view to the state at `new_head`
    fn update_chain(&self, new_head: &Block) -> Result<()>;
}

/// Ledger that accepts every block and records what it was asked to do
#[derive(Debug, Default)]
pub struct PassthroughState {
    head: Mutex<Option<BlockHash>>,
}

impl PassthroughState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last block committed or rewound to
    pub fn head(&self) -> Option<BlockHash> {
        *self.head.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ApplicationState for PassthroughState {
    fn check_block(&self, _block: &Block) -> Result<()> {
        Ok(())
    }

    fn process_block(&self, _block: &Block) -> Result<()> {
        Ok(())
    }

    fn commit(&self, block_id: &BlockHash) -> Result<()> {
        *self.head.lock().unwrap_or_else(PoisonError::into_inner) = Some(*block_id);
        Ok(())
    }

    fn update_chain(&self, new_head: &Block) -> Result<()> {
        *self.head.lock().unwrap_or_else(PoisonError::into_inner) = Some(new_head.id());
        Ok(())
    }
}
