//! Connects the block fetcher to the chain and the peer transport

use std::sync::Arc;

use anyhow::Result;
use stoa_common::messages::NetworkMessage;
use stoa_common::{Block, BlockHash, BlockHeight, PeerId};
use stoa_module_authority::AuthorityError;
use stoa_module_block_fetcher::FetcherBackend;
use tokio::sync::mpsc;
use tracing::error;

use crate::blockchain::Blockchain;

pub struct ChainBackend {
    chain: Arc<Blockchain>,
    outbound: mpsc::UnboundedSender<NetworkMessage>,
}

impl ChainBackend {
    pub fn new(chain: Arc<Blockchain>, outbound: mpsc::UnboundedSender<NetworkMessage>) -> Self {
        Self { chain, outbound }
    }

    fn send(&self, message: NetworkMessage) {
        if self.outbound.send(message).is_err() {
            error!("Network outbound channel closed");
        }
    }
}

impl FetcherBackend for ChainBackend {
    fn get_block(&self, hash: &BlockHash) -> Option<Block> {
        match self.chain.block_by_hash(hash) {
            Ok(block) => block,
            Err(e) => {
                error!("could not read block {hash}: {e}");
                None
            }
        }
    }

    fn verify_block(&self, block: &Block) -> Result<()> {
        let now = self.chain.now();
        match self.chain.authority().verify_block(self.chain.as_ref(), block, now) {
            // Parked by the chain on insert
            Ok(()) | Err(AuthorityError::FutureBlock { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn broadcast_block(&self, block: &Block, propagate_full: bool) {
        self.send(NetworkMessage::BroadcastBlock {
            block: block.clone(),
            propagate_full,
        });
    }

    fn chain_height(&self) -> BlockHeight {
        self.chain.best_block().height()
    }

    fn insert_block(&self, block: Block) -> Result<()> {
        match self.chain.process_block(block) {
            Ok(_) => Ok(()),
            Err(e) => {
                crate::exit_if_fatal(&e);
                Err(e.into())
            }
        }
    }

    fn drop_peer(&self, peer: PeerId) {
        self.send(NetworkMessage::DropPeer {
            peer,
            reason: "invalid block".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::ChainConfig;
    use stoa_common::ledger::PassthroughState;
    use stoa_common::store::MemoryStore;
    use stoa_common::BlockBuilder;
    use stoa_module_authority::{AuthorityEngine, AuthorityKey};

    fn setup() -> (ChainBackend, mpsc::UnboundedReceiver<NetworkMessage>, AuthorityKey, Block) {
        let key = AuthorityKey::from_seed(&[1; 32]);
        let genesis = Block::genesis(1_000, Vec::new());
        let chain = Blockchain::new(
            ChainConfig::default(),
            Arc::new(MemoryStore::new()),
            AuthorityEngine::new(vec![key.public_key()]),
            Arc::new(PassthroughState::new()),
            genesis.clone(),
        )
        .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (ChainBackend::new(chain, tx), rx, key, genesis)
    }

    #[test]
    fn verified_block_is_inserted() {
        let (backend, _rx, key, genesis) = setup();
        let block = BlockBuilder::child_of(&genesis).seal_with(|id| key.sign(id));

        backend.verify_block(&block).unwrap();
        backend.insert_block(block.clone()).unwrap();
        assert_eq!(backend.chain_height(), 1);
        assert_eq!(backend.get_block(&block.id()), Some(block));
    }

    #[test]
    fn future_block_passes_verification() {
        let (backend, _rx, key, genesis) = setup();
        let block = BlockBuilder::child_of(&genesis).timestamp(u64::MAX / 2).seal_with(|id| key.sign(id));
        assert!(backend.verify_block(&block).is_ok());
    }

    #[test]
    fn unsigned_block_fails_verification() {
        let (backend, _rx, _, genesis) = setup();
        let block = BlockBuilder::child_of(&genesis).unsigned();
        assert!(backend.verify_block(&block).is_err());
    }

    #[test]
    fn broadcasts_and_drops_go_to_the_network() {
        let (backend, mut rx, _, genesis) = setup();
        backend.broadcast_block(&genesis, true);
        backend.drop_peer(PeerId(4));

        assert!(matches!(
            rx.try_recv().unwrap(),
            NetworkMessage::BroadcastBlock { propagate_full: true, .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), NetworkMessage::DropPeer { peer: PeerId(4), .. }));
    }
}
