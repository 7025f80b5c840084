//! Definition of Stoa messages

use crate::block::Block;
use crate::hash::BlockHash;
use crate::types::{BlockHeight, PeerId};

/// A block that changed the chain, with its id
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChainEvent {
    pub id: BlockHash,
    pub block: Block,
}

impl ChainEvent {
    pub fn new(block: &Block) -> Self {
        Self {
            id: block.id(),
            block: block.clone(),
        }
    }
}

/// Block produced by the local authority
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockProducedMessage {
    pub block: Block,
}

/// Chain messages
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ChainMessage {
    /// Block became canonical
    Extended(ChainEvent),

    /// Canonical head moved
    HeadChanged(ChainEvent),

    /// Block stored but not canonical, or detached by a reorg
    Side(ChainEvent),

    /// Block produced locally, to be inserted
    BlockProduced(BlockProducedMessage),
}

/// Messages between the chain engine and the peer transport
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum NetworkMessage {
    // Inbound, from the transport
    /// A peer has a block with this hash
    BlockAnnounced {
        peer: PeerId,
        hash: BlockHash,
        height: BlockHeight,
    },

    /// A peer pushed a full block unrequested
    BlockPushed { peer: PeerId, block: Block },

    /// Blocks a peer sent, possibly in answer to our request
    BlocksDelivered { peer: PeerId, blocks: Vec<Block> },

    // Outbound, to the transport
    /// Ask a peer for a block
    BlockRequest { peer: PeerId, hash: BlockHash },

    /// Relay a block, in full or as a hash announcement
    BroadcastBlock { block: Block, propagate_full: bool },

    /// Disconnect a misbehaving peer
    DropPeer { peer: PeerId, reason: String },
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    Chain(ChainMessage),

    Network(NetworkMessage),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

impl From<ChainMessage> for Message {
    fn from(msg: ChainMessage) -> Self {
        Message::Chain(msg)
    }
}

impl From<NetworkMessage> for Message {
    fn from(msg: NetworkMessage) -> Self {
        Message::Network(msg)
    }
}
