//! Block, header and transaction model.

use crate::crypto::blake2b_256;
use crate::hash::{BlockHash, Hash, TxHash};
use crate::merkle::merkle_root;
use crate::types::BlockHeight;
use minicbor::{Decode, Decoder, Encode, Encoder};
use serde::{Deserialize, Serialize};

/// Current header format version
pub const HEADER_VERSION: u32 = 1;

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct Header {
    #[n(0)]
    pub version: u32,

    /// Parent height + 1
    #[n(1)]
    pub height: BlockHeight,

    /// Creation time, unix seconds
    #[n(2)]
    pub timestamp: u64,

    #[n(3)]
    pub nonce: u64,

    /// Unused under proof of authority
    #[n(4)]
    pub difficulty: u64,

    /// Id of the parent block
    #[n(5)]
    pub prev_id: BlockHash,

    /// Merkle root over the transaction ids
    #[n(6)]
    pub tx_root: Hash<32>,

    /// Opaque ledger checkpoint
    #[n(7)]
    pub state_root: Hash<32>,

    /// Authority signature over the block id
    #[cbor(n(8), with = "minicbor::bytes")]
    pub signature: Vec<u8>,

    #[cbor(n(9), with = "minicbor::bytes")]
    pub extra: Vec<u8>,
}

impl Header {
    /// Canonical CBOR encoding of every field except the signature. The
    /// block id is the hash of these bytes, and it is what authorities sign.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut e = Encoder::new(Vec::new());
        e.array(9)
            .and_then(|e| e.u32(self.version))
            .and_then(|e| e.u64(self.height))
            .and_then(|e| e.u64(self.timestamp))
            .and_then(|e| e.u64(self.nonce))
            .and_then(|e| e.u64(self.difficulty))
            .and_then(|e| e.encode(self.prev_id))
            .and_then(|e| e.encode(self.tx_root))
            .and_then(|e| e.encode(self.state_root))
            .and_then(|e| e.bytes(&self.extra))
            .expect("infallible");
        e.into_writer()
    }

    pub fn compute_id(&self) -> BlockHash {
        blake2b_256(&self.unsigned_bytes())
    }
}

/// An opaque transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub payload: Vec<u8>,
}

impl<C> Encode<C> for Transaction {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.payload)?.ok()
    }
}

impl<'b, C> Decode<'b, C> for Transaction {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(Transaction::new(d.bytes()?))
    }
}

impl Transaction {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn id(&self) -> TxHash {
        blake2b_256(&self.payload)
    }
}

/// A block with its id frozen at construction.
///
/// The header is only reachable by shared reference, so a changed block is
/// a new `Block` with a freshly computed id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawBlock", into = "RawBlock")]
pub struct Block {
    id: BlockHash,
    header: Header,
    transactions: Vec<Transaction>,
}

#[derive(Serialize, Deserialize)]
struct RawBlock {
    header: Header,
    transactions: Vec<Transaction>,
}

impl From<RawBlock> for Block {
    fn from(raw: RawBlock) -> Self {
        Block::new(raw.header, raw.transactions)
    }
}

impl From<Block> for RawBlock {
    fn from(block: Block) -> Self {
        let (header, transactions) = block.into_parts();
        RawBlock {
            header,
            transactions,
        }
    }
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        Self {
            id: header.compute_id(),
            header,
            transactions,
        }
    }

    /// Deterministic genesis block: height 0, zero parent, no signature
    pub fn genesis(timestamp: u64, extra: Vec<u8>) -> Self {
        let header = Header {
            version: HEADER_VERSION,
            height: 0,
            timestamp,
            extra,
            ..Default::default()
        };
        Self::new(header, Vec::new())
    }

    pub fn id(&self) -> BlockHash {
        self.id
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn height(&self) -> BlockHeight {
        self.header.height
    }

    pub fn parent_id(&self) -> BlockHash {
        self.header.prev_id
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn tx_ids(&self) -> Vec<TxHash> {
        self.transactions.iter().map(Transaction::id).collect()
    }

    pub fn into_parts(self) -> (Header, Vec<Transaction>) {
        (self.header, self.transactions)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        minicbor::to_vec(self).expect("infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, minicbor::decode::Error> {
        minicbor::decode(bytes)
    }
}

impl<C> Encode<C> for Block {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.array(2)?;
        e.encode_with(&self.header, ctx)?;
        e.encode_with(&self.transactions, ctx)?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for Block {
    fn decode(d: &mut Decoder<'b>, ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        d.array()?;
        let header: Header = d.decode_with(ctx)?;
        let transactions: Vec<Transaction> = d.decode_with(ctx)?;
        Ok(Block::new(header, transactions))
    }
}

/// Assembles a block header and seals it with a signature over the id.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    header: Header,
    transactions: Vec<Transaction>,
    tx_root: Option<Hash<32>>,
}

impl BlockBuilder {
    /// Start a block on top of `parent`, one second after it
    pub fn child_of(parent: &Block) -> Self {
        Self {
            header: Header {
                version: HEADER_VERSION,
                height: parent.height() + 1,
                timestamp: parent.timestamp() + 1,
                prev_id: parent.id(),
                state_root: parent.header().state_root,
                ..Default::default()
            },
            transactions: Vec::new(),
            tx_root: None,
        }
    }

    pub fn height(mut self, height: BlockHeight) -> Self {
        self.header.height = height;
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.header.timestamp = timestamp;
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.header.nonce = nonce;
        self
    }

    pub fn state_root(mut self, state_root: Hash<32>) -> Self {
        self.header.state_root = state_root;
        self
    }

    pub fn extra(mut self, extra: Vec<u8>) -> Self {
        self.header.extra = extra;
        self
    }

    pub fn transactions(mut self, transactions: Vec<Transaction>) -> Self {
        self.transactions = transactions;
        self
    }

    /// Override the computed transaction root
    pub fn tx_root(mut self, tx_root: Hash<32>) -> Self {
        self.tx_root = Some(tx_root);
        self
    }

    fn finish_header(&mut self) {
        self.header.tx_root = self.tx_root.unwrap_or_else(|| {
            merkle_root(&self.transactions.iter().map(Transaction::id).collect::<Vec<_>>())
        });
    }

    /// Build without a signature
    pub fn unsigned(mut self) -> Block {
        self.finish_header();
        Block::new(self.header, self.transactions)
    }

    /// Build and sign: `sign` receives the block id and returns the signature
    pub fn seal_with<F>(mut self, sign: F) -> Block
    where
        F: FnOnce(&BlockHash) -> Vec<u8>,
    {
        self.finish_header();
        let id = self.header.compute_id();
        self.header.signature = sign(&id);
        Block::new(self.header, self.transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis() -> Block {
        Block::genesis(1_700_000_000, b"stoa".to_vec())
    }

    #[test]
    fn genesis_is_deterministic() {
        assert_eq!(genesis().id(), genesis().id());
        assert_eq!(genesis().height(), 0);
        assert!(genesis().parent_id().is_zero());
        assert_ne!(genesis().id(), Block::genesis(1_700_000_000, Vec::new()).id());
    }

    #[test]
    fn id_excludes_signature() {
        let parent = genesis();
        let unsigned = BlockBuilder::child_of(&parent).unsigned();
        let signed = BlockBuilder::child_of(&parent).seal_with(|_| vec![7u8; 64]);
        assert_eq!(unsigned.id(), signed.id());
        assert_eq!(signed.header().signature, vec![7u8; 64]);
    }

    #[test]
    fn sealing_signs_the_block_id() {
        let parent = genesis();
        let mut seen = None;
        let block = BlockBuilder::child_of(&parent).seal_with(|id| {
            seen = Some(*id);
            Vec::new()
        });
        assert_eq!(seen, Some(block.id()));
    }

    #[test]
    fn changing_the_header_changes_the_id() {
        let parent = genesis();
        let a = BlockBuilder::child_of(&parent).nonce(1).unsigned();
        let b = BlockBuilder::child_of(&parent).nonce(2).unsigned();
        assert_ne!(a.id(), b.id());

        let (mut header, txs) = a.clone().into_parts();
        header.nonce = 2;
        assert_eq!(Block::new(header, txs).id(), b.id());
    }

    #[test]
    fn builder_computes_merkle_root() {
        let txs = vec![Transaction::new(b"one".to_vec()), Transaction::new(b"two".to_vec())];
        let block = BlockBuilder::child_of(&genesis()).transactions(txs.clone()).unsigned();
        assert_eq!(block.header().tx_root, merkle_root(&[txs[0].id(), txs[1].id()]));
        assert_eq!(block.tx_ids(), vec![txs[0].id(), txs[1].id()]);
    }

    #[test]
    fn cbor_decode_recomputes_id() {
        let block = BlockBuilder::child_of(&genesis())
            .transactions(vec![Transaction::new(vec![1, 2, 3])])
            .seal_with(|_| vec![9; 64]);
        let decoded = Block::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.id(), block.id());
    }

    #[test]
    fn serde_goes_through_raw_block() {
        let block = BlockBuilder::child_of(&genesis()).unsigned();
        let json = serde_json::to_string(&block).unwrap();
        assert!(!json.contains("\"id\""));
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), block.id());
    }
}
