use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use stoa_common::store::{KeyValueStore, Namespace, WriteBatch};
use stoa_common::{Block, BlockHash, BlockHeight, TxHash, TxLookupEntry};

pub mod fjall;

const HEAD_KEY: &[u8] = b"LastBlock";
const HEAD_FAST_KEY: &[u8] = b"LastFast";

fn block_key(height: BlockHeight, hash: &BlockHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(hash.as_ref());
    key
}

fn decode_hash(bytes: &[u8]) -> Result<BlockHash> {
    BlockHash::try_from(bytes).map_err(|_| anyhow!("stored hash has length {}", bytes.len()))
}

fn decode_height(bytes: &[u8]) -> Result<BlockHeight> {
    let bytes: [u8; 8] = bytes.try_into().context("stored height is not 8 bytes")?;
    Ok(u64::from_be_bytes(bytes))
}

/// Typed view over the block store
#[derive(Clone)]
pub struct ChainDb {
    store: Arc<dyn KeyValueStore>,
}

impl ChainDb {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.store.write(batch)
    }

    pub fn canonical_hash(&self, height: BlockHeight) -> Result<Option<BlockHash>> {
        self.store
            .get(Namespace::CanonicalHash, &height.to_be_bytes())?
            .map(|bytes| decode_hash(&bytes))
            .transpose()
    }

    pub fn block_height(&self, hash: &BlockHash) -> Result<Option<BlockHeight>> {
        self.store
            .get(Namespace::BlockHeight, hash.as_ref())?
            .map(|bytes| decode_height(&bytes))
            .transpose()
    }

    pub fn has_block(&self, hash: &BlockHash) -> Result<bool> {
        let Some(height) = self.block_height(hash)? else {
            return Ok(false);
        };
        self.store.has(Namespace::Blocks, &block_key(height, hash))
    }

    pub fn block(&self, hash: &BlockHash) -> Result<Option<Block>> {
        let Some(height) = self.block_height(hash)? else {
            return Ok(None);
        };
        let Some(bytes) = self.store.get(Namespace::Blocks, &block_key(height, hash))? else {
            return Ok(None);
        };
        let block = Block::from_bytes(&bytes).with_context(|| format!("decoding block {hash}"))?;
        Ok(Some(block))
    }

    pub fn canonical_block(&self, height: BlockHeight) -> Result<Option<Block>> {
        match self.canonical_hash(height)? {
            Some(hash) => self.block(&hash),
            None => Ok(None),
        }
    }

    pub fn head_hash(&self) -> Result<Option<BlockHash>> {
        self.store.get(Namespace::HeadBlock, HEAD_KEY)?.map(|bytes| decode_hash(&bytes)).transpose()
    }

    pub fn head_fast_hash(&self) -> Result<Option<BlockHash>> {
        self.store
            .get(Namespace::HeadFastBlock, HEAD_FAST_KEY)?
            .map(|bytes| decode_hash(&bytes))
            .transpose()
    }

    pub fn tx_lookup(&self, tx: &TxHash) -> Result<Option<TxLookupEntry>> {
        let Some(bytes) = self.store.get(Namespace::TxLookup, tx.as_ref())? else {
            return Ok(None);
        };
        Ok(Some(minicbor::decode(&bytes)?))
    }

    /// Stage the block body and its hash -> height entry
    pub fn put_block(batch: &mut WriteBatch, block: &Block) {
        let id = block.id();
        batch.put(Namespace::Blocks, block_key(block.height(), &id), block.to_bytes());
        batch.put(Namespace::BlockHeight, id.to_vec(), block.height().to_be_bytes());
    }

    pub fn delete_block(batch: &mut WriteBatch, block: &Block) {
        let id = block.id();
        batch.delete(Namespace::Blocks, block_key(block.height(), &id));
        batch.delete(Namespace::BlockHeight, id.to_vec());
    }

    pub fn put_canonical(batch: &mut WriteBatch, height: BlockHeight, hash: &BlockHash) {
        batch.put(Namespace::CanonicalHash, height.to_be_bytes(), hash.to_vec());
    }

    pub fn delete_canonical(batch: &mut WriteBatch, height: BlockHeight) {
        batch.delete(Namespace::CanonicalHash, height.to_be_bytes());
    }

    /// Point both head markers at `hash`
    pub fn put_head(batch: &mut WriteBatch, hash: &BlockHash) {
        batch.put(Namespace::HeadBlock, HEAD_KEY, hash.to_vec());
        batch.put(Namespace::HeadFastBlock, HEAD_FAST_KEY, hash.to_vec());
    }

    /// Stage a lookup entry for every transaction in the block
    pub fn put_tx_lookups(batch: &mut WriteBatch, block: &Block) {
        for (index, tx) in block.tx_ids().iter().enumerate() {
            let entry = TxLookupEntry {
                block_id: block.id(),
                height: block.height(),
                index: index as u32,
            };
            batch.put(
                Namespace::TxLookup,
                tx.to_vec(),
                minicbor::to_vec(entry).expect("infallible"),
            );
        }
    }

    pub fn delete_tx_lookup(batch: &mut WriteBatch, tx: &TxHash) {
        batch.delete(Namespace::TxLookup, tx.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoa_common::store::MemoryStore;
    use stoa_common::{BlockBuilder, Transaction};

    fn chain() -> (Block, Block) {
        let genesis = Block::genesis(10, Vec::new());
        let child = BlockBuilder::child_of(&genesis)
            .transactions(vec![Transaction::new(vec![1]), Transaction::new(vec![2])])
            .unsigned();
        (genesis, child)
    }

    #[test]
    fn stored_block_is_found_by_hash_and_height() {
        let db = ChainDb::new(Arc::new(MemoryStore::new()));
        let (genesis, child) = chain();

        let mut batch = WriteBatch::new();
        for block in [&genesis, &child] {
            ChainDb::put_block(&mut batch, block);
            ChainDb::put_canonical(&mut batch, block.height(), &block.id());
        }
        ChainDb::put_head(&mut batch, &child.id());
        db.write(batch).unwrap();

        assert_eq!(db.block(&child.id()).unwrap(), Some(child.clone()));
        assert_eq!(db.canonical_block(0).unwrap(), Some(genesis.clone()));
        assert_eq!(db.block_height(&child.id()).unwrap(), Some(1));
        assert_eq!(db.head_hash().unwrap(), Some(child.id()));
        assert_eq!(db.head_fast_hash().unwrap(), Some(child.id()));
        assert!(db.has_block(&genesis.id()).unwrap());
    }

    #[test]
    fn tx_lookups_record_position() {
        let db = ChainDb::new(Arc::new(MemoryStore::new()));
        let (_, child) = chain();

        let mut batch = WriteBatch::new();
        ChainDb::put_tx_lookups(&mut batch, &child);
        db.write(batch).unwrap();

        let second = child.transactions()[1].id();
        assert_eq!(
            db.tx_lookup(&second).unwrap(),
            Some(TxLookupEntry {
                block_id: child.id(),
                height: 1,
                index: 1
            })
        );

        let mut batch = WriteBatch::new();
        ChainDb::delete_tx_lookup(&mut batch, &second);
        db.write(batch).unwrap();
        assert_eq!(db.tx_lookup(&second).unwrap(), None);
    }

    #[test]
    fn deleted_block_is_gone() {
        let db = ChainDb::new(Arc::new(MemoryStore::new()));
        let (_, child) = chain();

        let mut batch = WriteBatch::new();
        ChainDb::put_block(&mut batch, &child);
        db.write(batch).unwrap();

        let mut batch = WriteBatch::new();
        ChainDb::delete_block(&mut batch, &child);
        db.write(batch).unwrap();
        assert!(!db.has_block(&child.id()).unwrap());
        assert_eq!(db.block(&child.id()).unwrap(), None);
    }
}
