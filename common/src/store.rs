//! Key-value store contract used by the chain engine, with an in-memory
//! implementation for tests and ephemeral nodes.

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// Logical partitions of the block store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Canonical height -> block hash
    CanonicalHash,
    /// Block hash -> height
    BlockHeight,
    /// (height, hash) -> encoded block
    Blocks,
    /// Current head block hash
    HeadBlock,
    /// Head of the last fast sync, kept level with the head
    HeadFastBlock,
    /// Transaction hash -> lookup entry
    TxLookup,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Namespace::CanonicalHash,
        Namespace::BlockHeight,
        Namespace::Blocks,
        Namespace::HeadBlock,
        Namespace::HeadFastBlock,
        Namespace::TxLookup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Namespace::CanonicalHash => "canonical",
            Namespace::BlockHeight => "heights",
            Namespace::Blocks => "blocks",
            Namespace::HeadBlock => "head",
            Namespace::HeadFastBlock => "head-fast",
            Namespace::TxLookup => "tx-lookup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        namespace: Namespace,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        namespace: Namespace,
        key: Vec<u8>,
    },
}

/// Ordered list of writes applied atomically
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, namespace: Namespace, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put {
            namespace,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, namespace: Namespace, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            namespace,
            key: key.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Persistence backend for blocks, the canonical mapping, head pointers and
/// transaction lookups
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn has(&self, namespace: Namespace, key: &[u8]) -> Result<bool> {
        Ok(self.get(namespace, key)?.is_some())
    }

    /// Apply every operation in the batch, or none of them
    fn write(&self, batch: WriteBatch) -> Result<()>;
}

/// Volatile store keeping everything in a sorted map
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<(Namespace, Vec<u8>), Vec<u8>>>,
    read_only: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of keys held in a namespace
    pub fn count(&self, namespace: Namespace) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .count()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&(namespace, key.to_vec())).cloned())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            bail!("store is read-only");
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for op in batch.into_ops() {
            match op {
                WriteOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    entries.insert((namespace, key), value);
                }
                WriteOp::Delete { namespace, key } => {
                    entries.remove(&(namespace, key));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Namespace::Blocks, b"k".to_vec(), b"v1".to_vec());
        batch.put(Namespace::Blocks, b"k".to_vec(), b"v2".to_vec());
        batch.put(Namespace::TxLookup, b"gone".to_vec(), b"x".to_vec());
        batch.delete(Namespace::TxLookup, b"gone".to_vec());
        store.write(batch).unwrap();

        assert_eq!(store.get(Namespace::Blocks, b"k").unwrap(), Some(b"v2".to_vec()));
        assert!(!store.has(Namespace::TxLookup, b"gone").unwrap());
    }

    #[test]
    fn namespaces_are_separate() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Namespace::HeadBlock, b"k".to_vec(), b"v".to_vec());
        store.write(batch).unwrap();

        assert!(store.has(Namespace::HeadBlock, b"k").unwrap());
        assert!(!store.has(Namespace::HeadFastBlock, b"k").unwrap());
        assert_eq!(store.count(Namespace::HeadBlock), 1);
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let store = MemoryStore::new();
        store.set_read_only(true);
        let mut batch = WriteBatch::new();
        batch.put(Namespace::Blocks, b"k".to_vec(), b"v".to_vec());
        assert!(store.write(batch).is_err());
        assert_eq!(store.count(Namespace::Blocks), 0);
    }
}
