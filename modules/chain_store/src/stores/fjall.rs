use std::{fs, path::PathBuf};

use anyhow::Result;
use config::Config;
use fjall::{Database, Keyspace};
use stoa_common::store::{KeyValueStore, Namespace, WriteBatch, WriteOp};

const DEFAULT_DATABASE_PATH: &str = "fjall-chain";
const DEFAULT_CLEAR_ON_START: bool = false;

/// Block store on fjall, one keyspace per namespace
pub struct FjallStore {
    database: Database,
    keyspaces: Vec<(Namespace, Keyspace)>,
}

impl FjallStore {
    pub fn new(config: &Config) -> Result<Self> {
        let path = config.get_string("database-path").unwrap_or(DEFAULT_DATABASE_PATH.to_string());
        let clear = config.get_bool("clear-on-start").unwrap_or(DEFAULT_CLEAR_ON_START);
        let path = PathBuf::from(path);
        if clear && path.exists() {
            fs::remove_dir_all(&path)?;
        }
        let database = Database::builder(&path).open()?;
        let keyspaces = Namespace::ALL
            .iter()
            .map(|ns| {
                let keyspace =
                    database.keyspace(ns.name(), fjall::KeyspaceCreateOptions::default)?;
                Ok((*ns, keyspace))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            database,
            keyspaces,
        })
    }

    fn keyspace(&self, namespace: Namespace) -> &Keyspace {
        // Every namespace gets a keyspace in new()
        &self.keyspaces[namespace as usize].1
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.keyspace(namespace).get(key)?.map(|value| value.to_vec()))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut fjall_batch = self.database.batch();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    fjall_batch.insert(self.keyspace(namespace), key, value);
                }
                WriteOp::Delete { namespace, key } => {
                    fjall_batch.remove(self.keyspace(namespace), key);
                }
            }
        }
        fjall_batch.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestState {
        dir: TempDir,
        store: FjallStore,
    }

    fn config_for(dir: &TempDir) -> Config {
        let dir_name = dir.path().to_str().expect("dir_name cannot be stored as string");
        Config::builder().set_default("database-path", dir_name).unwrap().build().unwrap()
    }

    fn init_state() -> TestState {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::new(&config_for(&dir)).unwrap();
        TestState { dir, store }
    }

    #[test]
    fn should_not_error_when_key_not_found() {
        let state = init_state();
        assert_eq!(state.store.get(Namespace::Blocks, &[0xfa, 0x15, 0xe]).unwrap(), None);
    }

    #[test]
    fn should_apply_puts_and_deletes() {
        let state = init_state();
        let mut batch = WriteBatch::new();
        batch.put(Namespace::CanonicalHash, 1u64.to_be_bytes(), b"one".to_vec());
        batch.put(Namespace::TxLookup, b"tx".to_vec(), b"ref".to_vec());
        state.store.write(batch).unwrap();

        let mut batch = WriteBatch::new();
        batch.delete(Namespace::TxLookup, b"tx".to_vec());
        state.store.write(batch).unwrap();

        assert_eq!(
            state.store.get(Namespace::CanonicalHash, &1u64.to_be_bytes()).unwrap(),
            Some(b"one".to_vec())
        );
        assert!(!state.store.has(Namespace::TxLookup, b"tx").unwrap());
        assert!(!state.store.has(Namespace::BlockHeight, &1u64.to_be_bytes()).unwrap());
    }

    #[test]
    fn should_survive_reopen() {
        let state = init_state();
        let mut batch = WriteBatch::new();
        batch.put(Namespace::HeadBlock, b"head".to_vec(), b"hash".to_vec());
        state.store.write(batch).unwrap();

        let TestState { dir, store } = state;
        drop(store);
        let reopened = FjallStore::new(&config_for(&dir)).unwrap();
        assert_eq!(
            reopened.get(Namespace::HeadBlock, b"head").unwrap(),
            Some(b"hash".to_vec())
        );
    }
}
