//! Stoa block store
//! Typed access to blocks, the canonical mapping, head pointers and
//! transaction lookups over any key-value backend

mod stores;

use anyhow::{bail, Result};
use config::Config;
use std::sync::Arc;
use stoa_common::store::{KeyValueStore, MemoryStore};
use tracing::info;

pub use crate::stores::fjall::FjallStore;
pub use crate::stores::ChainDb;

const DEFAULT_STORE: &str = "fjall";

/// Open the backend named by the `store` key
pub fn open_store(config: &Config) -> Result<Arc<dyn KeyValueStore>> {
    let store_type = config.get_string("store").unwrap_or(DEFAULT_STORE.to_string());
    let store: Arc<dyn KeyValueStore> = match store_type.as_str() {
        "fjall" => Arc::new(FjallStore::new(config)?),
        "memory" => Arc::new(MemoryStore::new()),
        _ => bail!("Unknown store type {store_type}"),
    };
    info!(store = store_type, "Opened block store");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_store_type_is_rejected() {
        let config = Config::builder().set_default("store", "rocks").unwrap().build().unwrap();
        assert!(open_store(&config).is_err());
    }

    #[test]
    fn memory_store_can_be_selected() {
        let config = Config::builder().set_default("store", "memory").unwrap().build().unwrap();
        let store = open_store(&config).unwrap();
        assert!(ChainDb::new(store).head_hash().unwrap().is_none());
    }
}
