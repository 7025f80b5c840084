// Stoa common library - main library exports

pub mod block;
pub mod crypto;
pub mod hash;
pub mod ledger;
pub mod merkle;
pub mod messages;
pub mod store;
pub mod types;

// Flattened re-exports
pub use self::block::{Block, BlockBuilder, Header, Transaction};
pub use self::hash::{BlockHash, Hash, TxHash};
pub use self::types::*;
