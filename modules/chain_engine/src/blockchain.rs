//! Canonical chain maintenance: insertion, fork choice, reorganisation and
//! the bad and future block caches.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use lru::LruCache;
use stoa_common::ledger::ApplicationState;
use stoa_common::messages::ChainEvent;
use stoa_common::store::{KeyValueStore, WriteBatch};
use stoa_common::{Block, BlockHash, BlockHeight, TxHash, TxLookupEntry};
use stoa_module_authority::{AuthorityEngine, AuthorityError, ChainReader};
use stoa_module_chain_store::ChainDb;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain_error::ChainError;
use crate::configuration::{capacity, ChainConfig};

/// Source of local unix time in seconds
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0))
}

/// What `process_block` did with a block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Already stored, nothing to do
    Known,
    /// Now part of the canonical chain
    Canonical,
    /// Stored on a side branch
    SideBranch,
    /// Parked until its timestamp or its parent arrives
    Queued,
}

/// A rejected block and why, kept for diagnostics
#[derive(Clone, Debug)]
pub struct BadBlock {
    pub block: Block,
    pub reason: String,
}

/// The blocks a head switch removes and adds
struct Branches {
    ancestor: Block,
    /// Newest first
    detached: Vec<Block>,
    /// Oldest first
    attached: Vec<Block>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The chain engine
pub struct Blockchain {
    config: ChainConfig,
    db: ChainDb,
    authority: AuthorityEngine,
    ledger: Arc<dyn ApplicationState>,
    clock: Clock,
    genesis: Block,

    // Serialises every mutation of the chain
    insert_lock: Mutex<()>,
    head: RwLock<Block>,

    block_cache: Mutex<LruCache<BlockHash, Block>>,
    number_cache: Mutex<LruCache<BlockHash, BlockHeight>>,
    future_blocks: Mutex<LruCache<BlockHash, Block>>,
    bad_blocks: Mutex<LruCache<BlockHash, BadBlock>>,

    chain_feed: broadcast::Sender<ChainEvent>,
    head_feed: broadcast::Sender<ChainEvent>,
    side_feed: broadcast::Sender<ChainEvent>,

    quit: watch::Sender<bool>,
}

impl Blockchain {
    /// Open the chain held in `store`, writing `genesis` if the store is empty
    pub fn new(
        config: ChainConfig,
        store: Arc<dyn KeyValueStore>,
        authority: AuthorityEngine,
        ledger: Arc<dyn ApplicationState>,
        genesis: Block,
    ) -> Result<Arc<Self>, ChainError> {
        Self::with_clock(config, store, authority, ledger, genesis, system_clock())
    }

    pub fn with_clock(
        config: ChainConfig,
        store: Arc<dyn KeyValueStore>,
        authority: AuthorityEngine,
        ledger: Arc<dyn ApplicationState>,
        genesis: Block,
        clock: Clock,
    ) -> Result<Arc<Self>, ChainError> {
        let db = ChainDb::new(store);
        let head = load_last_chain(&db, &genesis)?;
        info!(
            height = head.height(),
            hash = %head.id(),
            genesis = %genesis.id(),
            "Loaded chain"
        );

        let (chain_feed, _) = broadcast::channel(config.event_capacity.max(1));
        let (head_feed, _) = broadcast::channel(config.event_capacity.max(1));
        let (side_feed, _) = broadcast::channel(config.event_capacity.max(1));
        let (quit, _) = watch::channel(false);

        Ok(Arc::new(Self {
            block_cache: Mutex::new(LruCache::new(capacity(config.block_cache_size))),
            number_cache: Mutex::new(LruCache::new(capacity(config.number_cache_size))),
            future_blocks: Mutex::new(LruCache::new(capacity(config.future_cache_size))),
            bad_blocks: Mutex::new(LruCache::new(capacity(config.bad_cache_size))),
            config,
            db,
            authority,
            ledger,
            clock,
            genesis,
            insert_lock: Mutex::new(()),
            head: RwLock::new(head),
            chain_feed,
            head_feed,
            side_feed,
            quit,
        }))
    }

    // === Read API ===

    pub fn best_block(&self) -> Block {
        self.head.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    pub fn authority(&self) -> &AuthorityEngine {
        &self.authority
    }

    /// Local unix time in seconds, as the chain sees it
    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    pub fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>, ChainError> {
        if let Some(block) = lock(&self.block_cache).get(hash) {
            return Ok(Some(block.clone()));
        }
        let block = self.db.block(hash)?;
        if let Some(block) = &block {
            lock(&self.block_cache).put(*hash, block.clone());
        }
        Ok(block)
    }

    /// Canonical block at `height`
    pub fn block_by_height(&self, height: BlockHeight) -> Result<Option<Block>, ChainError> {
        match self.db.canonical_hash(height)? {
            Some(hash) => self.block_by_hash(&hash),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &BlockHash) -> Result<bool, ChainError> {
        if lock(&self.block_cache).contains(hash) {
            return Ok(true);
        }
        Ok(self.db.has_block(hash)?)
    }

    pub fn transaction_lookup(&self, tx: &TxHash) -> Result<Option<TxLookupEntry>, ChainError> {
        Ok(self.db.tx_lookup(tx)?)
    }

    pub fn bad_blocks(&self) -> Vec<BadBlock> {
        lock(&self.bad_blocks).iter().map(|(_, bad)| bad.clone()).collect()
    }

    pub fn future_block_count(&self) -> usize {
        lock(&self.future_blocks).len()
    }

    /// Blocks that became canonical
    pub fn subscribe_chain(&self) -> broadcast::Receiver<ChainEvent> {
        self.chain_feed.subscribe()
    }

    /// New canonical heads
    pub fn subscribe_chain_head(&self) -> broadcast::Receiver<ChainEvent> {
        self.head_feed.subscribe()
    }

    /// Blocks stored off the canonical chain, or detached from it
    pub fn subscribe_chain_side(&self) -> broadcast::Receiver<ChainEvent> {
        self.side_feed.subscribe()
    }

    /// Stop background work and wait for any insertion in progress
    pub fn stop(&self) {
        self.quit.send_replace(true);
        let _guard = lock(&self.insert_lock);
        info!("Chain engine stopped");
    }

    fn height_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockHeight>, ChainError> {
        if let Some(height) = lock(&self.number_cache).get(hash) {
            return Ok(Some(*height));
        }
        let height = self.db.block_height(hash)?;
        if let Some(height) = height {
            lock(&self.number_cache).put(*hash, height);
        }
        Ok(height)
    }

    fn parent_of(&self, block: &Block) -> Result<Block, ChainError> {
        self.block_by_hash(&block.parent_id())?.ok_or_else(|| {
            ChainError::Fatal(anyhow!(
                "missing ancestor {} of block {} at {}",
                block.parent_id(),
                block.id(),
                block.height()
            ))
        })
    }

    // === Insertion ===

    /// Insert a block from any source
    pub fn process_block(&self, block: Block) -> Result<ProcessOutcome, ChainError> {
        let _guard = lock(&self.insert_lock);
        self.process_block_locked(block)
    }

    /// Insert blocks in order, stopping at the first failure. Returns how
    /// many were handled.
    pub fn insert_chain(&self, blocks: Vec<Block>) -> (usize, Result<(), ChainError>) {
        let _guard = lock(&self.insert_lock);
        let count = blocks.len();
        for (index, block) in blocks.into_iter().enumerate() {
            if let Err(error) = self.process_block_locked(block) {
                return (index, Err(error));
            }
        }
        (count, Ok(()))
    }

    fn process_block_locked(&self, block: Block) -> Result<ProcessOutcome, ChainError> {
        let hash = block.id();

        if lock(&self.bad_blocks).contains(&hash) {
            return Err(ChainError::KnownBadBlock { hash });
        }
        if self.has_block(&hash)? {
            debug!(%hash, "Ignoring known block");
            return Ok(ProcessOutcome::Known);
        }

        let now = (self.clock)();
        match self.authority.verify_block(self, &block, now) {
            Ok(()) => {}
            Err(AuthorityError::FutureBlock { timestamp, now }) => {
                if timestamp > now + self.config.max_future_secs {
                    return Err(AuthorityError::FutureBlock { timestamp, now }.into());
                }
                debug!(%hash, ahead = timestamp - now, "Parking future block");
                lock(&self.future_blocks).put(hash, block);
                return Ok(ProcessOutcome::Queued);
            }
            Err(AuthorityError::UnknownAncestor { parent }) => {
                if lock(&self.future_blocks).contains(&parent) {
                    debug!(%hash, %parent, "Parking block with future parent");
                    lock(&self.future_blocks).put(hash, block);
                    return Ok(ProcessOutcome::Queued);
                }
                return Err(AuthorityError::UnknownAncestor { parent }.into());
            }
            Err(error) => {
                warn!(%hash, height = block.height(), "Invalid block: {error}");
                self.report_bad(block, error.to_string());
                return Err(error.into());
            }
        }

        let head = self.best_block();
        if block.height() <= head.height() {
            return self.write_side_block(block);
        }
        self.adopt(head, block)
    }

    fn report_bad(&self, block: Block, reason: String) {
        lock(&self.bad_blocks).put(block.id(), BadBlock { block, reason });
    }

    /// Store a block without making it canonical
    fn write_side_block(&self, block: Block) -> Result<ProcessOutcome, ChainError> {
        let mut batch = WriteBatch::new();
        ChainDb::put_block(&mut batch, &block);
        self.db.write(batch)?;

        debug!(hash = %block.id(), height = block.height(), "Stored side block");
        lock(&self.number_cache).put(block.id(), block.height());
        let _ = self.side_feed.send(ChainEvent::new(&block));
        Ok(ProcessOutcome::SideBranch)
    }

    /// Make `block` the new head, switching branches if its parent is not
    /// the current head
    fn adopt(&self, head: Block, block: Block) -> Result<ProcessOutcome, ChainError> {
        let branches = if block.parent_id() == head.id() {
            Branches {
                ancestor: head.clone(),
                detached: Vec::new(),
                attached: vec![block.clone()],
            }
        } else {
            let parent = self.parent_of(&block)?;
            let mut branches = self.find_branches(&head, parent)?;
            branches.attached.push(block.clone());
            branches
        };
        let reorg = !branches.detached.is_empty();

        self.apply_to_ledger(&head, &branches)?;

        let mut batch = WriteBatch::new();
        ChainDb::put_block(&mut batch, &block);
        if reorg {
            self.reorg(&mut batch, &head, &branches);
        } else {
            ChainDb::put_canonical(&mut batch, block.height(), &block.id());
            ChainDb::put_tx_lookups(&mut batch, &block);
        }
        ChainDb::put_head(&mut batch, &block.id());
        self.db.write(batch)?;

        {
            let mut numbers = lock(&self.number_cache);
            numbers.put(block.id(), block.height());
        }
        lock(&self.block_cache).put(block.id(), block.clone());
        *self.head.write().unwrap_or_else(PoisonError::into_inner) = block.clone();

        for attached in &branches.attached {
            self.ledger.commit(&attached.id()).map_err(|error| {
                ChainError::Fatal(error.context(format!("committing block {}", attached.id())))
            })?;
        }

        if reorg {
            info!(
                ancestor = branches.ancestor.height(),
                dropped = branches.detached.len(),
                added = branches.attached.len(),
                "Chain reorganised"
            );
            for detached in &branches.detached {
                let _ = self.side_feed.send(ChainEvent::new(detached));
            }
        }
        for attached in &branches.attached {
            let _ = self.chain_feed.send(ChainEvent::new(attached));
        }
        let _ = self.head_feed.send(ChainEvent::new(&block));
        info!(height = block.height(), hash = %block.id(), txs = block.transactions().len(), "New head");

        Ok(ProcessOutcome::Canonical)
    }

    /// Run the ledger over every attached block, restoring the old head's
    /// view if any of them fails
    fn apply_to_ledger(&self, head: &Block, branches: &Branches) -> Result<(), ChainError> {
        let restore = |failed: &Block, reason: String| -> ChainError {
            warn!(hash = %failed.id(), height = failed.height(), "Ledger rejected block: {reason}");
            if let Err(error) = self.ledger.update_chain(head) {
                error!("could not restore ledger to {}: {error:#}", head.id());
            }
            self.report_bad(failed.clone(), reason.clone());
            ChainError::Ledger {
                hash: failed.id(),
                reason,
            }
        };

        if !branches.detached.is_empty() {
            if let Err(error) = self.ledger.update_chain(&branches.ancestor) {
                // The ancestor is good; nothing on the new branch is to blame
                if let Err(error) = self.ledger.update_chain(head) {
                    error!("could not restore ledger to {}: {error:#}", head.id());
                }
                return Err(ChainError::Fatal(error.context("rewinding ledger")));
            }
        }
        for block in &branches.attached {
            if let Err(error) = self.ledger.check_block(block) {
                return Err(restore(block, format!("{error:#}")));
            }
            if let Err(error) = self.ledger.process_block(block) {
                return Err(restore(block, format!("{error:#}")));
            }
        }
        Ok(())
    }

    /// Walk both branches back to their common ancestor
    fn find_branches(&self, old_head: &Block, new_parent: Block) -> Result<Branches, ChainError> {
        let mut old = old_head.clone();
        let mut new = new_parent;
        let mut detached = Vec::new();
        let mut attached = Vec::new();

        while old.height() > new.height() {
            let parent = self.parent_of(&old)?;
            detached.push(old);
            old = parent;
        }
        while new.height() > old.height() {
            let parent = self.parent_of(&new)?;
            attached.push(new);
            new = parent;
        }
        while old.id() != new.id() {
            let old_parent = self.parent_of(&old)?;
            let new_parent = self.parent_of(&new)?;
            detached.push(old);
            attached.push(new);
            old = old_parent;
            new = new_parent;
        }

        attached.reverse();
        Ok(Branches {
            ancestor: old,
            detached,
            attached,
        })
    }

    /// Stage the canonical mapping and transaction lookup changes of a
    /// branch switch
    fn reorg(&self, batch: &mut WriteBatch, old_head: &Block, branches: &Branches) {
        let mut kept: HashSet<TxHash> = HashSet::new();
        for block in &branches.attached {
            ChainDb::put_canonical(batch, block.height(), &block.id());
            ChainDb::put_tx_lookups(batch, block);
            kept.extend(block.tx_ids());
        }

        let new_height = branches.attached.last().map_or(branches.ancestor.height(), Block::height);
        for height in (new_height + 1)..=old_head.height() {
            ChainDb::delete_canonical(batch, height);
        }

        for block in &branches.detached {
            for tx in block.tx_ids() {
                if !kept.contains(&tx) {
                    ChainDb::delete_tx_lookup(batch, &tx);
                }
            }
        }
    }

    // === Future blocks ===

    /// Re-submit every parked block, lowest first
    pub fn process_future_blocks(&self) -> Result<(), ChainError> {
        // Held across the drain so a child of a drained block still finds
        // its parent parked or stored
        let _guard = lock(&self.insert_lock);
        let mut blocks: Vec<Block> = {
            let mut future = lock(&self.future_blocks);
            let blocks = future.iter().map(|(_, block)| block.clone()).collect();
            future.clear();
            blocks
        };
        if blocks.is_empty() {
            return Ok(());
        }
        blocks.sort_by_key(Block::height);
        debug!(count = blocks.len(), "Processing future blocks");

        for block in blocks {
            let hash = block.id();
            match self.process_block_locked(block) {
                Ok(_) => {}
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => debug!(%hash, "Future block not inserted: {error}"),
            }
        }
        Ok(())
    }

    /// Spawn the task that re-submits parked blocks until `stop`
    pub fn spawn_future_ticker(self: &Arc<Self>) -> JoinHandle<Result<(), ChainError>> {
        let chain = self.clone();
        let mut quit = self.quit.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(chain.config.future_tick());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = async { let _ = quit.wait_for(|stopped| *stopped).await; } => return Ok(()),
                    _ = interval.tick() => {
                        let chain = chain.clone();
                        tokio::task::spawn_blocking(move || chain.process_future_blocks())
                            .await
                            .map_err(|error| ChainError::Fatal(error.into()))??;
                    }
                }
            }
        })
    }

    // === Rewind ===

    /// Rewind the canonical chain to `target`, deleting every block above it
    pub fn set_head(&self, target: BlockHeight) -> Result<(), ChainError> {
        let _guard = lock(&self.insert_lock);

        let head = self.best_block();
        if target > head.height() {
            return Err(ChainError::InvalidRewind {
                target,
                head: head.height(),
            });
        }
        warn!(from = head.height(), to = target, "Rewinding chain");

        let mut batch = WriteBatch::new();
        let mut current = head;
        while current.height() > target {
            ChainDb::delete_block(&mut batch, &current);
            ChainDb::delete_canonical(&mut batch, current.height());
            for tx in current.tx_ids() {
                ChainDb::delete_tx_lookup(&mut batch, &tx);
            }
            current = self.parent_of(&current)?;
        }
        ChainDb::put_head(&mut batch, &current.id());
        self.db.write(batch)?;

        lock(&self.block_cache).clear();
        lock(&self.number_cache).clear();
        lock(&self.future_blocks).clear();

        let head = load_last_chain(&self.db, &self.genesis)?;
        *self.head.write().unwrap_or_else(PoisonError::into_inner) = head.clone();
        self.ledger
            .update_chain(&head)
            .map_err(|error| ChainError::Fatal(error.context("rewinding ledger")))?;

        let _ = self.head_feed.send(ChainEvent::new(&head));
        Ok(())
    }
}

impl ChainReader for Blockchain {
    fn height_of(&self, hash: &BlockHash) -> Option<BlockHeight> {
        match self.height_by_hash(hash) {
            Ok(height) => height,
            Err(error) => {
                error!("could not read height of {hash}: {error}");
                None
            }
        }
    }
}

/// Establish genesis and read the persisted head, falling back to genesis
/// if the head pointer or its block is missing
pub fn load_last_chain(db: &ChainDb, genesis: &Block) -> Result<Block, ChainError> {
    match db.canonical_hash(0)? {
        None => {
            info!(hash = %genesis.id(), "Writing genesis block");
            let mut batch = WriteBatch::new();
            ChainDb::put_block(&mut batch, genesis);
            ChainDb::put_canonical(&mut batch, 0, &genesis.id());
            ChainDb::put_head(&mut batch, &genesis.id());
            db.write(batch)?;
        }
        Some(stored) if stored != genesis.id() => {
            return Err(ChainError::GenesisMismatch {
                stored,
                configured: genesis.id(),
            });
        }
        Some(_) => {}
    }

    let Some(head_hash) = db.head_hash()? else {
        warn!("Empty database, resetting chain");
        return reset_to_genesis(db, genesis);
    };
    match db.block(&head_hash)? {
        Some(head) => Ok(head),
        None => {
            warn!(hash = %head_hash, "Head block missing, resetting chain");
            reset_to_genesis(db, genesis)
        }
    }
}

fn reset_to_genesis(db: &ChainDb, genesis: &Block) -> Result<Block, ChainError> {
    let mut batch = WriteBatch::new();
    let mut height = 1;
    while db.canonical_hash(height)?.is_some() {
        ChainDb::delete_canonical(&mut batch, height);
        height += 1;
    }
    ChainDb::put_head(&mut batch, &genesis.id());
    db.write(batch)?;
    Ok(genesis.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use stoa_common::ledger::PassthroughState;
    use stoa_common::store::{MemoryStore, Namespace};
    use stoa_common::{BlockBuilder, Transaction};
    use stoa_module_authority::AuthorityKey;
    use stoa_module_chain_store::FjallStore;

    const GENESIS_TIME: u64 = 1_000;
    const NOW: u64 = 2_000;

    fn keys() -> Vec<AuthorityKey> {
        (1..=3u8).map(|n| AuthorityKey::from_seed(&[n; 32])).collect()
    }

    fn genesis() -> Block {
        Block::genesis(GENESIS_TIME, b"stoa-test".to_vec())
    }

    fn open(
        config: ChainConfig,
        store: Arc<dyn KeyValueStore>,
        ledger: Arc<dyn ApplicationState>,
        genesis: Block,
        now: &Arc<AtomicU64>,
    ) -> Result<Arc<Blockchain>, ChainError> {
        let authority = AuthorityEngine::new(keys().iter().map(AuthorityKey::public_key).collect());
        let now = now.clone();
        Blockchain::with_clock(
            config,
            store,
            authority,
            ledger,
            genesis,
            Arc::new(move || now.load(Ordering::SeqCst)),
        )
    }

    struct Harness {
        chain: Arc<Blockchain>,
        store: Arc<MemoryStore>,
        now: Arc<AtomicU64>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let now = Arc::new(AtomicU64::new(NOW));
        let chain = open(
            ChainConfig::default(),
            store.clone(),
            Arc::new(PassthroughState::new()),
            genesis(),
            &now,
        )
        .unwrap();
        Harness { chain, store, now }
    }

    fn seal(builder: BlockBuilder, height: BlockHeight) -> Block {
        let key = &keys()[(height % 3) as usize];
        builder.seal_with(|id| key.sign(id))
    }

    fn child(parent: &Block, nonce: u64, txs: Vec<Transaction>) -> Block {
        seal(BlockBuilder::child_of(parent).nonce(nonce).transactions(txs), parent.height() + 1)
    }

    fn tx(payload: u8) -> Transaction {
        Transaction::new(vec![payload])
    }

    #[test]
    fn known_block_is_idempotent() {
        let h = harness();
        let b1 = child(&genesis(), 0, vec![tx(1)]);

        assert_eq!(h.chain.process_block(b1.clone()).unwrap(), ProcessOutcome::Canonical);
        assert_eq!(h.chain.process_block(b1.clone()).unwrap(), ProcessOutcome::Known);
        assert_eq!(h.chain.best_block(), b1);
        assert_eq!(h.chain.block_by_height(1).unwrap(), Some(b1));
    }

    #[test]
    fn block_at_head_height_goes_to_side_branch() {
        let h = harness();
        let a1 = child(&genesis(), 0, Vec::new());
        let b1 = child(&genesis(), 1, Vec::new());

        h.chain.process_block(a1.clone()).unwrap();
        assert_eq!(h.chain.process_block(b1.clone()).unwrap(), ProcessOutcome::SideBranch);

        assert_eq!(h.chain.best_block(), a1);
        assert_eq!(h.chain.block_by_height(1).unwrap(), Some(a1));
        assert_eq!(h.chain.block_by_hash(&b1.id()).unwrap(), Some(b1));
    }

    #[test]
    fn longer_branch_reorganises_chain_and_lookups() {
        let h = harness();
        let a1 = child(&genesis(), 0, vec![tx(1), tx(2)]);
        let b1 = child(&genesis(), 1, vec![tx(2), tx(3)]);
        let b2 = child(&b1, 0, vec![tx(4)]);

        h.chain.process_block(a1.clone()).unwrap();
        assert_eq!(
            h.chain.transaction_lookup(&tx(1).id()).unwrap().map(|e| e.block_id),
            Some(a1.id())
        );
        h.chain.process_block(b1.clone()).unwrap();
        assert_eq!(h.chain.process_block(b2.clone()).unwrap(), ProcessOutcome::Canonical);

        assert_eq!(h.chain.best_block(), b2);
        assert_eq!(h.chain.block_by_height(1).unwrap(), Some(b1.clone()));
        assert_eq!(h.chain.block_by_height(2).unwrap(), Some(b2.clone()));

        // Only in the dropped block
        assert_eq!(h.chain.transaction_lookup(&tx(1).id()).unwrap(), None);
        // In both; now points at the new branch
        let shared = h.chain.transaction_lookup(&tx(2).id()).unwrap().unwrap();
        assert_eq!((shared.block_id, shared.height, shared.index), (b1.id(), 1, 0));
        assert_eq!(
            h.chain.transaction_lookup(&tx(4).id()).unwrap().map(|e| e.block_id),
            Some(b2.id())
        );
        // The old block is kept, just not canonical
        assert!(h.chain.has_block(&a1.id()).unwrap());
    }

    #[test]
    fn reorg_events_detach_then_attach() {
        let h = harness();
        let mut chain_rx = h.chain.subscribe_chain();
        let mut head_rx = h.chain.subscribe_chain_head();
        let mut side_rx = h.chain.subscribe_chain_side();

        let a1 = child(&genesis(), 0, Vec::new());
        let b1 = child(&genesis(), 1, Vec::new());
        let b2 = child(&b1, 0, Vec::new());
        for block in [&a1, &b1, &b2] {
            h.chain.process_block(block.clone()).unwrap();
        }

        let ids = |rx: &mut broadcast::Receiver<ChainEvent>| {
            let mut ids = Vec::new();
            while let Ok(event) = rx.try_recv() {
                ids.push(event.id);
            }
            ids
        };
        assert_eq!(ids(&mut chain_rx), vec![a1.id(), b1.id(), b2.id()]);
        assert_eq!(ids(&mut head_rx), vec![a1.id(), b2.id()]);
        assert_eq!(ids(&mut side_rx), vec![b1.id(), a1.id()]);
    }

    #[test]
    fn invalid_block_is_remembered_as_bad() {
        let h = harness();
        let bad = seal(
            BlockBuilder::child_of(&genesis())
                .transactions(vec![tx(1)])
                .tx_root(BlockHash::new([7; 32])),
            1,
        );

        let err = h.chain.process_block(bad.clone()).unwrap_err();
        assert!(matches!(err, ChainError::Authority(AuthorityError::InvalidTxRoot { .. })));
        assert!(matches!(
            h.chain.process_block(bad.clone()).unwrap_err(),
            ChainError::KnownBadBlock { hash } if hash == bad.id()
        ));
        assert_eq!(h.chain.bad_blocks().len(), 1);
        assert_eq!(h.chain.best_block(), genesis());
    }

    #[test]
    fn duplicate_transaction_is_rejected() {
        let h = harness();
        let block = child(&genesis(), 0, vec![tx(5), tx(5)]);
        assert!(matches!(
            h.chain.process_block(block).unwrap_err(),
            ChainError::Authority(AuthorityError::DuplicateTransaction { .. })
        ));
    }

    #[test]
    fn orphan_is_not_marked_bad() {
        let h = harness();
        let stranger = Block::genesis(GENESIS_TIME, b"elsewhere".to_vec());
        let orphan = child(&stranger, 0, Vec::new());

        assert!(matches!(
            h.chain.process_block(orphan.clone()).unwrap_err(),
            ChainError::Authority(AuthorityError::UnknownAncestor { .. })
        ));
        assert!(h.chain.bad_blocks().is_empty());
        assert_eq!(h.chain.future_block_count(), 0);
    }

    #[test]
    fn future_blocks_are_parked_and_retried() {
        let h = harness();
        let b1 = seal(BlockBuilder::child_of(&genesis()).timestamp(NOW + 10), 1);
        let b2 = child(&b1, 0, Vec::new());
        let far = seal(BlockBuilder::child_of(&genesis()).nonce(9).timestamp(NOW + 100), 1);

        assert_eq!(h.chain.process_block(b1.clone()).unwrap(), ProcessOutcome::Queued);
        // Parent is parked, so the child waits too
        assert_eq!(h.chain.process_block(b2.clone()).unwrap(), ProcessOutcome::Queued);
        assert!(matches!(
            h.chain.process_block(far).unwrap_err(),
            ChainError::Authority(AuthorityError::FutureBlock { .. })
        ));
        assert_eq!(h.chain.future_block_count(), 2);

        // Still too early: both go back to waiting
        h.chain.process_future_blocks().unwrap();
        assert_eq!(h.chain.future_block_count(), 2);

        h.now.store(NOW + 20, Ordering::SeqCst);
        h.chain.process_future_blocks().unwrap();
        assert_eq!(h.chain.future_block_count(), 0);
        assert_eq!(h.chain.best_block(), b2);
    }

    #[tokio::test]
    async fn ticker_imports_parked_blocks() {
        let store = Arc::new(MemoryStore::new());
        let now = Arc::new(AtomicU64::new(NOW));
        let config = ChainConfig {
            future_tick_secs: 1,
            ..ChainConfig::default()
        };
        let chain = open(config, store, Arc::new(PassthroughState::new()), genesis(), &now).unwrap();
        let handle = chain.spawn_future_ticker();

        let b1 = seal(BlockBuilder::child_of(&genesis()).timestamp(NOW + 5), 1);
        assert_eq!(chain.process_block(b1.clone()).unwrap(), ProcessOutcome::Queued);
        now.store(NOW + 5, Ordering::SeqCst);

        for _ in 0..40 {
            if chain.best_block() == b1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(chain.best_block(), b1);

        chain.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn child_of_parked_block_is_parked_during_retry() {
        let h = harness();
        let b1 = seal(BlockBuilder::child_of(&genesis()).timestamp(NOW + 10), 1);
        let b2 = child(&b1, 0, Vec::new());
        assert_eq!(h.chain.process_block(b1.clone()).unwrap(), ProcessOutcome::Queued);
        h.now.store(NOW + 20, Ordering::SeqCst);

        // An insertion holds the lock while the retry starts
        let guard = lock(&h.chain.insert_lock);
        let retry = {
            let chain = h.chain.clone();
            std::thread::spawn(move || chain.process_future_blocks())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(h.chain.future_block_count(), 1);
        assert_eq!(h.chain.process_block_locked(b2.clone()).unwrap(), ProcessOutcome::Queued);
        drop(guard);

        retry.join().unwrap().unwrap();
        assert_eq!(h.chain.best_block(), b2);
        assert_eq!(h.chain.future_block_count(), 0);
    }

    #[tokio::test]
    async fn ticker_started_after_stop_exits() {
        let h = harness();
        h.chain.stop();
        let handle = h.chain.spawn_future_ticker();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    /// Refuses one block and records every rewind
    #[derive(Default)]
    struct RejectingLedger {
        reject: Option<BlockHash>,
        rewinds: Mutex<Vec<BlockHash>>,
        committed: Mutex<Vec<BlockHash>>,
    }

    impl ApplicationState for RejectingLedger {
        fn check_block(&self, _block: &Block) -> anyhow::Result<()> {
            Ok(())
        }

        fn process_block(&self, block: &Block) -> anyhow::Result<()> {
            if Some(block.id()) == self.reject {
                anyhow::bail!("insufficient funds");
            }
            Ok(())
        }

        fn commit(&self, block_id: &BlockHash) -> anyhow::Result<()> {
            self.committed.lock().unwrap().push(*block_id);
            Ok(())
        }

        fn update_chain(&self, new_head: &Block) -> anyhow::Result<()> {
            self.rewinds.lock().unwrap().push(new_head.id());
            Ok(())
        }
    }

    #[test]
    fn ledger_rejection_keeps_old_head() {
        let a1 = child(&genesis(), 0, Vec::new());
        let b1 = child(&genesis(), 1, Vec::new());
        let b2 = child(&b1, 0, Vec::new());
        let ledger = Arc::new(RejectingLedger {
            reject: Some(b2.id()),
            ..Default::default()
        });
        let now = Arc::new(AtomicU64::new(NOW));
        let chain = open(
            ChainConfig::default(),
            Arc::new(MemoryStore::new()),
            ledger.clone(),
            genesis(),
            &now,
        )
        .unwrap();

        chain.process_block(a1.clone()).unwrap();
        chain.process_block(b1.clone()).unwrap();
        let err = chain.process_block(b2.clone()).unwrap_err();
        assert!(matches!(err, ChainError::Ledger { hash, .. } if hash == b2.id()));

        assert_eq!(chain.best_block(), a1);
        assert_eq!(chain.block_by_height(1).unwrap(), Some(a1.clone()));
        assert!(!chain.has_block(&b2.id()).unwrap());
        // Rewound to the fork point, then restored
        assert_eq!(*ledger.rewinds.lock().unwrap(), vec![genesis().id(), a1.id()]);
        assert_eq!(*ledger.committed.lock().unwrap(), vec![a1.id()]);
        assert_eq!(chain.bad_blocks()[0].block, b2);
    }

    #[test]
    fn set_head_rewinds_chain() {
        let h = harness();
        let b1 = child(&genesis(), 0, vec![tx(1)]);
        let b2 = child(&b1, 0, vec![tx(2)]);
        let b3 = child(&b2, 0, vec![tx(3)]);
        h.chain.insert_chain(vec![b1.clone(), b2.clone(), b3.clone()]).1.unwrap();
        let mut head_rx = h.chain.subscribe_chain_head();

        assert!(matches!(
            h.chain.set_head(4).unwrap_err(),
            ChainError::InvalidRewind { target: 4, head: 3 }
        ));

        h.chain.set_head(1).unwrap();
        assert_eq!(h.chain.best_block(), b1);
        assert_eq!(head_rx.try_recv().unwrap().id, b1.id());
        assert_eq!(h.chain.block_by_height(2).unwrap(), None);
        assert!(!h.chain.has_block(&b3.id()).unwrap());
        assert_eq!(h.chain.transaction_lookup(&tx(2).id()).unwrap(), None);
        assert!(h.chain.transaction_lookup(&tx(1).id()).unwrap().is_some());
        assert_eq!(h.store.count(Namespace::CanonicalHash), 2);

        // Chain grows again from the rewound head
        assert_eq!(h.chain.process_block(b2).unwrap(), ProcessOutcome::Canonical);
    }

    #[test]
    fn insert_chain_reports_progress() {
        let h = harness();
        let b1 = child(&genesis(), 0, Vec::new());
        let bad = seal(BlockBuilder::child_of(&b1).height(5), 5);
        let b2 = child(&b1, 0, Vec::new());

        let (done, result) = h.chain.insert_chain(vec![b1.clone(), bad, b2]);
        assert_eq!(done, 1);
        assert!(result.is_err());
        assert_eq!(h.chain.best_block(), b1);
    }

    #[test]
    fn different_genesis_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let now = Arc::new(AtomicU64::new(NOW));
        let ledger = Arc::new(PassthroughState::new());
        open(ChainConfig::default(), store.clone(), ledger.clone(), genesis(), &now).unwrap();

        let other = Block::genesis(GENESIS_TIME, b"other".to_vec());
        let err = open(ChainConfig::default(), store, ledger, other, &now).err().unwrap();
        assert!(matches!(err, ChainError::GenesisMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_head_resets_to_genesis() {
        let h = harness();
        let b1 = child(&genesis(), 0, Vec::new());
        h.chain.process_block(b1).unwrap();

        let mut batch = WriteBatch::new();
        batch.delete(Namespace::HeadBlock, b"LastBlock".to_vec());
        h.store.write(batch).unwrap();

        let reopened = open(
            ChainConfig::default(),
            h.store.clone(),
            Arc::new(PassthroughState::new()),
            genesis(),
            &h.now,
        )
        .unwrap();
        assert_eq!(reopened.best_block(), genesis());
        assert_eq!(reopened.block_by_height(1).unwrap(), None);
    }

    #[test]
    fn store_failure_is_fatal() {
        let h = harness();
        h.store.set_read_only(true);
        let err = h.chain.process_block(child(&genesis(), 0, Vec::new())).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn chain_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config::Config::builder()
            .set_override("database-path", dir.path().to_str().unwrap())
            .unwrap()
            .build()
            .unwrap();
        let now = Arc::new(AtomicU64::new(NOW));
        let b1 = child(&genesis(), 0, vec![tx(1)]);
        let b2 = child(&b1, 0, Vec::new());

        {
            let store = Arc::new(FjallStore::new(&config).unwrap());
            let chain =
                open(ChainConfig::default(), store, Arc::new(PassthroughState::new()), genesis(), &now)
                    .unwrap();
            chain.insert_chain(vec![b1.clone(), b2.clone()]).1.unwrap();
            chain.stop();
        }

        let store = Arc::new(FjallStore::new(&config).unwrap());
        let chain =
            open(ChainConfig::default(), store, Arc::new(PassthroughState::new()), genesis(), &now).unwrap();
        assert_eq!(chain.best_block(), b2);
        assert_eq!(chain.block_by_height(1).unwrap(), Some(b1.clone()));
        assert_eq!(
            chain.transaction_lookup(&tx(1).id()).unwrap().map(|e| e.block_id),
            Some(b1.id())
        );
    }
}
