use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::Arc,
};

use rand::Rng;
use stoa_common::{Block, BlockHash, BlockHeight, PeerId};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{BlockRequester, FetcherBackend, FetcherConfig, FetcherStatus};

/// A peer told us it has a block
pub(crate) struct Announcement {
    pub peer: PeerId,
    pub hash: BlockHash,
    pub height: BlockHeight,
    pub time: Instant,
    pub retrieve: BlockRequester,
}

/// A block waiting in the import queue
struct QueuedBlock {
    origin: PeerId,
    block: Block,
    fetched: bool,
}

pub(crate) struct FilterRequest {
    pub peer: PeerId,
    pub blocks: Vec<Block>,
    pub reply: oneshot::Sender<Vec<Block>>,
}

pub(crate) struct FetchLoop {
    config: FetcherConfig,
    backend: Arc<dyn FetcherBackend>,

    notify_rx: mpsc::Receiver<Announcement>,
    inject_rx: mpsc::Receiver<(PeerId, Block)>,
    filter_rx: mpsc::Receiver<FilterRequest>,
    status_rx: mpsc::Receiver<oneshot::Sender<FetcherStatus>>,
    done_tx: mpsc::UnboundedSender<BlockHash>,
    done_rx: mpsc::UnboundedReceiver<BlockHash>,
    quit: watch::Receiver<bool>,

    // Announcements waiting for the gather delay, in arrival order per hash
    announced: HashMap<BlockHash, Vec<Announcement>>,
    // Outstanding announcements per peer
    announces: HashMap<PeerId, usize>,
    // Chosen announcement with the time we asked for the block
    fetching: HashMap<BlockHash, (Announcement, Instant)>,
    // Delivered, now queued or importing
    completing: HashMap<BlockHash, Announcement>,

    queued: HashMap<BlockHash, QueuedBlock>,
    // Queued blocks per peer
    queues: HashMap<PeerId, usize>,
    queue: BinaryHeap<Reverse<(BlockHeight, BlockHash)>>,
}

pub(crate) struct Channels {
    pub notify_rx: mpsc::Receiver<Announcement>,
    pub inject_rx: mpsc::Receiver<(PeerId, Block)>,
    pub filter_rx: mpsc::Receiver<FilterRequest>,
    pub status_rx: mpsc::Receiver<oneshot::Sender<FetcherStatus>>,
    pub quit: watch::Receiver<bool>,
}

impl FetchLoop {
    pub fn new(config: FetcherConfig, backend: Arc<dyn FetcherBackend>, channels: Channels) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            config,
            backend,
            notify_rx: channels.notify_rx,
            inject_rx: channels.inject_rx,
            filter_rx: channels.filter_rx,
            status_rx: channels.status_rx,
            done_tx,
            done_rx,
            quit: channels.quit,
            announced: HashMap::new(),
            announces: HashMap::new(),
            fetching: HashMap::new(),
            completing: HashMap::new(),
            queued: HashMap::new(),
            queues: HashMap::new(),
            queue: BinaryHeap::new(),
        }
    }

    pub async fn run(mut self) {
        info!("Block fetcher started");
        loop {
            self.import_ready();

            let deadline = self.next_deadline();
            tokio::select! {
                _ = self.quit.changed() => break,
                Some(announcement) = self.notify_rx.recv() => self.on_announcement(announcement),
                Some((peer, block)) = self.inject_rx.recv() => {
                    self.enqueue(peer, block, false);
                }
                Some(request) = self.filter_rx.recv() => self.on_filter(request),
                Some(reply) = self.status_rx.recv() => {
                    let _ = reply.send(self.status());
                }
                Some(hash) = self.done_rx.recv() => {
                    self.forget_hash(&hash);
                    self.forget_block(&hash);
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_timers();
                }
            }
        }
        info!("Block fetcher stopped");
    }

    pub fn status(&self) -> FetcherStatus {
        FetcherStatus {
            announced: self.announced.len(),
            fetching: self.fetching.len(),
            completing: self.completing.len(),
            queued: self.queued.len(),
        }
    }

    /// Earliest moment a timer needs servicing
    fn next_deadline(&self) -> Option<Instant> {
        let gather = self
            .announced
            .values()
            .filter_map(|announces| announces.first())
            .map(|first| first.time + self.config.gather_delay())
            .min();
        let expiry = self
            .fetching
            .values()
            .map(|(_, requested)| *requested + self.config.fetch_timeout())
            .min();
        match (gather, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// True if a block at `height` is too far from our head to bother with
    fn out_of_range(&self, height: BlockHeight) -> bool {
        let chain = self.backend.chain_height();
        height < chain.saturating_sub(self.config.max_uncle_dist)
            || height > chain.saturating_add(self.config.max_queue_dist)
    }

    fn on_announcement(&mut self, announcement: Announcement) {
        let peer = announcement.peer;
        let hash = announcement.hash;

        let count = self.announces.get(&peer).copied().unwrap_or(0);
        if count >= self.config.hash_limit {
            debug!(%peer, %hash, limit = self.config.hash_limit, "Peer exceeded outstanding announces");
            return;
        }
        if announcement.height > 0 && self.out_of_range(announcement.height) {
            debug!(%peer, %hash, height = announcement.height, "Discarded announcement out of range");
            return;
        }
        if self.fetching.contains_key(&hash)
            || self.completing.contains_key(&hash)
            || self.queued.contains_key(&hash)
        {
            trace!(%peer, %hash, "Ignored announcement for block already in progress");
            return;
        }

        *self.announces.entry(peer).or_default() += 1;
        self.announced.entry(hash).or_default().push(announcement);
    }

    fn on_timers(&mut self) {
        let now = Instant::now();

        let ready: Vec<BlockHash> = self
            .announced
            .iter()
            .filter(|(_, announces)| {
                announces.first().is_some_and(|first| now >= first.time + self.config.gather_delay())
            })
            .map(|(hash, _)| *hash)
            .collect();

        for hash in ready {
            let Some(mut announces) = self.announced.remove(&hash) else {
                continue;
            };
            let chosen = announces.swap_remove(rand::rng().random_range(0..announces.len()));
            for other in &announces {
                self.release_announce(other.peer);
            }

            debug!(peer = %chosen.peer, %hash, "Fetching block");
            self.spawn_retrieve(hash, chosen.retrieve.clone());
            self.fetching.insert(hash, (chosen, now));
        }

        let expired: Vec<BlockHash> = self
            .fetching
            .iter()
            .filter(|(_, (_, requested))| now >= *requested + self.config.fetch_timeout())
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            debug!(%hash, "Block fetch timed out");
            self.forget_hash(&hash);
        }
    }

    fn on_filter(&mut self, request: FilterRequest) {
        let FilterRequest {
            peer,
            blocks,
            reply,
        } = request;

        let mut unknown = Vec::new();
        for block in blocks {
            let hash = block.id();
            let matches = self.fetching.get(&hash).is_some_and(|(announce, _)| announce.peer == peer);
            if !matches {
                unknown.push(block);
                continue;
            }
            let Some((announce, _)) = self.fetching.remove(&hash) else {
                continue;
            };
            if announce.height != block.height() {
                warn!(
                    %peer, %hash,
                    announced = announce.height,
                    delivered = block.height(),
                    "Peer delivered block at wrong height"
                );
                self.release_announce(announce.peer);
                self.backend.drop_peer(peer);
                continue;
            }
            self.completing.insert(hash, announce);
            if !self.enqueue(peer, block, true) {
                self.forget_hash(&hash);
            }
        }
        let _ = reply.send(unknown);
    }

    /// Queue a block for import. Returns false if it was discarded.
    fn enqueue(&mut self, origin: PeerId, block: Block, fetched: bool) -> bool {
        let hash = block.id();

        let count = self.queues.get(&origin).copied().unwrap_or(0);
        if count >= self.config.block_limit {
            debug!(peer = %origin, %hash, limit = self.config.block_limit, "Peer exceeded queued blocks");
            return false;
        }
        if self.out_of_range(block.height()) {
            debug!(peer = %origin, %hash, height = block.height(), "Discarded block out of range");
            return false;
        }
        if self.queued.contains_key(&hash) {
            return true;
        }

        *self.queues.entry(origin).or_default() += 1;
        self.queue.push(Reverse((block.height(), hash)));
        self.queued.insert(
            hash,
            QueuedBlock {
                origin,
                block,
                fetched,
            },
        );
        trace!(peer = %origin, %hash, queued = self.queued.len(), "Queued block");
        true
    }

    /// Pop every queued block that can attach to our head
    fn import_ready(&mut self) {
        let chain = self.backend.chain_height();
        while let Some(Reverse((height, hash))) = self.queue.peek().copied() {
            if height > chain.saturating_add(1) {
                break;
            }
            self.queue.pop();

            if height < chain.saturating_sub(self.config.max_uncle_dist) {
                self.forget_hash(&hash);
                self.forget_block(&hash);
                continue;
            }
            let Some(queued) = self.queued.get(&hash) else {
                continue;
            };
            self.spawn_import(queued.origin, queued.block.clone(), queued.fetched);
        }
    }

    /// Ask for a block unless we already hold it, in which case the hash is
    /// reported done
    fn spawn_retrieve(&self, hash: BlockHash, retrieve: BlockRequester) {
        let backend = self.backend.clone();
        let done = self.done_tx.clone();
        tokio::task::spawn_blocking(move || {
            if backend.get_block(&hash).is_some() {
                trace!(%hash, "Block already known, not fetching");
                let _ = done.send(hash);
                return;
            }
            if let Err(error) = retrieve(hash) {
                warn!("could not request block {hash}: {error:#}");
            }
        });
    }

    fn spawn_import(&self, origin: PeerId, block: Block, fetched: bool) {
        let backend = self.backend.clone();
        let done = self.done_tx.clone();
        tokio::task::spawn_blocking(move || {
            let hash = block.id();
            import_block(backend.as_ref(), origin, block, fetched);
            let _ = done.send(hash);
        });
    }

    fn release_announce(&mut self, peer: PeerId) {
        if let Some(count) = self.announces.get_mut(&peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.announces.remove(&peer);
            }
        }
    }

    /// Drop every trace of an announced hash
    fn forget_hash(&mut self, hash: &BlockHash) {
        if let Some(announces) = self.announced.remove(hash) {
            for announce in announces {
                self.release_announce(announce.peer);
            }
        }
        if let Some((announce, _)) = self.fetching.remove(hash) {
            self.release_announce(announce.peer);
        }
        if let Some(announce) = self.completing.remove(hash) {
            self.release_announce(announce.peer);
        }
    }

    /// Drop a queued block
    fn forget_block(&mut self, hash: &BlockHash) {
        if let Some(queued) = self.queued.remove(hash) {
            if let Some(count) = self.queues.get_mut(&queued.origin) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.queues.remove(&queued.origin);
                }
            }
        }
    }
}

/// Verify and import a single block, then relay it
fn import_block(backend: &dyn FetcherBackend, origin: PeerId, block: Block, fetched: bool) {
    let hash = block.id();

    if backend.get_block(&hash).is_some() {
        trace!(peer = %origin, %hash, "Queued block already imported");
        return;
    }
    if backend.get_block(&block.parent_id()).is_none() {
        debug!(peer = %origin, %hash, parent = %block.parent_id(), "Unknown parent of queued block");
        return;
    }
    if let Err(error) = backend.verify_block(&block) {
        warn!(peer = %origin, %hash, "Queued block failed verification: {error:#}");
        backend.drop_peer(origin);
        return;
    }
    match backend.insert_block(block.clone()) {
        Ok(()) => {
            debug!(peer = %origin, %hash, height = block.height(), "Imported block");
            backend.broadcast_block(&block, !fetched);
        }
        Err(error) => warn!(peer = %origin, %hash, "Block import failed: {error:#}"),
    }
}
