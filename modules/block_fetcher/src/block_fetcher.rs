//! Stoa block fetcher
//! Collects block announcements and pushed blocks from peers, retrieves the
//! announced blocks from one announcer each and imports them in height order

mod configuration;
mod fetch_loop;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use stoa_common::{Block, BlockHash, BlockHeight, PeerId};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};

pub use crate::configuration::FetcherConfig;
use crate::fetch_loop::{Announcement, Channels, FetchLoop, FilterRequest};

/// Asks the announcing peer for a block. Called from a spawned task.
pub type BlockRequester = Arc<dyn Fn(BlockHash) -> Result<()> + Send + Sync>;

/// What the fetcher needs from the rest of the node
pub trait FetcherBackend: Send + Sync + 'static {
    /// A block we already hold
    fn get_block(&self, hash: &BlockHash) -> Option<Block>;

    /// Header checks run before import; failure evicts the sending peer
    fn verify_block(&self, block: &Block) -> Result<()>;

    /// Relay a block to peers, in full or as an announcement
    fn broadcast_block(&self, block: &Block, propagate_full: bool);

    /// Height of the current head
    fn chain_height(&self) -> BlockHeight;

    fn insert_block(&self, block: Block) -> Result<()>;

    fn drop_peer(&self, peer: PeerId);
}

/// Sizes of the fetcher's bookkeeping maps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetcherStatus {
    pub announced: usize,
    pub fetching: usize,
    pub completing: usize,
    pub queued: usize,
}

/// Handle to a running fetcher loop
#[derive(Clone)]
pub struct Fetcher {
    notify_tx: mpsc::Sender<Announcement>,
    inject_tx: mpsc::Sender<(PeerId, Block)>,
    filter_tx: mpsc::Sender<FilterRequest>,
    status_tx: mpsc::Sender<oneshot::Sender<FetcherStatus>>,
    quit_tx: Arc<watch::Sender<bool>>,
}

impl Fetcher {
    /// Spawn the fetcher loop
    pub fn start(config: FetcherConfig, backend: Arc<dyn FetcherBackend>) -> (Self, JoinHandle<()>) {
        let capacity = config.channel_capacity.max(1);
        let (notify_tx, notify_rx) = mpsc::channel(capacity);
        let (inject_tx, inject_rx) = mpsc::channel(capacity);
        let (filter_tx, filter_rx) = mpsc::channel(capacity);
        let (status_tx, status_rx) = mpsc::channel(capacity);
        let (quit_tx, quit) = watch::channel(false);

        let fetch_loop = FetchLoop::new(
            config,
            backend,
            Channels {
                notify_rx,
                inject_rx,
                filter_rx,
                status_rx,
                quit,
            },
        );
        let handle = tokio::spawn(fetch_loop.run());

        (
            Self {
                notify_tx,
                inject_tx,
                filter_tx,
                status_tx,
                quit_tx: Arc::new(quit_tx),
            },
            handle,
        )
    }

    /// A peer announced it has a block
    pub async fn notify(
        &self,
        peer: PeerId,
        hash: BlockHash,
        height: BlockHeight,
        time: Instant,
        retrieve: BlockRequester,
    ) -> Result<()> {
        self.notify_tx
            .send(Announcement {
                peer,
                hash,
                height,
                time,
                retrieve,
            })
            .await
            .map_err(|_| anyhow!("block fetcher stopped"))
    }

    /// A peer pushed a full block
    pub async fn enqueue(&self, peer: PeerId, block: Block) -> Result<()> {
        self.inject_tx.send((peer, block)).await.map_err(|_| anyhow!("block fetcher stopped"))
    }

    /// Claim the blocks we fetched from `peer`; the rest are handed back
    pub async fn filter_blocks(&self, peer: PeerId, blocks: Vec<Block>) -> Vec<Block> {
        let (reply, response) = oneshot::channel();
        let request = FilterRequest {
            peer,
            blocks,
            reply,
        };
        if let Err(mpsc::error::SendError(request)) = self.filter_tx.send(request).await {
            return request.blocks;
        }
        response.await.unwrap_or_default()
    }

    /// Snapshot of the bookkeeping, or None once stopped
    pub async fn status(&self) -> Option<FetcherStatus> {
        let (reply, response) = oneshot::channel();
        self.status_tx.send(reply).await.ok()?;
        response.await.ok()
    }

    /// Ask the loop to exit; in-flight imports still complete
    pub fn stop(&self) {
        let _ = self.quit_tx.send(true);
    }
}
