//! Stoa chain engine module for Caryatid
//! Keeps the canonical chain of a permissioned authority network, fed by
//! locally produced blocks and by blocks fetched from peers

mod backend;
pub mod blockchain;
pub mod chain_error;
mod configuration;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use caryatid_sdk::{module, Context};
use config::Config;
use stoa_common::ledger::PassthroughState;
use stoa_common::messages::{ChainEvent, ChainMessage, Message, NetworkMessage};
use stoa_common::{Block, PeerId};
use stoa_module_authority::{AuthorityEngine, ConsensusKind};
use stoa_module_block_fetcher::{BlockRequester, Fetcher, FetcherConfig};
use stoa_module_chain_store::open_store;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::ChainBackend;
pub use crate::blockchain::{BadBlock, Blockchain, ProcessOutcome};
pub use crate::chain_error::ChainError;
pub use crate::configuration::ChainConfig;

const DEFAULT_BLOCK_PRODUCED_TOPIC: &str = "stoa.block.produced";
const DEFAULT_NETWORK_INBOUND_TOPIC: &str = "stoa.network.inbound";
const DEFAULT_NETWORK_OUTBOUND_TOPIC: &str = "stoa.network.outbound";
const DEFAULT_CHAIN_EXTENDED_TOPIC: &str = "stoa.chain.extended";
const DEFAULT_CHAIN_HEAD_TOPIC: &str = "stoa.chain.head";
const DEFAULT_CHAIN_SIDE_TOPIC: &str = "stoa.chain.side";

const DEFAULT_GENESIS_TIMESTAMP: i64 = 0;

/// Chain engine module
/// Parameterised by the outer message enum used on the bus
#[module(
    message_type(Message),
    name = "chain-engine",
    description = "Authority chain engine and block fetcher"
)]
pub struct ChainEngine;

/// Log and stop the node on an error the chain cannot recover from
fn exit_if_fatal(error: &ChainError) {
    if error.is_fatal() {
        error!("Chain engine failed: {error}");
        std::process::exit(1);
    }
}

/// The configured genesis block
fn genesis_block(config: &Config) -> Block {
    let timestamp = config.get_int("genesis-timestamp").unwrap_or(DEFAULT_GENESIS_TIMESTAMP) as u64;
    let extra = config.get_string("genesis-extra").unwrap_or_default();
    Block::genesis(timestamp, extra.into_bytes())
}

/// The authority set, in rotation order
fn authority_engine(config: &Config) -> Result<AuthorityEngine> {
    let kind = config.get::<ConsensusKind>("consensus").unwrap_or_default();
    let keys = config.get::<Vec<String>>("authorities").unwrap_or_default();
    let engine = AuthorityEngine::from_hex_keys(kind, &keys)?;
    for (index, key) in engine.authorities().iter().enumerate() {
        info!("Authority {index}: {key}");
    }
    Ok(engine)
}

impl ChainEngine {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        // Get configuration
        let produced_topic = config
            .get_string("block-produced-topic")
            .unwrap_or(DEFAULT_BLOCK_PRODUCED_TOPIC.to_string());
        info!("Creating produced block subscriber on '{produced_topic}'");

        let inbound_topic = config
            .get_string("network-inbound-topic")
            .unwrap_or(DEFAULT_NETWORK_INBOUND_TOPIC.to_string());
        info!("Creating network subscriber on '{inbound_topic}'");

        let outbound_topic = config
            .get_string("network-outbound-topic")
            .unwrap_or(DEFAULT_NETWORK_OUTBOUND_TOPIC.to_string());
        info!("Publishing network requests on '{outbound_topic}'");

        let extended_topic = config
            .get_string("chain-extended-topic")
            .unwrap_or(DEFAULT_CHAIN_EXTENDED_TOPIC.to_string());
        let head_topic =
            config.get_string("chain-head-topic").unwrap_or(DEFAULT_CHAIN_HEAD_TOPIC.to_string());
        let side_topic =
            config.get_string("chain-side-topic").unwrap_or(DEFAULT_CHAIN_SIDE_TOPIC.to_string());
        info!("Publishing chain events on '{extended_topic}', '{head_topic}' and '{side_topic}'");

        let chain_config = ChainConfig::try_load(&config)?;
        let fetcher_config = FetcherConfig::try_load(&config)?;
        let authority = authority_engine(&config)?;
        let store = open_store(&config)?;
        let chain = Blockchain::new(
            chain_config,
            store,
            authority,
            Arc::new(PassthroughState::new()),
            genesis_block(&config),
        )?;

        let ticker = chain.spawn_future_ticker();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<NetworkMessage>();
        let backend = Arc::new(ChainBackend::new(chain.clone(), outbound_tx.clone()));
        let (fetcher, _) = Fetcher::start(fetcher_config, backend);

        let mut produced_subscription = context.subscribe(&produced_topic).await?;
        let mut inbound_subscription = context.subscribe(&inbound_topic).await?;

        // Requests, relays and peer drops out to the transport
        let publish_context = context.clone();
        context.clone().run(async move {
            while let Some(message) = outbound_rx.recv().await {
                publish_context
                    .message_bus
                    .publish(&outbound_topic, Arc::new(Message::Network(message)))
                    .await
                    .unwrap_or_else(|e| error!("Failed to publish: {e}"));
            }
        });

        // Chain events out to the bus
        let feeds: [(broadcast::Receiver<ChainEvent>, String, fn(ChainEvent) -> ChainMessage); 3] = [
            (chain.subscribe_chain(), extended_topic, ChainMessage::Extended),
            (chain.subscribe_chain_head(), head_topic, ChainMessage::HeadChanged),
            (chain.subscribe_chain_side(), side_topic, ChainMessage::Side),
        ];
        for (mut feed, topic, wrap) in feeds {
            let publish_context = context.clone();
            context.clone().run(async move {
                loop {
                    match feed.recv().await {
                        Ok(event) => publish_context
                            .message_bus
                            .publish(&topic, Arc::new(Message::Chain(wrap(event))))
                            .await
                            .unwrap_or_else(|e| error!("Failed to publish: {e}")),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Chain event publisher on '{topic}' missed {missed} events")
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
        }

        context.clone().run(async move {
            match ticker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => exit_if_fatal(&e),
                Err(e) => error!("Future block ticker failed: {e}"),
            }
        });

        // Locally produced blocks
        let produced_chain = chain.clone();
        context.clone().run(async move {
            loop {
                let Ok((_, message)) = produced_subscription.read().await else {
                    error!("Produced block read failed");
                    return;
                };
                let Message::Chain(ChainMessage::BlockProduced(produced)) = message.as_ref() else {
                    error!("Unexpected message type: {message:?}");
                    continue;
                };

                let chain = produced_chain.clone();
                let block = produced.block.clone();
                let hash = block.id();
                match tokio::task::spawn_blocking(move || chain.process_block(block)).await {
                    Ok(Ok(outcome)) => debug!(%hash, ?outcome, "Processed produced block"),
                    Ok(Err(e)) => {
                        exit_if_fatal(&e);
                        warn!(%hash, "Produced block rejected: {e}");
                    }
                    Err(e) => error!("Produced block task failed: {e}"),
                }
            }
        });

        // Announcements and blocks from peers
        context.run(async move {
            loop {
                let Ok((_, message)) = inbound_subscription.read().await else {
                    error!("Network message read failed");
                    return;
                };
                let Message::Network(message) = message.as_ref() else {
                    error!("Unexpected message type: {message:?}");
                    continue;
                };

                let result = match message {
                    NetworkMessage::BlockAnnounced { peer, hash, height } => {
                        let requester = block_requester(*peer, outbound_tx.clone());
                        fetcher.notify(*peer, *hash, *height, Instant::now(), requester).await
                    }
                    NetworkMessage::BlockPushed { peer, block } => {
                        fetcher.enqueue(*peer, block.clone()).await
                    }
                    NetworkMessage::BlocksDelivered { peer, blocks } => {
                        deliver(&fetcher, *peer, blocks.clone()).await
                    }
                    // Our own outbound traffic
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    error!("Block fetcher unavailable: {e}");
                    return;
                }
            }
        });

        Ok(())
    }
}

/// Requests a block from one peer over the outbound topic
fn block_requester(peer: PeerId, outbound: mpsc::UnboundedSender<NetworkMessage>) -> BlockRequester {
    Arc::new(move |hash| {
        outbound
            .send(NetworkMessage::BlockRequest { peer, hash })
            .map_err(|_| anyhow!("network outbound channel closed"))
    })
}

/// Hand delivered blocks to the fetcher; anything it did not ask for is
/// queued as if pushed
async fn deliver(fetcher: &Fetcher, peer: PeerId, blocks: Vec<Block>) -> Result<()> {
    let unrequested = fetcher.filter_blocks(peer, blocks).await;
    for block in unrequested {
        fetcher.enqueue(peer, block).await?;
    }
    Ok(())
}
