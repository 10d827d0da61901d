//! Wiring of the actors into one running light client.
//!
//! [`Node::start`] creates every mailbox first so routes can point at actors
//! that are not running yet, forwards the relevant events, spawns the peer
//! pool, filter sync engine and block cache, then kicks the pool. A wallet
//! scan engine can be attached later with [`Node::add_wallet`].
use std::sync::Arc;

use bitcoin::{Block, BlockHash, Transaction};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    actor::{self, ActorHandle, Settings},
    block_cache::{BlockCache, BlockCacheHandle, BlockCacheMessage, BlockLoader},
    config::Config,
    error::{Error, NetworkError},
    events::{Event, EventBus},
    filters::{FilterSync, FilterSyncMessage},
    headers::HeaderOracle,
    hooks::KeySource,
    peer::{InprocHub, PeerAddress},
    pending::Pending,
    pool::{PeerPool, PeerPoolHandle, PoolMessage, Routes},
    store::{FilterStore, PeerStore, WalletStore},
    types::Position,
    wallet::{WalletMessage, WalletScan},
    workers::WorkerPool,
};

/// A running light client.
pub struct Node<S, H> {
    config: Config,
    workers: WorkerPool,
    events: EventBus,
    hub: InprocHub,
    filters: Arc<S>,
    headers: Arc<H>,
    peers: PeerPoolHandle,
    blocks: BlockCacheHandle,
    pool: ActorHandle<PoolMessage>,
    filter_sync: ActorHandle<FilterSyncMessage>,
    block_cache: ActorHandle<BlockCacheMessage>,
    wallet: Option<ActorHandle<WalletMessage>>,
}

impl<S, H> Node<S, H>
where
    S: FilterStore + 'static,
    H: HeaderOracle + 'static,
{
    /// Validate `config` and start the peer pool, filter sync engine and
    /// block cache. Must be called inside a tokio runtime.
    pub fn start<P>(
        config: Config,
        filters: Arc<S>,
        headers: Arc<H>,
        peer_store: Arc<P>,
        hub: InprocHub,
    ) -> Result<Self, Error>
    where
        P: PeerStore + 'static,
    {
        config.validate()?;
        let workers = WorkerPool::new(config.worker_threads);
        let events = EventBus::new();

        let (pool_mailbox, pool_inbox) = actor::channel("peer-pool");
        let (sync_mailbox, sync_inbox) = actor::channel("filter-sync");
        let (cache_mailbox, cache_inbox) = actor::channel("block-cache");
        let blocks = BlockCacheHandle::new(cache_mailbox.clone());

        let routes = Routes {
            filter_sync: Some(sync_mailbox.clone()),
            block_cache: Some(blocks.clone()),
        };
        let pool = PeerPool::new(
            &config,
            peer_store,
            headers.clone(),
            events.clone(),
            hub.clone(),
            routes,
        );
        let peers = pool.client(pool_mailbox);
        let sync = FilterSync::new(
            &config,
            filters.clone(),
            headers.clone(),
            peers.clone(),
            events.clone(),
        );
        let cache = BlockCache::new(&config, peers.clone());

        events.forward(sync_mailbox, |event| match event {
            Event::ChainUpdated { .. } => Some(FilterSyncMessage::ChainUpdated),
            Event::PeerConnected { .. } => Some(FilterSyncMessage::PeerConnected),
            Event::Reorg { ancestor } => Some(FilterSyncMessage::Reorg(ancestor)),
            _ => None,
        });
        events.forward(cache_mailbox, |event| {
            matches!(event, Event::PeerConnected { .. }).then_some(BlockCacheMessage::PeerConnected)
        });

        let drain = config.timeouts.shutdown;
        let settings = |interval| Settings { interval, drain };
        let pool = actor::spawn(pool, pool_inbox, workers.clone(), settings(config.intervals.pool));
        let filter_sync = actor::spawn(
            sync,
            sync_inbox,
            workers.clone(),
            settings(config.intervals.filters),
        );
        let block_cache = actor::spawn(
            cache,
            cache_inbox,
            workers.clone(),
            settings(config.intervals.block_cache),
        );
        info!(network = %config.network, filter_type = %config.filter_type, "node started");
        peers.connect();

        Ok(Self {
            config,
            workers,
            events,
            hub,
            filters,
            headers,
            peers,
            blocks,
            pool,
            filter_sync,
            block_cache,
            wallet: None,
        })
    }

    /// Start scanning for the keys of `keys`, recording into `store`.
    /// Fails if a wallet is already attached.
    pub fn add_wallet<W, K>(&mut self, store: Arc<W>, keys: Arc<K>) -> Result<(), Error>
    where
        W: WalletStore + 'static,
        K: KeySource + 'static,
    {
        if self.wallet.is_some() {
            return Err(Error::Collaborator(anyhow::anyhow!("a wallet is already attached")));
        }
        let (mailbox, inbox) = actor::channel("wallet-scan");
        let scan = WalletScan::new(
            &self.config,
            store,
            keys,
            self.filters.clone(),
            self.headers.clone(),
            self.blocks.clone(),
            self.events.clone(),
        );
        let filter_type = self.config.filter_type;
        self.events.forward(mailbox, move |event| match event {
            Event::NewFilter { filter_type: ty, .. } if ty == filter_type => {
                Some(WalletMessage::Wake)
            }
            Event::ChainUpdated { .. } => Some(WalletMessage::Wake),
            Event::Reorg { ancestor } => Some(WalletMessage::Reorg(ancestor)),
            _ => None,
        });
        self.wallet = Some(actor::spawn(
            scan,
            inbox,
            self.workers.clone(),
            Settings {
                interval: self.config.intervals.wallet,
                drain: self.config.timeouts.shutdown,
            },
        ));
        Ok(())
    }

    /// Tell the wallet engine new keys may be available.
    pub fn wake_wallet(&self) -> bool {
        self.wallet
            .as_ref()
            .is_some_and(|w| w.mailbox().send(WalletMessage::Wake).is_ok())
    }

    /// Subscribe to state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// The event bus shared by every actor.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handle on the peer pool.
    pub fn peers(&self) -> &PeerPoolHandle {
        &self.peers
    }

    /// In-process transport registry used for inproc peers.
    pub fn hub(&self) -> &InprocHub {
        &self.hub
    }

    /// Configuration the node runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect to `address`, waiting (bounded) for the handshake.
    pub async fn add_peer(&self, address: PeerAddress) -> bool {
        self.peers.add_peer(address).await
    }

    /// Accept inbound peers on `address`.
    pub async fn listen(&self, address: PeerAddress) -> bool {
        self.peers.listen(address).await
    }

    /// Relay `tx` to every connected peer.
    pub fn broadcast_transaction(&self, tx: Transaction) -> Result<(), Error> {
        if self.peers.broadcast_transaction(tx) {
            Ok(())
        } else {
            Err(NetworkError::NotConnected.into())
        }
    }

    /// A handle resolved once block `hash` was downloaded.
    pub fn load_block(&self, hash: BlockHash) -> Pending<Arc<Block>> {
        self.blocks.load(hash)
    }

    /// Build and store the filters of a block this node produced itself.
    pub fn process_block(&self, position: Position, block: Pending<Arc<Block>>) -> bool {
        self.filter_sync
            .mailbox()
            .send(FilterSyncMessage::ProcessBlock(position, block))
            .is_ok()
    }

    /// Stop every actor: wallet first, the peer pool last.
    pub async fn shutdown(self) {
        info!("node shutting down");
        if let Some(wallet) = self.wallet {
            wallet.shutdown().await;
        }
        self.filter_sync.shutdown().await;
        self.block_cache.shutdown().await;
        self.pool.shutdown().await;
        info!("node stopped");
    }
}
