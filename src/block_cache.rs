//! On-demand block fetch with memoization.
//!
//! `load` hands out a [`Pending`] immediately; the first request for a hash
//! asks the peer pool for the block, and every waiter is resolved when the
//! block is submitted back. Resolved blocks are kept in a bounded
//! least-recently-inserted cache.
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bitcoin::{Block, BlockHash};
use tracing::{debug, trace, warn};

use crate::{
    actor::{Actor, Context, Mailbox},
    config::Config,
    filter_source::BlockSource,
    pending::{pending, Pending, Resolver},
};

/// Mailbox of the block cache.
#[derive(Debug)]
pub enum BlockCacheMessage {
    /// Register waiters for blocks.
    Load(Vec<(BlockHash, Resolver<Arc<Block>>)>),
    /// A block arrived from a peer.
    Submit(Block),
    /// A peer finished its handshake; retry held-back requests.
    PeerConnected,
}

/// Something that can hand out pending blocks.
pub trait BlockLoader: Send + Sync {
    /// A handle resolved once `hash` is available.
    fn load(&self, hash: BlockHash) -> Pending<Arc<Block>>;

    /// Handles for several blocks, in order.
    fn load_many(&self, hashes: &[BlockHash]) -> Vec<Pending<Arc<Block>>> {
        hashes.iter().map(|hash| self.load(*hash)).collect()
    }
}

/// Cloneable front end of the block cache actor.
#[derive(Debug, Clone)]
pub struct BlockCacheHandle {
    mailbox: Mailbox<BlockCacheMessage>,
}

impl BlockCacheHandle {
    /// Handle around the cache's mailbox.
    pub fn new(mailbox: Mailbox<BlockCacheMessage>) -> Self {
        Self { mailbox }
    }

    /// Push a block into the cache.
    pub fn submit(&self, block: Block) -> bool {
        self.mailbox.send(BlockCacheMessage::Submit(block)).is_ok()
    }
}

impl BlockLoader for BlockCacheHandle {
    fn load(&self, hash: BlockHash) -> Pending<Arc<Block>> {
        let (resolver, handle) = pending();
        // A refused message drops the resolver, which abandons the handle.
        let _ = self
            .mailbox
            .send(BlockCacheMessage::Load(vec![(hash, resolver)]));
        handle
    }

    fn load_many(&self, hashes: &[BlockHash]) -> Vec<Pending<Arc<Block>>> {
        let (requests, handles): (Vec<_>, Vec<_>) = hashes
            .iter()
            .map(|hash| {
                let (resolver, handle) = pending();
                ((*hash, resolver), handle)
            })
            .unzip();
        let _ = self.mailbox.send(BlockCacheMessage::Load(requests));
        handles
    }
}

#[derive(Debug)]
struct Waiting {
    resolvers: Vec<Resolver<Arc<Block>>>,
    requested: Option<Instant>,
}

/// The block cache actor.
pub struct BlockCache<B> {
    source: B,
    capacity: usize,
    timeout: Duration,
    cache: HashMap<BlockHash, Arc<Block>>,
    order: VecDeque<BlockHash>,
    waiting: HashMap<BlockHash, Waiting>,
    arrived: Vec<Block>,
    offline_since: Option<Instant>,
}

impl<B: BlockSource + 'static> BlockCache<B> {
    /// Cache fetching through `source`.
    pub fn new(config: &Config, source: B) -> Self {
        Self {
            source,
            capacity: config.block_cache_capacity,
            timeout: config.timeouts.block,
            cache: HashMap::new(),
            order: VecDeque::new(),
            waiting: HashMap::new(),
            arrived: Vec::new(),
            offline_since: None,
        }
    }

    fn remember(&mut self, hash: BlockHash, block: Arc<Block>) {
        if self.cache.insert(hash, block).is_none() {
            self.order.push_back(hash);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.cache.remove(&evicted);
            }
        }
    }

    fn flush(&mut self) {
        for block in std::mem::take(&mut self.arrived) {
            let hash = block.block_hash();
            let Some(waiting) = self.waiting.remove(&hash) else {
                trace!(%hash, "unrequested block ignored");
                continue;
            };
            let block = Arc::new(block);
            for resolver in waiting.resolvers {
                resolver.resolve(block.clone());
            }
            debug!(%hash, "block delivered");
            self.remember(hash, block);
        }
    }

    /// Ask peers for every waited-on block that is unrequested or overdue.
    /// Returns whether blocks are still outstanding.
    ///
    /// Once the pool has no peer to ask, nothing is requested until a peer
    /// connects or a block timeout has passed.
    fn request_missing(&mut self) -> bool {
        self.waiting.retain(|hash, w| {
            w.resolvers.retain(Resolver::is_wanted);
            if w.resolvers.is_empty() {
                trace!(%hash, "no waiters left");
            }
            !w.resolvers.is_empty()
        });
        let now = Instant::now();
        let timeout = self.timeout;
        if self
            .offline_since
            .is_some_and(|at| now.duration_since(at) < timeout)
        {
            return false;
        }
        self.offline_since = None;
        for (hash, waiting) in self.waiting.iter_mut() {
            let due = waiting
                .requested
                .map_or(true, |at| now.duration_since(at) >= timeout);
            if !due {
                continue;
            }
            if waiting.requested.is_some() {
                debug!(%hash, "block request timed out, asking again");
            }
            if self.source.request_block(*hash) {
                waiting.requested = Some(now);
            } else {
                debug!(%hash, "no peer for block requests, waiting for a connection");
                waiting.requested = None;
                self.offline_since = Some(now);
                return false;
            }
        }
        !self.waiting.is_empty()
    }
}

#[async_trait]
impl<B: BlockSource + 'static> Actor for BlockCache<B> {
    type Message = BlockCacheMessage;
    const NAME: &'static str = "block-cache";

    async fn handle(&mut self, message: BlockCacheMessage, ctx: &Context<BlockCacheMessage>) {
        match message {
            BlockCacheMessage::Load(requests) => {
                let mut fetch = false;
                for (hash, resolver) in requests {
                    if let Some(block) = self.cache.get(&hash) {
                        resolver.resolve(block.clone());
                        continue;
                    }
                    let waiting = self.waiting.entry(hash).or_insert_with(|| Waiting {
                        resolvers: Vec::new(),
                        requested: None,
                    });
                    waiting.resolvers.push(resolver);
                    fetch |= waiting.requested.is_none();
                }
                if fetch {
                    ctx.trigger();
                }
            }
            BlockCacheMessage::Submit(block) => {
                if !block.check_merkle_root() {
                    warn!(hash = %block.block_hash(), "block with bad merkle root dropped");
                    return;
                }
                self.arrived.push(block);
                ctx.trigger();
            }
            BlockCacheMessage::PeerConnected => {
                if self.offline_since.take().is_some() {
                    ctx.trigger();
                }
            }
        }
    }

    async fn tick(&mut self, _ctx: &Context<BlockCacheMessage>) -> bool {
        self.flush();
        self.request_missing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{actor, actor::Settings, workers::WorkerPool};
    use bitcoin::{constants::genesis_block, Network};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    /// Records every block request; fails them while `offline` is set.
    #[derive(Clone, Default)]
    struct Requests {
        calls: Arc<Mutex<Vec<BlockHash>>>,
        offline: Arc<AtomicBool>,
    }

    impl Requests {
        fn calls(&self) -> Vec<BlockHash> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl BlockSource for Requests {
        fn request_block(&self, hash: BlockHash) -> bool {
            self.calls.lock().unwrap().push(hash);
            !self.offline.load(Ordering::SeqCst)
        }
    }

    fn settings() -> Settings {
        Settings {
            interval: Duration::from_millis(5),
            drain: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn fetches_once_and_resolves_every_waiter() -> anyhow::Result<()> {
        let requests = Requests::default();
        let (mailbox, inbox) = actor::channel("block-cache");
        let cache = BlockCacheHandle::new(mailbox.clone());
        let handle = actor::spawn(
            BlockCache::new(&Config::for_network(Network::Regtest), requests.clone()),
            inbox,
            WorkerPool::new(1),
            settings(),
        );

        let block = genesis_block(Network::Regtest);
        let hash = block.block_hash();
        let waiters = cache.load_many(&[hash, hash]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requests.calls(), vec![hash]);

        assert!(cache.submit(block.clone()));
        for waiter in waiters {
            assert_eq!(waiter.wait().await?.block_hash(), hash);
        }

        // Memoized: no second request.
        let again = cache.load(hash).wait().await?;
        assert_eq!(again.block_hash(), hash);
        assert_eq!(requests.calls().len(), 1);

        handle.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn drops_blocks_with_bad_merkle_root() -> anyhow::Result<()> {
        let requests = Requests::default();
        let (mailbox, inbox) = actor::channel("block-cache");
        let cache = BlockCacheHandle::new(mailbox);
        let handle = actor::spawn(
            BlockCache::new(&Config::for_network(Network::Regtest), requests),
            inbox,
            WorkerPool::new(1),
            settings(),
        );

        let mut block = genesis_block(Network::Regtest);
        block.txdata.clear();
        let waiter = cache.load(block.block_hash());
        cache.submit(block);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_ready());

        handle.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn holds_requests_until_a_peer_connects() -> anyhow::Result<()> {
        let requests = Requests::default();
        requests.offline.store(true, Ordering::SeqCst);
        let (mailbox, inbox) = actor::channel("block-cache");
        let cache = BlockCacheHandle::new(mailbox.clone());
        let handle = actor::spawn(
            BlockCache::new(&Config::for_network(Network::Regtest), requests.clone()),
            inbox,
            WorkerPool::new(1),
            settings(),
        );

        let block = genesis_block(Network::Regtest);
        let hash = block.block_hash();
        let waiter = cache.load(hash);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requests.calls(), vec![hash]);

        requests.offline.store(false, Ordering::SeqCst);
        assert!(mailbox.send(BlockCacheMessage::PeerConnected).is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requests.calls(), vec![hash, hash]);

        assert!(cache.submit(block));
        assert_eq!(waiter.wait().await?.block_hash(), hash);
        handle.shutdown().await;
        Ok(())
    }
}
