//! Wallet scan engine.
//!
//! Each subchain cycles through its phases independently, one worker job
//! at a time:
//!
//! - index: turn keys the key source added since the last run into watched
//!   elements.
//! - process: match blocks that earlier scans queued and record the
//!   transactions paying to or spending from the wallet.
//! - scan: test the filters after the last scanned block against the
//!   watched set and queue the blocks that match.
//!
//! Reorgs are applied between jobs: the engine waits until no subchain has a
//! job outstanding, rolls every subchain back and clears the block queues.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bitcoin::{Block, BlockHash};
use tracing::{debug, error, info, trace, warn};

use crate::{
    actor::{Actor, Context},
    block_cache::BlockLoader,
    config::{Config, RESCAN_DEPTH, SCAN_WINDOW},
    events::{Event, EventBus},
    headers::HeaderOracle,
    hooks::KeySource,
    pending::Pending,
    store::{FilterStore, WalletStore},
    types::{FilterType, Position},
};

pub mod element;
pub mod scan;

pub use element::{ConfirmedTx, ElementId, ElementKind, Subchain, Utxo, WatchedElement};
pub use scan::{match_block, scan_filters, Patterns, ScanHit, ScanOutcome};

/// Keys turned into elements by one index job.
const INDEX_BATCH: u32 = 1_000;

/// Mailbox of the wallet scan engine.
#[derive(Debug)]
pub enum WalletMessage {
    /// New filters, headers or keys may be available.
    Wake,
    /// The best chain switched branches above this ancestor.
    Reorg(Position),
    /// Elements derived by a worker.
    Indexed {
        /// Subchain the keys belong to.
        subchain: Subchain,
        /// Derived elements.
        elements: Vec<WatchedElement>,
        /// Highest key index covered.
        last_index: u32,
    },
    /// Filters of one window tested by a worker.
    Scanned {
        /// Scanned subchain.
        subchain: Subchain,
        /// Hits, or why matching failed.
        outcome: Result<ScanOutcome, String>,
    },
    /// A block matched by a worker.
    Processed {
        /// Owning subchain.
        subchain: Subchain,
        /// Matched block.
        position: Position,
        /// Elements tested against the block.
        tested: Vec<ElementId>,
        /// Wallet transactions found in it.
        transactions: Vec<ConfirmedTx>,
    },
}

#[derive(Debug)]
struct QueuedBlock {
    position: Position,
    block: Pending<Arc<Block>>,
    since: Instant,
}

#[derive(Debug, Default)]
struct SubchainState {
    busy: bool,
    queue: VecDeque<QueuedBlock>,
    queued: HashSet<BlockHash>,
}

/// The wallet scan actor.
pub struct WalletScan<W, K, F, H, L> {
    filter_type: FilterType,
    birth_height: u32,
    block_timeout: Duration,
    store: Arc<W>,
    keys: Arc<K>,
    filters: Arc<F>,
    headers: Arc<H>,
    blocks: L,
    events: EventBus,
    subchains: HashMap<Subchain, SubchainState>,
    reorgs: VecDeque<Position>,
}

impl<W, K, F, H, L> WalletScan<W, K, F, H, L>
where
    W: WalletStore + 'static,
    K: KeySource + 'static,
    F: FilterStore + 'static,
    H: HeaderOracle + 'static,
    L: BlockLoader + 'static,
{
    /// Engine scanning `config.filter_type` filters for the keys of `keys`.
    pub fn new(
        config: &Config,
        store: Arc<W>,
        keys: Arc<K>,
        filters: Arc<F>,
        headers: Arc<H>,
        blocks: L,
        events: EventBus,
    ) -> Self {
        Self {
            filter_type: config.filter_type,
            birth_height: config.birth_height,
            block_timeout: config.timeouts.block,
            store,
            keys,
            filters,
            headers,
            blocks,
            events,
            subchains: Subchain::ALL
                .into_iter()
                .map(|s| (s, SubchainState::default()))
                .collect(),
            reorgs: VecDeque::new(),
        }
    }

    fn state(&mut self, subchain: Subchain) -> &mut SubchainState {
        self.subchains.entry(subchain).or_default()
    }

    fn any_busy(&self) -> bool {
        self.subchains.values().any(|s| s.busy)
    }

    /// Queue `position` for processing once its block arrives.
    fn enqueue(&mut self, subchain: Subchain, position: Position, front: bool) {
        let state = self.subchains.entry(subchain).or_default();
        if !front && !state.queued.insert(position.hash) {
            return;
        }
        let entry = QueuedBlock {
            position,
            block: self.blocks.load(position.hash),
            since: Instant::now(),
        };
        if front {
            state.queue.push_front(entry);
        } else {
            debug!(%subchain, %position, "block queued");
            state.queue.push_back(entry);
        }
    }

    async fn apply_reorgs(&mut self) -> anyhow::Result<()> {
        while let Some(ancestor) = self.reorgs.front().copied() {
            for subchain in Subchain::ALL {
                let mut point = ancestor;
                if let Some(last) = self.store.last_scanned(subchain).await? {
                    if !self.headers.is_in_best_chain(&last.hash).await? {
                        point = point.min(self.headers.calculate_reorg(&last).await?);
                    }
                }
                self.store.rollback(subchain, &point).await?;
                let state = self.state(subchain);
                state.queue.clear();
                state.queued.clear();
                let balance = self.store.balance(subchain).await?;
                self.events.publish(Event::BalanceChanged { subchain, balance });
            }
            info!(%ancestor, "wallet rolled back");
            self.reorgs.pop_front();
        }
        Ok(())
    }

    /// Returns whether a job was dispatched.
    async fn index(&mut self, subchain: Subchain, ctx: &Context<WalletMessage>) -> anyhow::Result<bool> {
        let count = self.keys.key_count(subchain).await?;
        let next = self.store.indexed(subchain).await?.map_or(0, |i| i + 1);
        if next >= count {
            return Ok(false);
        }
        let last_index = count.min(next.saturating_add(INDEX_BATCH)) - 1;
        let mut keys = Vec::with_capacity((last_index - next + 1) as usize);
        for index in next..=last_index {
            keys.push((index, self.keys.public_key(subchain, index).await?));
        }
        debug!(%subchain, next, last_index, "indexing keys");
        self.state(subchain).busy = true;
        ctx.dispatch(
            move || {
                keys.into_iter()
                    .flat_map(|(index, key)| WatchedElement::derive(subchain, index, key))
                    .collect()
            },
            move |elements| WalletMessage::Indexed {
                subchain,
                elements,
                last_index,
            },
        );
        Ok(true)
    }

    /// Returns whether a job was dispatched.
    async fn process(
        &mut self,
        subchain: Subchain,
        ctx: &Context<WalletMessage>,
    ) -> anyhow::Result<bool> {
        let timeout = self.block_timeout;
        let state = self.subchains.entry(subchain).or_default();
        let Some(head) = state.queue.front() else {
            return Ok(false);
        };
        let position = head.position;
        let Some(block) = head.block.try_get() else {
            if head.block.is_abandoned() || head.since.elapsed() >= timeout {
                warn!(%subchain, %position, "block did not arrive, asking again");
                state.queue.pop_front();
                self.enqueue(subchain, position, true);
            }
            return Ok(false);
        };

        // The block leaves the queue only once its inputs are loaded.
        let elements = self.store.untested(subchain, &position.hash).await?;
        let unspent = self.store.unspent(subchain).await?;
        let state = self.state(subchain);
        state.queue.pop_front();
        state.busy = true;
        ctx.dispatch(
            move || {
                let transactions = match_block(position, &block, &elements, &unspent);
                let tested = elements.iter().map(WatchedElement::id).collect();
                (tested, transactions)
            },
            move |(tested, transactions)| WalletMessage::Processed {
                subchain,
                position,
                tested,
                transactions,
            },
        );
        Ok(true)
    }

    /// Returns whether a job was dispatched, or a rollback is now queued
    /// because the scan position left the best chain.
    async fn scan(&mut self, subchain: Subchain, ctx: &Context<WalletMessage>) -> anyhow::Result<bool> {
        let last = self.store.last_scanned(subchain).await?;
        if let Some(last) = last {
            if !self.headers.is_in_best_chain(&last.hash).await? {
                let ancestor = self.headers.calculate_reorg(&last).await?;
                if !self.reorgs.contains(&ancestor) {
                    warn!(%subchain, %last, %ancestor, "scan position left the best chain");
                    self.reorgs.push_back(ancestor);
                }
                return Ok(true);
            }
        }
        let ty = self.filter_type;
        let Some(filter_tip) = self.filters.filter_tip(ty).await? else {
            return Ok(false);
        };
        let best = self.headers.best_chain().await?;
        let start = match last {
            Some(last) => last.height + 1,
            None => self.birth_height.max(1),
        };
        let stop = start
            .saturating_add(SCAN_WINDOW - 1)
            .min(best.height)
            .min(filter_tip.height);
        if start > stop {
            return Ok(false);
        }

        let mut filters = Vec::new();
        for height in start..=stop {
            let Some(hash) = self.headers.best_hash(height).await? else {
                break;
            };
            let Some(filter) = self.filters.load_filter(ty, &hash).await? else {
                trace!(%subchain, height, "filter missing, scan stops early");
                break;
            };
            filters.push((Position::new(height, hash), filter));
        }
        if filters.is_empty() {
            return Ok(false);
        }

        let elements = self.store.elements(subchain).await?;
        let unspent = self.store.unspent(subchain).await?;
        let patterns = Patterns::new(ty, &elements, &unspent);
        debug!(%subchain, start, count = filters.len(), "scanning filters");
        self.state(subchain).busy = true;
        ctx.dispatch(
            move || scan_filters(&patterns, &filters).map_err(|e| e.to_string()),
            move |outcome| WalletMessage::Scanned { subchain, outcome },
        );
        Ok(true)
    }

    /// Returns whether the subchain has unfinished work.
    async fn step(&mut self, subchain: Subchain, ctx: &Context<WalletMessage>) -> anyhow::Result<bool> {
        if self.state(subchain).busy {
            return Ok(true);
        }
        if self.index(subchain, ctx).await?
            || self.process(subchain, ctx).await?
            || self.scan(subchain, ctx).await?
        {
            return Ok(true);
        }
        Ok(!self.state(subchain).queue.is_empty())
    }

    async fn on_indexed(
        &mut self,
        subchain: Subchain,
        elements: Vec<WatchedElement>,
        last_index: u32,
    ) -> anyhow::Result<()> {
        let count = elements.len();
        self.store.add_elements(subchain, elements, last_index).await?;
        if self.store.last_scanned(subchain).await?.is_some() {
            self.store.set_last_scanned(subchain, None).await?;
        }
        info!(%subchain, count, last_index, "watched elements added");
        Ok(())
    }

    async fn on_scanned(&mut self, subchain: Subchain, outcome: ScanOutcome) -> anyhow::Result<()> {
        for hit in outcome.hits {
            let untested: HashSet<ElementId> = self
                .store
                .untested(subchain, &hit.position.hash)
                .await?
                .iter()
                .map(WatchedElement::id)
                .collect();
            if hit.spends || hit.elements.iter().any(|id| untested.contains(id)) {
                self.enqueue(subchain, hit.position, false);
            } else {
                trace!(%subchain, position = %hit.position, "match already tested");
            }
        }
        if let Some(position) = outcome.tested_to {
            self.store.set_last_scanned(subchain, Some(position)).await?;
            self.events.publish(Event::ScanProgress { subchain, position });
        }
        Ok(())
    }

    async fn on_processed(
        &mut self,
        subchain: Subchain,
        position: Position,
        tested: Vec<ElementId>,
        transactions: Vec<ConfirmedTx>,
    ) -> anyhow::Result<()> {
        let found = transactions.len();
        if found > 0 {
            self.store
                .add_confirmed(subchain, position, transactions)
                .await?;
        }
        self.store.set_tested(subchain, position, &tested).await?;
        self.state(subchain).queued.remove(&position.hash);
        if found == 0 {
            trace!(%subchain, %position, "false positive");
            return Ok(());
        }

        let target = position.height.saturating_sub(RESCAN_DEPTH);
        let rewind = self
            .store
            .last_scanned(subchain)
            .await?
            .is_some_and(|last| last.height > target);
        if rewind {
            let back = self
                .headers
                .best_hash(target)
                .await?
                .map(|hash| Position::new(target, hash));
            self.store.set_last_scanned(subchain, back).await?;
        }
        let balance = self.store.balance(subchain).await?;
        info!(%subchain, %position, found, %balance, "wallet transactions confirmed");
        self.events.publish(Event::BalanceChanged { subchain, balance });
        Ok(())
    }
}

#[async_trait]
impl<W, K, F, H, L> Actor for WalletScan<W, K, F, H, L>
where
    W: WalletStore + 'static,
    K: KeySource + 'static,
    F: FilterStore + 'static,
    H: HeaderOracle + 'static,
    L: BlockLoader + 'static,
{
    type Message = WalletMessage;
    const NAME: &'static str = "wallet-scan";

    async fn started(&mut self, ctx: &Context<WalletMessage>) {
        ctx.trigger();
    }

    async fn handle(&mut self, message: WalletMessage, ctx: &Context<WalletMessage>) {
        match message {
            WalletMessage::Wake => {}
            WalletMessage::Reorg(ancestor) => {
                debug!(%ancestor, "reorg queued");
                self.reorgs.push_back(ancestor);
            }
            WalletMessage::Indexed {
                subchain,
                elements,
                last_index,
            } => {
                self.state(subchain).busy = false;
                if let Err(e) = self.on_indexed(subchain, elements, last_index).await {
                    error!(%subchain, "storing watched elements failed: {e:#}");
                }
            }
            WalletMessage::Scanned { subchain, outcome } => {
                self.state(subchain).busy = false;
                match outcome {
                    Ok(outcome) => {
                        if let Err(e) = self.on_scanned(subchain, outcome).await {
                            error!(%subchain, "recording scan failed: {e:#}");
                        }
                    }
                    Err(reason) => warn!(%subchain, "filter matching failed: {reason}"),
                }
            }
            WalletMessage::Processed {
                subchain,
                position,
                tested,
                transactions,
            } => {
                self.state(subchain).busy = false;
                if let Err(e) = self
                    .on_processed(subchain, position, tested, transactions)
                    .await
                {
                    error!(%subchain, %position, "recording block failed: {e:#}");
                    self.state(subchain).queued.remove(&position.hash);
                    self.enqueue(subchain, position, true);
                }
            }
        }
        ctx.trigger();
    }

    async fn tick(&mut self, ctx: &Context<WalletMessage>) -> bool {
        if ctx.is_stopping() {
            return false;
        }
        if !self.reorgs.is_empty() {
            if self.any_busy() {
                return true;
            }
            if let Err(e) = self.apply_reorgs().await {
                error!("wallet rollback failed: {e:#}");
                return true;
            }
        }
        let mut more = false;
        for subchain in Subchain::ALL {
            match self.step(subchain, ctx).await {
                Ok(unfinished) => more |= unfinished,
                Err(e) => {
                    error!(%subchain, "wallet scan: {e:#}");
                    more = true;
                }
            }
        }
        more
    }
}
