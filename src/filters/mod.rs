//! Filter sync engine.
//!
//! Keeps the filter-header chain and the filter-content chain of each
//! filter type level with the best block-header chain. Every tick:
//!
//! 1. `check_headers`: request the next window of filter headers (at most
//!    one request in flight, expiring after a timeout).
//! 2. `check_filters`: request the next window of filters, never beyond the
//!    filter-header tip (at most one window in flight).
//! 3. Drain the block queue of locally computed filters.
//!
//! Responses arrive as mailbox messages; every batch is validated against
//! the stored chains before any tip moves.
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{
    bip158::{BlockFilter, FilterHash, FilterHeader},
    hashes::Hash,
    Block, BlockHash, OutPoint, ScriptBuf,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    actor::{Actor, Context},
    cfheaders::{expected_previous, genesis_previous, link_batch, verify_previous},
    config::{Config, MAX_FILTERS_PER_REQUEST, MAX_FILTER_HEADERS_PER_REQUEST},
    error::{Error, SyncError},
    events::{Event, EventBus},
    filter_source::{FilterHeadersBatch, FilterSource, ReceivedFilter},
    headers::HeaderOracle,
    matcher::{block_outputs, build_filter},
    pending::Pending,
    store::{FilterHeaderEntry, FilterStore},
    types::{FilterType, Position},
};

pub mod block_queue;
pub mod queue;

pub use block_queue::BlockQueue;
pub use queue::{FilterQueue, RequestQueue};

/// Mailbox of the filter sync engine.
#[derive(Debug)]
pub enum FilterSyncMessage {
    /// A validated `cfheaders` batch.
    FilterHeaders(FilterHeadersBatch),
    /// A validated `cfilter`.
    Filter(ReceivedFilter),
    /// The best block-header chain moved.
    ChainUpdated,
    /// A peer became available for requests.
    PeerConnected,
    /// The best chain switched branches above this ancestor.
    Reorg(Position),
    /// Compute the filter of a block once it is available.
    ProcessBlock(Position, Pending<Arc<Block>>),
    /// A locally computed filter (worker result).
    Computed(ComputedFilter),
    /// Local filter computation failed (worker result).
    ComputeFailed(Position, String),
}

/// A filter computed from a full block.
#[derive(Debug, Clone)]
pub struct ComputedFilter {
    /// Filter type.
    pub filter_type: FilterType,
    /// Block position.
    pub position: Position,
    /// Parent of the block.
    pub previous_block: BlockHash,
    /// Filter content.
    pub filter: BlockFilter,
    /// Hash of the content.
    pub filter_hash: FilterHash,
    /// Filter header chained onto the parent's.
    pub header: FilterHeader,
    /// Outputs the block created, for later spends.
    pub outputs: Vec<(OutPoint, ScriptBuf)>,
}

/// Build the filter of `block` and chain it onto `previous`.
pub fn compute_filter(
    filter_type: FilterType,
    position: Position,
    block: &Block,
    prevouts: &std::collections::HashMap<OutPoint, ScriptBuf>,
    previous: FilterHeader,
) -> Result<ComputedFilter, bitcoin::io::Error> {
    let filter = build_filter(filter_type, block, prevouts)?;
    let filter_hash = FilterHash::hash(&filter.content);
    Ok(ComputedFilter {
        filter_type,
        position,
        previous_block: block.header.prev_blockhash,
        header: filter_hash.filter_header(&previous),
        filter_hash,
        filter,
        outputs: block_outputs(block),
    })
}

/// The filter sync actor.
pub struct FilterSync<S, H, P> {
    filter_type: FilterType,
    store: Arc<S>,
    headers: Arc<H>,
    peers: P,
    events: EventBus,
    requests: RequestQueue,
    window: FilterQueue,
    blocks: BlockQueue,
}

impl<S, H, P> FilterSync<S, H, P>
where
    S: FilterStore + 'static,
    H: HeaderOracle + 'static,
    P: FilterSource + 'static,
{
    /// Engine syncing `config.filter_type` from `peers`.
    pub fn new(config: &Config, store: Arc<S>, headers: Arc<H>, peers: P, events: EventBus) -> Self {
        Self {
            filter_type: config.filter_type,
            store,
            headers,
            peers,
            events,
            requests: RequestQueue::new(config.timeouts.filter_headers),
            window: FilterQueue::new(config.timeouts.filters),
            blocks: BlockQueue::new(),
        }
    }

    /// Common ancestor of `tip` and the best chain, plus the best tip.
    /// Rolls a stale stored tip back to the ancestor.
    async fn sync_point(
        &self,
        tip: Option<Position>,
        headers_chain: bool,
    ) -> anyhow::Result<(Option<Position>, Position)> {
        let Some(tip) = tip else {
            return Ok((None, self.headers.best_chain().await?));
        };
        let (ancestor, best) = self.headers.common_parent(&tip).await?;
        if ancestor != tip {
            debug!(%tip, %ancestor, headers_chain, "stored tip left the best chain");
            if headers_chain {
                self.store
                    .set_filter_header_tip(self.filter_type, ancestor)
                    .await?;
            } else {
                self.store.set_filter_tip(self.filter_type, ancestor).await?;
            }
        }
        Ok((Some(ancestor), best))
    }

    /// Returns whether header sync is unfinished and still progressing.
    async fn check_headers(&mut self) -> anyhow::Result<bool> {
        let ty = self.filter_type;
        let tip = self.store.filter_header_tip(ty).await?;
        let (ancestor, best) = self.sync_point(tip, true).await?;
        if ancestor == Some(best) {
            return Ok(false);
        }
        if self.requests.is_running() {
            return Ok(true);
        }

        let start = ancestor.map_or(0, |a| a.height + 1);
        let stop_height = (start + MAX_FILTER_HEADERS_PER_REQUEST - 1).min(best.height);
        let Some(stop_hash) = self.headers.best_hash(stop_height).await? else {
            return Ok(true);
        };
        if !self.peers.request_filter_headers(ty, start, stop_hash) {
            debug!(%ty, start, "no peer for filter headers");
            return Ok(false);
        }
        debug!(%ty, start, stop_height, "requested filter headers");
        self.requests.start(stop_hash);
        Ok(true)
    }

    /// Returns whether content sync is unfinished and still progressing.
    async fn check_filters(&mut self) -> anyhow::Result<bool> {
        let ty = self.filter_type;
        let tip = self.store.filter_tip(ty).await?;
        let (ancestor, best) = self.sync_point(tip, false).await?;
        if ancestor == Some(best) {
            return Ok(false);
        }
        if self.window.is_running() {
            return Ok(true);
        }

        let Some(header_tip) = self.store.filter_header_tip(ty).await? else {
            return Ok(false);
        };
        let (header_limit, _) = self.headers.common_parent(&header_tip).await?;
        let start = ancestor.map_or(0, |a| a.height + 1);
        if start > header_limit.height {
            trace!(%ty, start, "filters wait for filter headers");
            return Ok(false);
        }
        let stop_height = (start + MAX_FILTERS_PER_REQUEST - 1)
            .min(best.height)
            .min(header_limit.height);
        let Some(stop_hash) = self.headers.best_hash(stop_height).await? else {
            return Ok(true);
        };
        let hashes = self.collect_window(start, stop_hash).await?;
        self.window.start(start, hashes);
        if !self.peers.request_filters(ty, start, stop_hash) {
            debug!(%ty, start, "no peer for filters");
            self.window.reset();
            return Ok(false);
        }
        debug!(%ty, start, stop_height, "requested filters");
        Ok(true)
    }

    /// Hashes from `start` to `stop`, ascending, walking back from `stop`.
    async fn collect_window(&self, start: u32, stop: BlockHash) -> anyhow::Result<Vec<BlockHash>> {
        let mut hashes = Vec::new();
        let mut cursor = stop;
        loop {
            let info = self
                .headers
                .load_header(&cursor)
                .await?
                .ok_or(SyncError::UnknownBlock(cursor))?;
            hashes.push(cursor);
            if info.height <= start {
                break;
            }
            cursor = info.header.prev_blockhash;
        }
        hashes.reverse();
        Ok(hashes)
    }

    async fn accept_filter_headers(
        &mut self,
        batch: FilterHeadersBatch,
    ) -> Result<Option<Position>, Error> {
        let ty = batch.filter_type;
        let stop = self
            .headers
            .load_header(&batch.stop_hash)
            .await?
            .ok_or(SyncError::UnknownBlock(batch.stop_hash))?;
        if !self.headers.is_in_best_chain(&batch.stop_hash).await? {
            return Err(SyncError::NotInBestChain(batch.stop_hash).into());
        }
        let count = batch.filter_hashes.len();
        if count as u64 > stop.height as u64 + 1 {
            return Err(SyncError::BatchUnderflow {
                count,
                stop: stop.height,
            }
            .into());
        }
        let start = stop.height + 1 - count as u32;

        if let Some(tip) = self.store.filter_header_tip(ty).await? {
            if tip.height >= stop.height && self.headers.is_in_best_chain(&tip.hash).await? {
                return Ok(None);
            }
        }

        let stored = match start.checked_sub(1) {
            Some(height) => match self.headers.best_hash(height).await? {
                Some(hash) => self.store.load_filter_header(ty, &hash).await?,
                None => None,
            },
            None => None,
        };
        let expected = expected_previous(start, stored)
            .ok_or(SyncError::MissingPreviousHeader(ty, start))?;
        verify_previous(start, &batch.previous, &expected)?;

        let mut entries = Vec::with_capacity(count);
        for link in link_batch(start, batch.previous, &batch.filter_hashes) {
            let block = self
                .headers
                .best_hash(link.height)
                .await?
                .ok_or(SyncError::NotInBestChain(batch.stop_hash))?;
            entries.push(FilterHeaderEntry {
                block,
                header: link.header,
                filter_hash: link.filter_hash,
            });
        }
        let tip = stop.position();
        self.store
            .store_filter_headers(ty, &entries, Some(tip))
            .await?;
        Ok(Some(tip))
    }

    async fn accept_filter(&mut self, received: ReceivedFilter) -> Result<Option<Position>, Error> {
        let ty = received.filter_type;
        let hash = received.block_hash;
        let info = self
            .headers
            .load_header(&hash)
            .await?
            .ok_or(SyncError::UnknownBlock(hash))?;
        if ty != self.filter_type || !self.window.contains(info.height, &hash) {
            return Err(SyncError::Unrequested(hash).into());
        }
        let committed = self
            .store
            .load_filter_hash(ty, &hash)
            .await?
            .ok_or(SyncError::MissingFilterHeader(hash))?;
        if FilterHash::hash(&received.filter.content) != committed {
            return Err(SyncError::FilterHashMismatch(hash).into());
        }
        if !self.window.insert(info.height, hash, received.filter)? {
            trace!(%hash, "duplicate filter");
            return Ok(None);
        }
        let Some(stop) = self.window.stop_position() else {
            return Ok(None);
        };
        let Some(filters) = self.window.take() else {
            return Ok(None);
        };
        self.store.store_filters(ty, &filters, Some(stop)).await?;
        Ok(Some(stop))
    }

    async fn on_reorg(&mut self, ancestor: Position) -> anyhow::Result<()> {
        self.requests.reset();
        self.window.reset();
        self.blocks.reorg(&ancestor);
        for ty in FilterType::ALL {
            if let Some(tip) = self.store.filter_header_tip(ty).await? {
                if tip.height >= ancestor.height && tip != ancestor {
                    self.store.set_filter_header_tip(ty, ancestor).await?;
                }
            }
            if let Some(tip) = self.store.filter_tip(ty).await? {
                if tip.height >= ancestor.height && tip != ancestor {
                    self.store.set_filter_tip(ty, ancestor).await?;
                }
            }
        }
        info!(%ancestor, "filter tips rolled back");
        Ok(())
    }

    async fn drain_blocks(&mut self, ctx: &Context<FilterSyncMessage>) -> anyhow::Result<()> {
        if self.blocks.is_busy() {
            return Ok(());
        }
        let Some((position, block)) = self.blocks.next_ready() else {
            return Ok(());
        };
        let ty = self.filter_type;
        let parent = block.header.prev_blockhash;
        let previous = match self.blocks.cached_previous(&position, &parent) {
            Some(header) => Some(header),
            None if position.height == 0 => Some(genesis_previous()),
            None => self.store.load_filter_header(ty, &parent).await?,
        };
        let Some(previous) = previous else {
            trace!(%position, "parent filter header not known yet");
            self.blocks.push_front(position, Pending::ready(block));
            return Ok(());
        };
        let prevouts = self.blocks.prevouts_for(&block);
        self.blocks.begin(position);
        ctx.dispatch(
            move || compute_filter(ty, position, &block, &prevouts, previous),
            move |result| match result {
                Ok(computed) => FilterSyncMessage::Computed(computed),
                Err(e) => FilterSyncMessage::ComputeFailed(position, e.to_string()),
            },
        );
        Ok(())
    }

    async fn store_computed(&mut self, computed: ComputedFilter) -> anyhow::Result<()> {
        let ty = computed.filter_type;
        let position = computed.position;
        if let Some(known) = self.store.load_filter_header(ty, &position.hash).await? {
            if known != computed.header {
                warn!(%position, "computed filter header disagrees with stored chain");
                self.blocks.abort();
                return Ok(());
            }
        }
        let extends = |tip: Option<Position>| {
            tip.map_or(position.height == 0, |t| {
                t.hash == computed.previous_block && t.height + 1 == position.height
            })
        };
        let header_tip = extends(self.store.filter_header_tip(ty).await?).then_some(position);
        let filter_tip = extends(self.store.filter_tip(ty).await?).then_some(position);
        let entry = FilterHeaderEntry {
            block: position.hash,
            header: computed.header,
            filter_hash: computed.filter_hash,
        };
        self.store
            .store_filters_with_headers(
                ty,
                &[entry],
                &[(position.hash, computed.filter)],
                header_tip,
                filter_tip,
            )
            .await?;
        self.blocks.complete(position, computed.header, computed.outputs);
        if header_tip.is_some() {
            self.events.publish(Event::NewFilterHeader {
                filter_type: ty,
                position,
            });
        }
        if filter_tip.is_some() {
            self.events.publish(Event::NewFilter {
                filter_type: ty,
                position,
            });
        }
        debug!(%ty, %position, "stored computed filter");
        Ok(())
    }

    fn report(&self, what: &str, err: Error) {
        match err {
            Error::Sync(SyncError::Unrequested(hash)) => trace!(%hash, "{what}: unrequested"),
            Error::Sync(e) => warn!("{what} rejected: {e}"),
            Error::Decode(e) => warn!("{what} rejected: {e}"),
            other => error!("{what} failed: {other}"),
        }
    }
}

#[async_trait]
impl<S, H, P> Actor for FilterSync<S, H, P>
where
    S: FilterStore + 'static,
    H: HeaderOracle + 'static,
    P: FilterSource + 'static,
{
    type Message = FilterSyncMessage;
    const NAME: &'static str = "filter-sync";

    async fn started(&mut self, ctx: &Context<FilterSyncMessage>) {
        ctx.trigger();
    }

    async fn handle(&mut self, message: FilterSyncMessage, ctx: &Context<FilterSyncMessage>) {
        match message {
            FilterSyncMessage::FilterHeaders(batch) => {
                let ty = batch.filter_type;
                let stop = batch.stop_hash;
                match self.accept_filter_headers(batch).await {
                    Ok(Some(position)) => {
                        info!(%ty, %position, "filter headers advanced");
                        self.events.publish(Event::NewFilterHeader {
                            filter_type: ty,
                            position,
                        });
                    }
                    Ok(None) => trace!(%ty, %stop, "filter headers already stored"),
                    Err(e) => self.report("filter headers", e),
                }
                self.requests.finish(&stop);
                ctx.trigger();
            }
            FilterSyncMessage::Filter(filter) => match self.accept_filter(filter).await {
                Ok(Some(position)) => {
                    info!(ty = %self.filter_type, %position, "filters advanced");
                    self.events.publish(Event::NewFilter {
                        filter_type: self.filter_type,
                        position,
                    });
                    ctx.trigger();
                }
                Ok(None) => {}
                Err(e @ Error::Collaborator(_)) => {
                    self.window.reset();
                    self.report("filter", e);
                    ctx.trigger();
                }
                Err(e) => self.report("filter", e),
            },
            FilterSyncMessage::ChainUpdated | FilterSyncMessage::PeerConnected => ctx.trigger(),
            FilterSyncMessage::Reorg(ancestor) => {
                if let Err(e) = self.on_reorg(ancestor).await {
                    error!("reorg rollback failed: {e:#}");
                }
                ctx.trigger();
            }
            FilterSyncMessage::ProcessBlock(position, block) => {
                self.blocks.push(position, block);
                ctx.trigger();
            }
            FilterSyncMessage::Computed(computed) => {
                if let Err(e) = self.store_computed(computed).await {
                    error!("storing computed filter failed: {e:#}");
                    self.blocks.abort();
                }
                ctx.trigger();
            }
            FilterSyncMessage::ComputeFailed(position, reason) => {
                warn!(%position, "filter computation failed: {reason}");
                self.blocks.abort();
                ctx.trigger();
            }
        }
    }

    async fn tick(&mut self, ctx: &Context<FilterSyncMessage>) -> bool {
        if ctx.is_stopping() {
            return false;
        }
        if let Err(e) = self.drain_blocks(ctx).await {
            error!("block queue: {e:#}");
        }
        let headers = self.check_headers().await.unwrap_or_else(|e| {
            error!("filter header sync: {e:#}");
            true
        });
        let filters = self.check_filters().await.unwrap_or_else(|e| {
            error!("filter sync: {e:#}");
            true
        });
        headers || filters || !self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests;
