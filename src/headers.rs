//! Block header oracle: the best-known header chain, maintained outside the
//! engine and consulted by every actor.
use async_trait::async_trait;
use bitcoin::{block::Header, BlockHash};

use crate::types::Position;

/// A stored block header and its height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeaderInfo {
    /// The header itself.
    pub header: Header,
    /// Height of the block.
    pub height: u32,
}

impl BlockHeaderInfo {
    /// Position of this block.
    pub fn position(&self) -> Position {
        Position::new(self.height, self.header.block_hash())
    }
}

/// Source of block header information.
#[async_trait]
pub trait HeaderOracle: Send + Sync {
    /// Header for `hash`, on any branch.
    async fn load_header(&self, hash: &BlockHash) -> anyhow::Result<Option<BlockHeaderInfo>>;

    /// Hash of the best-chain block at `height`.
    async fn best_hash(&self, height: u32) -> anyhow::Result<Option<BlockHash>>;

    /// Tip of the best chain.
    async fn best_chain(&self) -> anyhow::Result<Position>;

    /// Last best-chain block shared with `position`'s branch, together with the best tip.
    async fn common_parent(&self, position: &Position) -> anyhow::Result<(Position, Position)>;

    /// Whether `hash` is part of the best chain.
    async fn is_in_best_chain(&self, hash: &BlockHash) -> anyhow::Result<bool>;

    /// Ancestor on the best chain that a stale `tip` must roll back to.
    async fn calculate_reorg(&self, tip: &Position) -> anyhow::Result<Position>;

    /// Connect headers received from a peer. Returns the fork point when the
    /// best chain switched branches.
    async fn add_headers(&self, headers: &[Header]) -> anyhow::Result<Option<Position>>;
}

/// Block locator for `getheaders`: the last ten best-chain hashes, then
/// exponentially sparser ones, ending with genesis.
pub async fn block_locator<H>(oracle: &H) -> anyhow::Result<Vec<BlockHash>>
where
    H: HeaderOracle + ?Sized,
{
    let tip = oracle.best_chain().await?;
    let mut locator = Vec::new();
    let mut height = tip.height as i64;
    let mut step = 1i64;
    while height > 0 {
        if let Some(hash) = oracle.best_hash(height as u32).await? {
            locator.push(hash);
        }
        if locator.len() >= 10 {
            step *= 2;
        }
        height -= step;
    }
    if let Some(genesis) = oracle.best_hash(0).await? {
        locator.push(genesis);
    }
    Ok(locator)
}
