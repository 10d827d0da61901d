//! Persistence interfaces used by the engines (filter database, peer
//! database, wallet database) and the implementations shipped with the crate.
use async_trait::async_trait;
use bitcoin::{
    bip158::{BlockFilter, FilterHash, FilterHeader},
    p2p::ServiceFlags,
    Amount, BlockHash,
};

use crate::{
    peer::{PeerAddress, Protocol},
    types::{BlockPolicy, FilterType, Position},
    wallet::{ConfirmedTx, ElementId, Subchain, Utxo, WatchedElement},
};

/// One verified link of a filter-header chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterHeaderEntry {
    /// Block the header commits to.
    pub block: BlockHash,
    /// Filter header of `block`.
    pub header: FilterHeader,
    /// Hash of the filter content of `block`.
    pub filter_hash: FilterHash,
}

/// Filter database: filter headers, filter content and one tip per chain and type.
///
/// Batch writes are atomic: either every entry and the new tip land, or nothing does.
#[async_trait]
pub trait FilterStore: Send + Sync {
    /// Tip of the filter-content chain; `None` before the first batch.
    async fn filter_tip(&self, filter_type: FilterType) -> anyhow::Result<Option<Position>>;

    /// Tip of the filter-header chain; `None` before the first batch.
    async fn filter_header_tip(&self, filter_type: FilterType) -> anyhow::Result<Option<Position>>;

    /// Move the filter-content tip (used for rollbacks).
    async fn set_filter_tip(&self, filter_type: FilterType, tip: Position) -> anyhow::Result<()>;

    /// Move the filter-header tip (used for rollbacks).
    async fn set_filter_header_tip(&self, filter_type: FilterType, tip: Position)
        -> anyhow::Result<()>;

    /// Filter content of `block`.
    async fn load_filter(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<BlockFilter>>;

    /// Filter header of `block`.
    async fn load_filter_header(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<FilterHeader>>;

    /// Committed filter hash of `block`.
    async fn load_filter_hash(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<FilterHash>>;

    /// Store headers and, if given, move the header tip.
    async fn store_filter_headers(
        &self,
        filter_type: FilterType,
        headers: &[FilterHeaderEntry],
        tip: Option<Position>,
    ) -> anyhow::Result<()>;

    /// Store filter content and, if given, move the content tip.
    async fn store_filters(
        &self,
        filter_type: FilterType,
        filters: &[(BlockHash, BlockFilter)],
        tip: Option<Position>,
    ) -> anyhow::Result<()>;

    /// Store headers and content together (locally computed filters).
    async fn store_filters_with_headers(
        &self,
        filter_type: FilterType,
        headers: &[FilterHeaderEntry],
        filters: &[(BlockHash, BlockFilter)],
        header_tip: Option<Position>,
        filter_tip: Option<Position>,
    ) -> anyhow::Result<()>;
}

/// Peer database.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// How many blocks this node keeps; drives the target peer count.
    async fn block_policy(&self) -> anyhow::Result<BlockPolicy>;

    /// An address speaking `protocol` (any, if `None`) that advertises
    /// `services` and is not in `exclude`.
    async fn find(
        &self,
        protocol: Option<Protocol>,
        services: ServiceFlags,
        exclude: &[PeerAddress],
    ) -> anyhow::Result<Option<PeerAddress>>;

    /// Remember addresses learned from peers.
    async fn insert(&self, addresses: Vec<PeerAddress>) -> anyhow::Result<()>;

    /// Record a successful handshake with `address`.
    async fn confirm(&self, address: &PeerAddress) -> anyhow::Result<()>;
}

/// Wallet database: watched elements, scan progress, tested patterns,
/// unspent outputs and confirmed transactions, kept per subchain.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Highest key index already turned into watched elements.
    async fn indexed(&self, subchain: Subchain) -> anyhow::Result<Option<u32>>;

    /// Register elements derived up to key index `last_index`.
    async fn add_elements(
        &self,
        subchain: Subchain,
        elements: Vec<WatchedElement>,
        last_index: u32,
    ) -> anyhow::Result<()>;

    /// Every watched element of `subchain`.
    async fn elements(&self, subchain: Subchain) -> anyhow::Result<Vec<WatchedElement>>;

    /// Elements not yet tested against `block`.
    async fn untested(
        &self,
        subchain: Subchain,
        block: &BlockHash,
    ) -> anyhow::Result<Vec<WatchedElement>>;

    /// Mark elements as tested against the block at `position`.
    async fn set_tested(
        &self,
        subchain: Subchain,
        position: Position,
        elements: &[ElementId],
    ) -> anyhow::Result<()>;

    /// Last block whose filter was tested.
    async fn last_scanned(&self, subchain: Subchain) -> anyhow::Result<Option<Position>>;

    /// Move the scan position.
    async fn set_last_scanned(
        &self,
        subchain: Subchain,
        position: Option<Position>,
    ) -> anyhow::Result<()>;

    /// Unspent outputs owned by `subchain`.
    async fn unspent(&self, subchain: Subchain) -> anyhow::Result<Vec<Utxo>>;

    /// Record confirmed transactions: create their outputs, consume their spends.
    async fn add_confirmed(
        &self,
        subchain: Subchain,
        position: Position,
        transactions: Vec<ConfirmedTx>,
    ) -> anyhow::Result<()>;

    /// Undo everything recorded above `ancestor`.
    async fn rollback(&self, subchain: Subchain, ancestor: &Position) -> anyhow::Result<()>;

    /// Unspent total of `subchain`.
    async fn balance(&self, subchain: Subchain) -> anyhow::Result<Amount> {
        Ok(self
            .unspent(subchain)
            .await?
            .iter()
            .map(Utxo::value)
            .sum())
    }
}

pub mod memory;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

pub use memory::{MemoryFilterStore, MemoryHeaders, MemoryKeys, MemoryPeerStore, MemoryWalletStore};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
