//! In-memory collaborators: a header index, filter/peer/wallet stores and a
//! key source. Used by tests and by short-lived nodes that do not persist.
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use bitcoin::{
    bip158::{BlockFilter, FilterHash, FilterHeader},
    block::Header,
    constants::genesis_block,
    p2p::ServiceFlags,
    BlockHash, Network, OutPoint, PublicKey,
};

use super::{FilterHeaderEntry, FilterStore, PeerStore, WalletStore};
use crate::{
    headers::{BlockHeaderInfo, HeaderOracle},
    hooks::KeySource,
    peer::{PeerAddress, Protocol},
    types::{BlockPolicy, FilterType, Position},
    wallet::{ConfirmedTx, ElementId, Subchain, Utxo, WatchedElement},
};

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> anyhow::Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| anyhow!("{what} lock poisoned"))
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HeaderIndex {
    index: HashMap<BlockHash, BlockHeaderInfo>,
    best: Vec<BlockHash>,
}

impl HeaderIndex {
    fn tip(&self) -> Position {
        let height = self.best.len() - 1;
        Position::new(height as u32, self.best[height])
    }

    fn on_best(&self, height: u32, hash: &BlockHash) -> bool {
        self.best.get(height as usize) == Some(hash)
    }

    /// Walk back from `hash` to the first block on the best chain.
    fn fork_point(&self, hash: &BlockHash) -> Option<Position> {
        let mut cursor = *hash;
        loop {
            let info = self.index.get(&cursor)?;
            if self.on_best(info.height, &cursor) {
                return Some(Position::new(info.height, cursor));
            }
            cursor = info.header.prev_blockhash;
        }
    }

    fn connect(&mut self, headers: &[Header]) -> anyhow::Result<Option<Position>> {
        let mut fork: Option<Position> = None;
        for header in headers {
            let hash = header.block_hash();
            if self.index.contains_key(&hash) {
                continue;
            }
            let parent = self
                .index
                .get(&header.prev_blockhash)
                .with_context(|| format!("header {hash} does not connect"))?;
            let height = parent.height + 1;
            self.index.insert(
                hash,
                BlockHeaderInfo {
                    header: *header,
                    height,
                },
            );

            let tip = self.tip();
            if height <= tip.height {
                continue;
            }
            if header.prev_blockhash == tip.hash {
                self.best.push(hash);
                continue;
            }

            let ancestor = self
                .fork_point(&header.prev_blockhash)
                .context("branch does not reach the best chain")?;
            let mut branch = Vec::new();
            let mut cursor = hash;
            while cursor != ancestor.hash {
                branch.push(cursor);
                cursor = self.index[&cursor].header.prev_blockhash;
            }
            branch.reverse();
            self.best.truncate(ancestor.height as usize + 1);
            self.best.extend(branch);
            fork = Some(match fork {
                Some(previous) if previous.height <= ancestor.height => previous,
                _ => ancestor,
            });
        }
        Ok(fork)
    }
}

/// Header index with longest-chain selection. Headers are not checked for
/// proof of work.
#[derive(Debug)]
pub struct MemoryHeaders {
    state: Mutex<HeaderIndex>,
}

impl MemoryHeaders {
    /// Index holding only the genesis header of `network`.
    pub fn new(network: Network) -> Self {
        let genesis = genesis_block(network).header;
        let hash = genesis.block_hash();
        let mut index = HashMap::new();
        index.insert(
            hash,
            BlockHeaderInfo {
                header: genesis,
                height: 0,
            },
        );
        Self {
            state: Mutex::new(HeaderIndex {
                index,
                best: vec![hash],
            }),
        }
    }

    /// Hashes of the best chain, genesis first.
    pub fn best_hashes(&self) -> anyhow::Result<Vec<BlockHash>> {
        Ok(lock(&self.state, "header index")?.best.clone())
    }
}

#[async_trait]
impl HeaderOracle for MemoryHeaders {
    async fn load_header(&self, hash: &BlockHash) -> anyhow::Result<Option<BlockHeaderInfo>> {
        Ok(lock(&self.state, "header index")?.index.get(hash).copied())
    }

    async fn best_hash(&self, height: u32) -> anyhow::Result<Option<BlockHash>> {
        Ok(lock(&self.state, "header index")?
            .best
            .get(height as usize)
            .copied())
    }

    async fn best_chain(&self) -> anyhow::Result<Position> {
        Ok(lock(&self.state, "header index")?.tip())
    }

    async fn common_parent(&self, position: &Position) -> anyhow::Result<(Position, Position)> {
        let state = lock(&self.state, "header index")?;
        let genesis = Position::new(0, state.best[0]);
        let ancestor = state.fork_point(&position.hash).unwrap_or(genesis);
        Ok((ancestor, state.tip()))
    }

    async fn is_in_best_chain(&self, hash: &BlockHash) -> anyhow::Result<bool> {
        let state = lock(&self.state, "header index")?;
        Ok(state
            .index
            .get(hash)
            .is_some_and(|info| state.on_best(info.height, hash)))
    }

    async fn calculate_reorg(&self, tip: &Position) -> anyhow::Result<Position> {
        Ok(self.common_parent(tip).await?.0)
    }

    async fn add_headers(&self, headers: &[Header]) -> anyhow::Result<Option<Position>> {
        lock(&self.state, "header index")?.connect(headers)
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FilterState {
    filter_tips: HashMap<FilterType, Position>,
    header_tips: HashMap<FilterType, Position>,
    headers: HashMap<(FilterType, BlockHash), FilterHeaderEntry>,
    filters: HashMap<(FilterType, BlockHash), BlockFilter>,
    writes: usize,
}

impl FilterState {
    fn put_headers(&mut self, ty: FilterType, headers: &[FilterHeaderEntry], tip: Option<Position>) {
        for entry in headers {
            self.headers.insert((ty, entry.block), *entry);
        }
        if let Some(tip) = tip {
            self.header_tips.insert(ty, tip);
        }
    }

    fn put_filters(&mut self, ty: FilterType, filters: &[(BlockHash, BlockFilter)], tip: Option<Position>) {
        for (block, filter) in filters {
            self.filters.insert((ty, *block), filter.clone());
        }
        if let Some(tip) = tip {
            self.filter_tips.insert(ty, tip);
        }
    }
}

/// Filter database kept in memory.
#[derive(Debug, Default)]
pub struct MemoryFilterStore {
    state: Mutex<FilterState>,
}

impl MemoryFilterStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batch writes performed so far.
    pub fn writes(&self) -> usize {
        self.state.lock().map(|s| s.writes).unwrap_or_default()
    }
}

#[async_trait]
impl FilterStore for MemoryFilterStore {
    async fn filter_tip(&self, filter_type: FilterType) -> anyhow::Result<Option<Position>> {
        Ok(lock(&self.state, "filter store")?
            .filter_tips
            .get(&filter_type)
            .copied())
    }

    async fn filter_header_tip(&self, filter_type: FilterType) -> anyhow::Result<Option<Position>> {
        Ok(lock(&self.state, "filter store")?
            .header_tips
            .get(&filter_type)
            .copied())
    }

    async fn set_filter_tip(&self, filter_type: FilterType, tip: Position) -> anyhow::Result<()> {
        let mut state = lock(&self.state, "filter store")?;
        state.filter_tips.insert(filter_type, tip);
        state.writes += 1;
        Ok(())
    }

    async fn set_filter_header_tip(
        &self,
        filter_type: FilterType,
        tip: Position,
    ) -> anyhow::Result<()> {
        let mut state = lock(&self.state, "filter store")?;
        state.header_tips.insert(filter_type, tip);
        state.writes += 1;
        Ok(())
    }

    async fn load_filter(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<BlockFilter>> {
        Ok(lock(&self.state, "filter store")?
            .filters
            .get(&(filter_type, *block))
            .cloned())
    }

    async fn load_filter_header(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<FilterHeader>> {
        Ok(lock(&self.state, "filter store")?
            .headers
            .get(&(filter_type, *block))
            .map(|e| e.header))
    }

    async fn load_filter_hash(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<FilterHash>> {
        Ok(lock(&self.state, "filter store")?
            .headers
            .get(&(filter_type, *block))
            .map(|e| e.filter_hash))
    }

    async fn store_filter_headers(
        &self,
        filter_type: FilterType,
        headers: &[FilterHeaderEntry],
        tip: Option<Position>,
    ) -> anyhow::Result<()> {
        let mut state = lock(&self.state, "filter store")?;
        state.put_headers(filter_type, headers, tip);
        state.writes += 1;
        Ok(())
    }

    async fn store_filters(
        &self,
        filter_type: FilterType,
        filters: &[(BlockHash, BlockFilter)],
        tip: Option<Position>,
    ) -> anyhow::Result<()> {
        let mut state = lock(&self.state, "filter store")?;
        state.put_filters(filter_type, filters, tip);
        state.writes += 1;
        Ok(())
    }

    async fn store_filters_with_headers(
        &self,
        filter_type: FilterType,
        headers: &[FilterHeaderEntry],
        filters: &[(BlockHash, BlockFilter)],
        header_tip: Option<Position>,
        filter_tip: Option<Position>,
    ) -> anyhow::Result<()> {
        let mut state = lock(&self.state, "filter store")?;
        state.put_headers(filter_type, headers, header_tip);
        state.put_filters(filter_type, filters, filter_tip);
        state.writes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

/// Peer database kept in memory.
#[derive(Debug)]
pub struct MemoryPeerStore {
    policy: BlockPolicy,
    addresses: Mutex<Vec<PeerAddress>>,
    confirmed: Mutex<Vec<PeerAddress>>,
}

impl MemoryPeerStore {
    /// Empty database for a node keeping blocks according to `policy`.
    pub fn new(policy: BlockPolicy) -> Self {
        Self {
            policy,
            addresses: Mutex::new(Vec::new()),
            confirmed: Mutex::new(Vec::new()),
        }
    }

    /// Addresses that completed a handshake, oldest first.
    pub fn confirmed(&self) -> Vec<PeerAddress> {
        self.confirmed
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Number of known addresses.
    pub fn len(&self) -> usize {
        self.addresses.lock().map(|a| a.len()).unwrap_or_default()
    }

    /// Whether no address is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn block_policy(&self) -> anyhow::Result<BlockPolicy> {
        Ok(self.policy)
    }

    async fn find(
        &self,
        protocol: Option<Protocol>,
        services: ServiceFlags,
        exclude: &[PeerAddress],
    ) -> anyhow::Result<Option<PeerAddress>> {
        let addresses = lock(&self.addresses, "peer store")?;
        Ok(addresses
            .iter()
            .filter(|a| protocol.map_or(true, |p| a.protocol() == p))
            .filter(|a| a.services().has(services))
            .find(|a| !exclude.iter().any(|e| e.key() == a.key()))
            .cloned())
    }

    async fn insert(&self, new: Vec<PeerAddress>) -> anyhow::Result<()> {
        let mut addresses = lock(&self.addresses, "peer store")?;
        for address in new {
            match addresses.iter_mut().find(|a| a.key() == address.key()) {
                Some(known) => *known = address,
                None => addresses.push(address),
            }
        }
        Ok(())
    }

    async fn confirm(&self, address: &PeerAddress) -> anyhow::Result<()> {
        lock(&self.confirmed, "peer store")?.push(address.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ConfirmedRecord {
    position: Position,
    tx: ConfirmedTx,
    consumed: Vec<Utxo>,
}

#[derive(Debug, Default)]
struct SubchainRecords {
    indexed: Option<u32>,
    elements: Vec<WatchedElement>,
    tested: HashMap<BlockHash, (u32, HashSet<ElementId>)>,
    last_scanned: Option<Position>,
    unspent: HashMap<OutPoint, Utxo>,
    confirmed: Vec<ConfirmedRecord>,
}

/// Wallet database kept in memory.
#[derive(Debug, Default)]
pub struct MemoryWalletStore {
    subchains: Mutex<HashMap<Subchain, SubchainRecords>>,
}

impl MemoryWalletStore {
    /// Empty wallet database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirmed transactions of `subchain`, in the order they were recorded.
    pub fn confirmed(&self, subchain: Subchain) -> Vec<(Position, ConfirmedTx)> {
        self.subchains
            .lock()
            .map(|s| {
                s.get(&subchain)
                    .map(|r| {
                        r.confirmed
                            .iter()
                            .map(|c| (c.position, c.tx.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn with<R>(
        &self,
        subchain: Subchain,
        f: impl FnOnce(&mut SubchainRecords) -> R,
    ) -> anyhow::Result<R> {
        let mut subchains = lock(&self.subchains, "wallet store")?;
        Ok(f(subchains.entry(subchain).or_default()))
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn indexed(&self, subchain: Subchain) -> anyhow::Result<Option<u32>> {
        self.with(subchain, |r| r.indexed)
    }

    async fn add_elements(
        &self,
        subchain: Subchain,
        elements: Vec<WatchedElement>,
        last_index: u32,
    ) -> anyhow::Result<()> {
        self.with(subchain, |r| {
            for element in elements {
                if !r.elements.iter().any(|e| e.id() == element.id()) {
                    r.elements.push(element);
                }
            }
            r.indexed = Some(r.indexed.map_or(last_index, |i| i.max(last_index)));
        })
    }

    async fn elements(&self, subchain: Subchain) -> anyhow::Result<Vec<WatchedElement>> {
        self.with(subchain, |r| r.elements.clone())
    }

    async fn untested(
        &self,
        subchain: Subchain,
        block: &BlockHash,
    ) -> anyhow::Result<Vec<WatchedElement>> {
        self.with(subchain, |r| {
            let tested = r.tested.get(block).map(|(_, ids)| ids);
            r.elements
                .iter()
                .filter(|e| !tested.is_some_and(|ids| ids.contains(&e.id())))
                .cloned()
                .collect()
        })
    }

    async fn set_tested(
        &self,
        subchain: Subchain,
        position: Position,
        elements: &[ElementId],
    ) -> anyhow::Result<()> {
        self.with(subchain, |r| {
            r.tested
                .entry(position.hash)
                .or_insert_with(|| (position.height, HashSet::new()))
                .1
                .extend(elements.iter().copied());
        })
    }

    async fn last_scanned(&self, subchain: Subchain) -> anyhow::Result<Option<Position>> {
        self.with(subchain, |r| r.last_scanned)
    }

    async fn set_last_scanned(
        &self,
        subchain: Subchain,
        position: Option<Position>,
    ) -> anyhow::Result<()> {
        self.with(subchain, |r| r.last_scanned = position)
    }

    async fn unspent(&self, subchain: Subchain) -> anyhow::Result<Vec<Utxo>> {
        self.with(subchain, |r| {
            let mut utxos: Vec<_> = r.unspent.values().cloned().collect();
            utxos.sort_by_key(|u| (u.position.height, u.outpoint));
            utxos
        })
    }

    async fn add_confirmed(
        &self,
        subchain: Subchain,
        position: Position,
        transactions: Vec<ConfirmedTx>,
    ) -> anyhow::Result<()> {
        self.with(subchain, |r| {
            for tx in transactions {
                let known = r
                    .confirmed
                    .iter()
                    .any(|c| c.tx.txid == tx.txid && c.position == position);
                if known {
                    continue;
                }
                for utxo in &tx.created {
                    r.unspent.entry(utxo.outpoint).or_insert_with(|| utxo.clone());
                }
                let consumed = tx
                    .spent
                    .iter()
                    .filter_map(|outpoint| r.unspent.remove(outpoint))
                    .collect();
                r.confirmed.push(ConfirmedRecord {
                    position,
                    tx,
                    consumed,
                });
            }
        })
    }

    async fn rollback(&self, subchain: Subchain, ancestor: &Position) -> anyhow::Result<()> {
        self.with(subchain, |r| {
            let (stale, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut r.confirmed)
                .into_iter()
                .partition(|c| c.position.height > ancestor.height);
            r.confirmed = kept;
            for record in stale.into_iter().rev() {
                for utxo in &record.tx.created {
                    r.unspent.remove(&utxo.outpoint);
                }
                for utxo in record.consumed {
                    r.unspent.insert(utxo.outpoint, utxo);
                }
            }
            r.tested.retain(|_, (height, _)| *height <= ancestor.height);
            if r.last_scanned.is_some_and(|p| p.height > ancestor.height) {
                r.last_scanned = Some(*ancestor);
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Key source backed by explicit key lists.
#[derive(Debug, Default)]
pub struct MemoryKeys {
    keys: Mutex<HashMap<Subchain, Vec<PublicKey>>>,
}

impl MemoryKeys {
    /// No keys yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `key` to `subchain`; returns its index.
    pub fn push(&self, subchain: Subchain, key: PublicKey) -> anyhow::Result<u32> {
        let mut keys = lock(&self.keys, "key source")?;
        let list = keys.entry(subchain).or_default();
        list.push(key);
        Ok(list.len() as u32 - 1)
    }
}

#[async_trait]
impl KeySource for MemoryKeys {
    async fn key_count(&self, subchain: Subchain) -> anyhow::Result<u32> {
        Ok(lock(&self.keys, "key source")?
            .get(&subchain)
            .map_or(0, |k| k.len() as u32))
    }

    async fn public_key(&self, subchain: Subchain, index: u32) -> anyhow::Result<PublicKey> {
        lock(&self.keys, "key source")?
            .get(&subchain)
            .and_then(|k| k.get(index as usize))
            .copied()
            .with_context(|| format!("no {subchain} key at index {index}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        block::Version, hashes::Hash, pow::CompactTarget, Amount, ScriptBuf, TxMerkleNode, TxOut,
        Txid,
    };

    fn header(prev: BlockHash, salt: u32) -> Header {
        Header {
            version: Version::ONE,
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: salt,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: salt,
        }
    }

    fn chain(from: BlockHash, len: u32, salt: u32) -> Vec<Header> {
        let mut prev = from;
        (0..len)
            .map(|i| {
                let h = header(prev, salt * 1_000 + i);
                prev = h.block_hash();
                h
            })
            .collect()
    }

    #[tokio::test]
    async fn switches_to_longer_branch() -> anyhow::Result<()> {
        let headers = MemoryHeaders::new(Network::Regtest);
        let genesis = headers.best_chain().await?;
        let main = chain(genesis.hash, 5, 1);
        assert_eq!(headers.add_headers(&main).await?, None);
        assert_eq!(headers.best_chain().await?.height, 5);

        let fork_base = main[2].block_hash();
        let side = chain(fork_base, 4, 2);
        let reorg = headers.add_headers(&side).await?;
        assert_eq!(reorg, Some(Position::new(3, fork_base)));

        let best = headers.best_chain().await?;
        assert_eq!(best, Position::new(7, side[3].block_hash()));
        assert!(!headers.is_in_best_chain(&main[4].block_hash()).await?);

        let stale = Position::new(5, main[4].block_hash());
        assert_eq!(headers.calculate_reorg(&stale).await?, Position::new(3, fork_base));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_disconnected_headers() {
        let headers = MemoryHeaders::new(Network::Regtest);
        let orphan = chain(BlockHash::from_byte_array([9; 32]), 1, 3);
        assert!(headers.add_headers(&orphan).await.is_err());
    }

    #[tokio::test]
    async fn wallet_rollback_restores_spent_outputs() -> anyhow::Result<()> {
        let store = MemoryWalletStore::new();
        let owner = ElementId {
            subchain: Subchain::Receive,
            index: 0,
            kind: crate::wallet::ElementKind::P2pkh,
        };
        let outpoint = OutPoint::new(Txid::from_byte_array([1; 32]), 0);
        let utxo = Utxo {
            outpoint,
            txout: TxOut {
                value: Amount::from_sat(5_000),
                script_pubkey: ScriptBuf::new(),
            },
            owner,
            position: Position::blank(10),
        };
        store
            .add_confirmed(
                Subchain::Receive,
                Position::blank(10),
                vec![ConfirmedTx {
                    txid: outpoint.txid,
                    created: vec![utxo],
                    spent: vec![],
                }],
            )
            .await?;
        store
            .add_confirmed(
                Subchain::Receive,
                Position::blank(20),
                vec![ConfirmedTx {
                    txid: Txid::from_byte_array([2; 32]),
                    created: vec![],
                    spent: vec![outpoint],
                }],
            )
            .await?;
        assert_eq!(store.balance(Subchain::Receive).await?, Amount::ZERO);

        store
            .set_last_scanned(Subchain::Receive, Some(Position::blank(25)))
            .await?;
        store
            .rollback(Subchain::Receive, &Position::blank(15))
            .await?;
        assert_eq!(
            store.balance(Subchain::Receive).await?,
            Amount::from_sat(5_000)
        );
        assert_eq!(
            store.last_scanned(Subchain::Receive).await?,
            Some(Position::blank(15))
        );
        assert_eq!(store.confirmed(Subchain::Receive).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn peer_store_honours_exclusions() -> anyhow::Result<()> {
        let store = MemoryPeerStore::new(BlockPolicy::None);
        let a: PeerAddress = "10.0.0.1:8333".parse()?;
        let b = "10.0.0.2:8333"
            .parse::<PeerAddress>()?
            .with_services(ServiceFlags::COMPACT_FILTERS);
        store.insert(vec![a.clone(), b.clone()]).await?;

        let any = store.find(None, ServiceFlags::NONE, &[a.clone()]).await?;
        assert_eq!(any, Some(b.clone()));
        let filters = store
            .find(None, ServiceFlags::COMPACT_FILTERS, &[])
            .await?;
        assert_eq!(filters, Some(b.clone()));
        assert_eq!(
            store.find(Some(Protocol::Relay), ServiceFlags::NONE, &[]).await?,
            None
        );
        Ok(())
    }
}
