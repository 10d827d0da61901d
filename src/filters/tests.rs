use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bitcoin::{
    absolute::LockTime,
    bip158::{BlockFilter, FilterHash, FilterHeader},
    block::{Header, Version},
    constants::genesis_block,
    hashes::Hash,
    pow::CompactTarget,
    transaction, Amount, Block, BlockHash, Network, ScriptBuf, Transaction, TxIn, TxMerkleNode,
    TxOut, WPubkeyHash,
};

use super::*;
use crate::{
    actor::{self, Settings},
    cfheaders::link_batch,
    store::MemoryFilterStore,
    store::MemoryHeaders,
    workers::WorkerPool,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    FilterHeaders(FilterType, u32, BlockHash),
    Filters(FilterType, u32, BlockHash),
}

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    offline: bool,
}

impl Recorder {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl FilterSource for Recorder {
    fn request_headers(&self) -> bool {
        !self.offline
    }

    fn request_filter_headers(&self, ty: FilterType, start: u32, stop: BlockHash) -> bool {
        if self.offline {
            return false;
        }
        self.calls
            .lock()
            .unwrap()
            .push(Call::FilterHeaders(ty, start, stop));
        true
    }

    fn request_filters(&self, ty: FilterType, start: u32, stop: BlockHash) -> bool {
        if self.offline {
            return false;
        }
        self.calls.lock().unwrap().push(Call::Filters(ty, start, stop));
        true
    }
}

fn header(prev: BlockHash, n: u32) -> Header {
    Header {
        version: Version::ONE,
        prev_blockhash: prev,
        merkle_root: TxMerkleNode::all_zeros(),
        time: n,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce: n,
    }
}

/// Best chain of `len` blocks on top of regtest genesis; returns hashes by height.
async fn chain(headers: &MemoryHeaders, len: u32) -> Vec<BlockHash> {
    let mut prev = headers.best_hash(0).await.unwrap().unwrap();
    let batch: Vec<_> = (1..=len)
        .map(|n| {
            let h = header(prev, n);
            prev = h.block_hash();
            h
        })
        .collect();
    headers.add_headers(&batch).await.unwrap();
    headers.best_hashes().unwrap()
}

fn filter_for(height: u32) -> BlockFilter {
    BlockFilter::new(&[1, height as u8, (height >> 8) as u8])
}

/// Store a verified filter-header chain for heights `0..=tip`.
async fn seed_headers(store: &MemoryFilterStore, hashes: &[BlockHash], tip: u32) -> Vec<FilterHeader> {
    let filter_hashes: Vec<_> = (0..=tip)
        .map(|h| FilterHash::hash(&filter_for(h).content))
        .collect();
    let links = link_batch(0, genesis_previous(), &filter_hashes);
    let entries: Vec<_> = links
        .iter()
        .map(|l| FilterHeaderEntry {
            block: hashes[l.height as usize],
            header: l.header,
            filter_hash: l.filter_hash,
        })
        .collect();
    store
        .store_filter_headers(
            FilterType::Basic,
            &entries,
            Some(Position::new(tip, hashes[tip as usize])),
        )
        .await
        .unwrap();
    links.iter().map(|l| l.header).collect()
}

struct Rig {
    store: Arc<MemoryFilterStore>,
    headers: Arc<MemoryHeaders>,
    peers: Recorder,
    events: EventBus,
    hashes: Vec<BlockHash>,
}

impl Rig {
    async fn new(len: u32) -> Self {
        let headers = Arc::new(MemoryHeaders::new(Network::Regtest));
        let hashes = chain(&headers, len).await;
        Self {
            store: Arc::new(MemoryFilterStore::new()),
            headers,
            peers: Recorder::default(),
            events: EventBus::new(),
            hashes,
        }
    }

    fn engine(&self) -> FilterSync<MemoryFilterStore, MemoryHeaders, Recorder> {
        FilterSync::new(
            &Config::for_network(Network::Regtest),
            self.store.clone(),
            self.headers.clone(),
            self.peers.clone(),
            self.events.clone(),
        )
    }

    fn pos(&self, height: u32) -> Position {
        Position::new(height, self.hashes[height as usize])
    }
}

fn context() -> Context<FilterSyncMessage> {
    let (mailbox, inbox) = actor::channel("filter-sync");
    std::mem::forget(inbox);
    Context::new(mailbox, WorkerPool::new(1))
}

#[tokio::test]
async fn requests_only_the_missing_filter_range() -> anyhow::Result<()> {
    let rig = Rig::new(100).await;
    seed_headers(&rig.store, &rig.hashes, 100).await;
    rig.store.set_filter_tip(FilterType::Basic, rig.pos(90)).await?;

    let mut engine = rig.engine();
    assert!(engine.tick(&context()).await);
    assert_eq!(
        rig.peers.calls(),
        vec![Call::Filters(FilterType::Basic, 91, rig.hashes[100])]
    );

    // A second tick while the window is in flight issues nothing new.
    engine.tick(&context()).await;
    assert_eq!(rig.peers.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn header_requests_are_windowed_and_single_flight() -> anyhow::Result<()> {
    let rig = Rig::new(2_500).await;
    let mut engine = rig.engine();
    assert!(engine.tick(&context()).await);
    assert!(engine.tick(&context()).await);
    assert_eq!(
        rig.peers.calls(),
        vec![Call::FilterHeaders(FilterType::Basic, 0, rig.hashes[1_999])]
    );
    Ok(())
}

#[tokio::test]
async fn stalls_quietly_without_peers() -> anyhow::Result<()> {
    let mut rig = Rig::new(10).await;
    rig.peers.offline = true;
    let mut engine = rig.engine();
    assert!(!engine.tick(&context()).await);
    Ok(())
}

#[tokio::test]
async fn rejects_batch_with_wrong_previous_header() -> anyhow::Result<()> {
    let rig = Rig::new(60).await;
    seed_headers(&rig.store, &rig.hashes, 49).await;
    let mut engine = rig.engine();

    let batch = FilterHeadersBatch {
        filter_type: FilterType::Basic,
        stop_hash: rig.hashes[55],
        previous: FilterHeader::from_byte_array([0xab; 32]),
        filter_hashes: (50..=55)
            .map(|h| FilterHash::hash(&filter_for(h).content))
            .collect(),
    };
    engine
        .handle(FilterSyncMessage::FilterHeaders(batch), &context())
        .await;

    assert_eq!(
        rig.store.filter_header_tip(FilterType::Basic).await?,
        Some(rig.pos(49))
    );
    Ok(())
}

#[tokio::test]
async fn accepts_linked_batch_once() -> anyhow::Result<()> {
    let rig = Rig::new(60).await;
    let stored = seed_headers(&rig.store, &rig.hashes, 49).await;
    let mut engine = rig.engine();
    let mut events = rig.events.subscribe();

    let filter_hashes: Vec<_> = (50..=55)
        .map(|h| FilterHash::hash(&filter_for(h).content))
        .collect();
    let batch = FilterHeadersBatch {
        filter_type: FilterType::Basic,
        stop_hash: rig.hashes[55],
        previous: stored[49],
        filter_hashes: filter_hashes.clone(),
    };
    engine
        .handle(FilterSyncMessage::FilterHeaders(batch.clone()), &context())
        .await;
    assert_eq!(
        rig.store.filter_header_tip(FilterType::Basic).await?,
        Some(rig.pos(55))
    );
    assert_eq!(
        events.try_recv()?,
        Event::NewFilterHeader {
            filter_type: FilterType::Basic,
            position: rig.pos(55)
        }
    );

    let mut previous = stored[49];
    for (i, height) in (50..=55).enumerate() {
        let header = rig
            .store
            .load_filter_header(FilterType::Basic, &rig.hashes[height])
            .await?
            .unwrap();
        assert_eq!(header, filter_hashes[i].filter_header(&previous));
        previous = header;
    }

    let writes = rig.store.writes();
    engine
        .handle(FilterSyncMessage::FilterHeaders(batch), &context())
        .await;
    assert_eq!(rig.store.writes(), writes);
    Ok(())
}

#[tokio::test]
async fn rejects_stop_hash_off_the_best_chain() -> anyhow::Result<()> {
    let rig = Rig::new(10).await;
    let stale = header(rig.hashes[4], 999);
    rig.headers.add_headers(&[stale]).await?;
    let mut engine = rig.engine();

    let batch = FilterHeadersBatch {
        filter_type: FilterType::Basic,
        stop_hash: stale.block_hash(),
        previous: genesis_previous(),
        filter_hashes: (0..=5).map(|h| FilterHash::hash(&filter_for(h).content)).collect(),
    };
    engine
        .handle(FilterSyncMessage::FilterHeaders(batch), &context())
        .await;
    assert_eq!(rig.store.filter_header_tip(FilterType::Basic).await?, None);
    Ok(())
}

#[tokio::test]
async fn flushes_a_complete_window() -> anyhow::Result<()> {
    let rig = Rig::new(20).await;
    seed_headers(&rig.store, &rig.hashes, 20).await;
    rig.store.set_filter_tip(FilterType::Basic, rig.pos(10)).await?;
    let mut engine = rig.engine();
    let mut events = rig.events.subscribe();
    let ctx = context();
    engine.tick(&ctx).await;

    let received = |height: u32, filter: BlockFilter| ReceivedFilter {
        filter_type: FilterType::Basic,
        block_hash: rig.hashes[height as usize],
        filter,
    };

    // Wrong content for height 15 is rejected and leaves the slot open.
    engine
        .handle(
            FilterSyncMessage::Filter(received(15, filter_for(99))),
            &ctx,
        )
        .await;
    for height in (11..=20).rev() {
        engine
            .handle(FilterSyncMessage::Filter(received(height, filter_for(height))), &ctx)
            .await;
    }

    assert_eq!(
        rig.store.filter_tip(FilterType::Basic).await?,
        Some(rig.pos(20))
    );
    assert_eq!(
        rig.store
            .load_filter(FilterType::Basic, &rig.hashes[13])
            .await?,
        Some(filter_for(13))
    );
    assert_eq!(
        events.try_recv()?,
        Event::NewFilter {
            filter_type: FilterType::Basic,
            position: rig.pos(20)
        }
    );

    // Re-delivery after the flush writes nothing.
    let writes = rig.store.writes();
    engine
        .handle(FilterSyncMessage::Filter(received(20, filter_for(20))), &ctx)
        .await;
    assert_eq!(rig.store.writes(), writes);
    Ok(())
}

#[tokio::test]
async fn reorg_rolls_tips_back_to_the_ancestor() -> anyhow::Result<()> {
    let rig = Rig::new(100).await;
    seed_headers(&rig.store, &rig.hashes, 100).await;
    rig.store.set_filter_tip(FilterType::Basic, rig.pos(100)).await?;
    rig.store
        .set_filter_tip(FilterType::Extended, rig.pos(70))
        .await?;
    let mut engine = rig.engine();

    engine
        .handle(FilterSyncMessage::Reorg(rig.pos(80)), &context())
        .await;

    assert_eq!(
        rig.store.filter_header_tip(FilterType::Basic).await?,
        Some(rig.pos(80))
    );
    assert_eq!(
        rig.store.filter_tip(FilterType::Basic).await?,
        Some(rig.pos(80))
    );
    assert_eq!(
        rig.store.filter_tip(FilterType::Extended).await?,
        Some(rig.pos(70))
    );
    Ok(())
}

#[tokio::test]
async fn reorg_discards_in_flight_windows() -> anyhow::Result<()> {
    let rig = Rig::new(120).await;
    let stored = seed_headers(&rig.store, &rig.hashes, 100).await;
    rig.store.set_filter_tip(FilterType::Basic, rig.pos(90)).await?;
    let mut engine = rig.engine();
    let ctx = context();

    engine.tick(&ctx).await;
    assert_eq!(
        rig.peers.calls(),
        vec![
            Call::FilterHeaders(FilterType::Basic, 101, rig.hashes[120]),
            Call::Filters(FilterType::Basic, 91, rig.hashes[100]),
        ]
    );

    // A longer branch forks off at 80 while both requests are out.
    let mut prev = rig.hashes[80];
    let branch: Vec<_> = (81..=140)
        .map(|n| {
            let h = header(prev, n + 10_000);
            prev = h.block_hash();
            h
        })
        .collect();
    rig.headers.add_headers(&branch).await?;
    let fork_tip = prev;
    engine.handle(FilterSyncMessage::Reorg(rig.pos(80)), &ctx).await;

    engine.tick(&ctx).await;
    assert_eq!(
        rig.peers.calls()[2..],
        [Call::FilterHeaders(FilterType::Basic, 81, fork_tip)]
    );

    // Late replies for the abandoned windows change nothing.
    let late_headers = FilterHeadersBatch {
        filter_type: FilterType::Basic,
        stop_hash: rig.hashes[120],
        previous: stored[100],
        filter_hashes: (101..=120)
            .map(|h| FilterHash::hash(&filter_for(h).content))
            .collect(),
    };
    engine
        .handle(FilterSyncMessage::FilterHeaders(late_headers), &ctx)
        .await;
    engine
        .handle(
            FilterSyncMessage::Filter(ReceivedFilter {
                filter_type: FilterType::Basic,
                block_hash: rig.hashes[95],
                filter: filter_for(95),
            }),
            &ctx,
        )
        .await;
    assert_eq!(
        rig.store.filter_header_tip(FilterType::Basic).await?,
        Some(rig.pos(80))
    );
    assert_eq!(
        rig.store.filter_tip(FilterType::Basic).await?,
        Some(rig.pos(80))
    );

    // The branch request is still the one in flight.
    engine.tick(&ctx).await;
    assert_eq!(rig.peers.calls().len(), 3);
    Ok(())
}

fn coinbase(tag: u8, script: ScriptBuf) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            script_sig: ScriptBuf::from_bytes(vec![1, tag]),
            ..TxIn::default()
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: script,
        }],
    }
}

fn block_on(prev: BlockHash, tag: u8) -> Block {
    let script = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([tag; 20]));
    let mut block = Block {
        header: header(prev, tag as u32),
        txdata: vec![coinbase(tag, script)],
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

#[tokio::test]
async fn computes_filters_for_sequential_blocks() -> anyhow::Result<()> {
    let genesis = genesis_block(Network::Regtest);
    let first = block_on(genesis.block_hash(), 1);
    let second = block_on(first.block_hash(), 2);

    let rig = Rig::new(0).await;
    rig.headers
        .add_headers(&[first.header, second.header])
        .await?;
    let mut peers = rig.peers.clone();
    peers.offline = true;
    let (mailbox, inbox) = actor::channel("filter-sync");
    let engine = FilterSync::new(
        &Config::for_network(Network::Regtest),
        rig.store.clone(),
        rig.headers.clone(),
        peers,
        rig.events.clone(),
    );
    let handle = actor::spawn(
        engine,
        inbox,
        WorkerPool::new(2),
        Settings {
            interval: Duration::from_millis(5),
            drain: Duration::from_secs(1),
        },
    );

    let positions = [
        Position::new(0, genesis.block_hash()),
        Position::new(1, first.block_hash()),
        Position::new(2, second.block_hash()),
    ];
    for (position, block) in positions.iter().zip([genesis, first.clone(), second]) {
        mailbox.send(FilterSyncMessage::ProcessBlock(
            *position,
            Pending::ready(Arc::new(block)),
        ))?;
    }

    let store = rig.store.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.filter_tip(FilterType::Basic).await.unwrap() != Some(positions[2]) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    let h0 = store
        .load_filter_header(FilterType::Basic, &positions[0].hash)
        .await?
        .unwrap();
    let f1 = store
        .load_filter(FilterType::Basic, &positions[1].hash)
        .await?
        .unwrap();
    let h1 = store
        .load_filter_header(FilterType::Basic, &positions[1].hash)
        .await?
        .unwrap();
    assert_eq!(f1.filter_header(&h0), h1);
    assert_eq!(
        store.filter_header_tip(FilterType::Basic).await?,
        Some(positions[2])
    );

    handle.shutdown().await;
    Ok(())
}
