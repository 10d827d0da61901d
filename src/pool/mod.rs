//! Peer pool manager.
//!
//! Keeps a target number of handshaken connections open, picks addresses
//! through [`AddressBook`], accepts inbound peers on configured listen
//! addresses and hands queued [`Job`]s to active peers. Replies from peers
//! are routed to the filter sync engine, the block cache, the header oracle
//! and the peer database.
//!
//! Each slot moves `Connecting → Handshaking → Active → Disconnected`; a
//! disconnected slot is removed at once and refilled on a later tick.
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bitcoin::{
    block::Header,
    hashes::Hash,
    p2p::{
        address::Address,
        message::NetworkMessage,
        message_blockdata::{GetHeadersMessage, Inventory},
        message_filter::{GetCFHeaders, GetCFilters},
        message_network::VersionMessage,
        ServiceFlags,
    },
    BlockHash, Transaction,
};
use tokio::{sync::oneshot, task::JoinHandle, time};
use tracing::{debug, error, info, trace, warn};

use crate::{
    actor::{Actor, Context, Mailbox},
    block_cache::BlockCacheHandle,
    config::Config,
    error::NetworkError,
    events::{Event, EventBus},
    filter_source::{BlockSource, FilterHeadersBatch, FilterSource, ReceivedFilter},
    filters::FilterSyncMessage,
    headers::{block_locator, HeaderOracle},
    peer::{Connection, InprocHub, Listener, PeerAddress, PeerEvent, Protocol, Stream},
    store::PeerStore,
    types::{BlockPolicy, FilterType, PeerId},
};

pub mod address;
pub mod jobs;
pub mod record;

pub use address::{resolve_seeds, target_peers, AddressBook};
pub use jobs::{Job, JobKind, JobQueues};
pub use record::{Origin, PeerRecord, PeerState};

/// Protocol version advertised in `version` (BIP157 needs 70016).
pub const PROTOCOL_VERSION: u32 = 70_016;
/// A full `headers` message; more headers are likely waiting.
const MAX_HEADERS_PER_MESSAGE: usize = 2_000;
/// Outbound addresses that failed are skipped for this long.
const FAILURE_BACKOFF: Duration = Duration::from_secs(60);
/// Services we offer.
const OUR_SERVICES: ServiceFlags = ServiceFlags::NONE;

/// Mailbox of the peer pool.
#[derive(Debug)]
pub enum PoolMessage {
    /// Traffic from a connection.
    Peer(PeerEvent),
    /// An outbound dial finished (worker result).
    Connected {
        /// Slot the dial belongs to.
        id: PeerId,
        /// The dialled connection.
        connection: Box<Connection>,
        /// Dial outcome.
        result: Result<(), String>,
    },
    /// Connect to `address`; `reply` gets the handshake outcome.
    AddPeer {
        /// Peer to dial.
        address: PeerAddress,
        /// Handshake outcome.
        reply: oneshot::Sender<bool>,
    },
    /// Accept inbound peers on `address`.
    Listen {
        /// Address to bind.
        address: PeerAddress,
        /// Whether binding succeeded.
        reply: oneshot::Sender<bool>,
    },
    /// An inbound stream was accepted.
    Incoming {
        /// Accepted stream.
        stream: Stream,
        /// Remote address.
        address: PeerAddress,
    },
    /// Tear down one peer.
    Disconnect(PeerId),
    /// Work for some peer.
    Job(Job),
    /// DNS seed lookup finished.
    SeedsResolved(Vec<SocketAddr>),
}

impl From<PeerEvent> for PoolMessage {
    fn from(event: PeerEvent) -> Self {
        PoolMessage::Peer(event)
    }
}

/// Where peer replies go. Unset routes drop the traffic.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    /// `cfheaders` and `cfilter`.
    pub filter_sync: Option<Mailbox<FilterSyncMessage>>,
    /// `block`.
    pub block_cache: Option<BlockCacheHandle>,
}

/// The peer pool actor.
pub struct PeerPool<S, H> {
    config: Config,
    store: Arc<S>,
    headers: Arc<H>,
    events: EventBus,
    hub: InprocHub,
    routes: Routes,
    book: AddressBook,
    target: usize,
    peers: BTreeMap<PeerId, PeerRecord>,
    next_id: u64,
    jobs: JobQueues,
    cursor: usize,
    active: Arc<AtomicUsize>,
    failed: Vec<(PeerAddress, Instant)>,
    listeners: Vec<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl<S, H> PeerPool<S, H>
where
    S: PeerStore + 'static,
    H: HeaderOracle + 'static,
{
    /// Pool for `config`. The target peer count is settled in `started`,
    /// once the peer database reports its block policy.
    pub fn new(
        config: &Config,
        store: Arc<S>,
        headers: Arc<H>,
        events: EventBus,
        hub: InprocHub,
        routes: Routes,
    ) -> Self {
        Self {
            book: AddressBook::new(config),
            target: config.target_peers.unwrap_or(0),
            config: config.clone(),
            store,
            headers,
            events,
            hub,
            routes,
            peers: BTreeMap::new(),
            next_id: 0,
            jobs: JobQueues::new(),
            cursor: 0,
            active: Arc::new(AtomicUsize::new(0)),
            failed: Vec::new(),
            listeners: Vec::new(),
            heartbeat: None,
        }
    }

    /// Caller-side handle sharing this pool's active peer counter.
    pub fn client(&self, mailbox: Mailbox<PoolMessage>) -> PeerPoolHandle {
        PeerPoolHandle {
            mailbox,
            active: self.active.clone(),
            confirm: self.config.timeouts.confirm,
        }
    }

    /// Current target peer count.
    pub fn target(&self) -> usize {
        self.target
    }

    fn open_slots(&self) -> usize {
        let maintained = self
            .peers
            .values()
            .filter(|p| p.origin == Origin::Maintained)
            .count();
        self.target.saturating_sub(maintained)
    }

    fn exclusions(&mut self) -> Vec<PeerAddress> {
        self.failed.retain(|(_, at)| at.elapsed() < FAILURE_BACKOFF);
        self.peers
            .values()
            .map(|p| p.address.clone())
            .chain(self.failed.iter().map(|(a, _)| a.clone()))
            .collect()
    }

    fn open(
        &mut self,
        address: PeerAddress,
        origin: Origin,
        reply: Option<oneshot::Sender<bool>>,
        ctx: &Context<PoolMessage>,
    ) {
        self.next_id += 1;
        let id = PeerId(self.next_id);
        debug!(%id, %address, ?origin, "connecting");

        let mut record = PeerRecord::new(address.clone(), origin);
        record.reply = reply;
        self.peers.insert(id, record);

        let magic = self.config.network.magic();
        let hub = self.hub.clone();
        let timeout = self.config.timeouts.handshake;
        let mailbox = ctx.mailbox().clone();
        tokio::spawn(async move {
            let mut connection = Connection::outgoing(address, magic, &hub);
            let result = connection.connect(timeout).await.map_err(|e| e.to_string());
            let _ = mailbox.send(PoolMessage::Connected {
                id,
                connection: Box::new(connection),
                result,
            });
        });
    }

    fn drop_peer(&mut self, id: PeerId, reason: &str) {
        let Some(mut record) = self.peers.remove(&id) else {
            return;
        };
        let was_active = record.is_active();
        record.enter(PeerState::Disconnected);
        if let Some(mut connection) = record.connection.take() {
            connection.close();
        }
        record.answer(false);
        self.jobs.forget_peer(id);

        if record.origin != Origin::Incoming {
            self.failed.push((record.address.clone(), Instant::now()));
        }
        if was_active {
            self.active.fetch_sub(1, Ordering::AcqRel);
            info!(%id, peer = %record.address, "peer disconnected: {reason}");
            self.events.publish(Event::PeerDisconnected { id });
        } else {
            debug!(%id, peer = %record.address, "peer dropped: {reason}");
        }
    }

    fn send_to(&self, id: PeerId, message: NetworkMessage) -> bool {
        self.peers
            .get(&id)
            .is_some_and(|record| transmit(record, message))
    }

    async fn send_version(&mut self, id: PeerId) {
        let height = match self.headers.best_chain().await {
            Ok(best) => best.height,
            Err(e) => {
                warn!("best chain unavailable for version: {e:#}");
                0
            }
        };
        let Some(record) = self.peers.get_mut(&id) else {
            return;
        };
        let version = version_message(&self.config.user_agent, &record.address, height);
        record.version_sent = true;
        transmit(record, NetworkMessage::Version(version));
    }

    async fn on_connected(
        &mut self,
        id: PeerId,
        mut connection: Box<Connection>,
        result: Result<(), String>,
        ctx: &Context<PoolMessage>,
    ) {
        if !self.peers.contains_key(&id) {
            return;
        }
        if let Err(reason) = result {
            warn!(%id, peer = %connection.address(), "connect failed: {reason}");
            self.drop_peer(id, &reason);
            ctx.trigger();
            return;
        }
        if !connection.init(id, ctx.mailbox().clone()) {
            self.drop_peer(id, &NetworkError::NotConnected.to_string());
            ctx.trigger();
            return;
        }
        if let Some(record) = self.peers.get_mut(&id) {
            record.connection = Some(connection);
            record.enter(PeerState::Handshaking);
        }
        self.send_version(id).await;
    }

    fn on_incoming(&mut self, stream: Stream, address: PeerAddress, ctx: &Context<PoolMessage>) {
        self.next_id += 1;
        let id = PeerId(self.next_id);
        let mut connection = Box::new(Connection::incoming(
            address.clone(),
            stream,
            self.config.network.magic(),
        ));
        if !connection.init(id, ctx.mailbox().clone()) {
            return;
        }
        debug!(%id, %address, "inbound peer");
        let mut record = PeerRecord::new(address, Origin::Incoming);
        record.connection = Some(connection);
        record.enter(PeerState::Handshaking);
        self.peers.insert(id, record);
    }

    fn on_add_peer(
        &mut self,
        address: PeerAddress,
        reply: oneshot::Sender<bool>,
        ctx: &Context<PoolMessage>,
    ) {
        let known = self
            .peers
            .values_mut()
            .find(|p| p.address.key() == address.key());
        match known {
            Some(record) if record.is_active() => {
                let _ = reply.send(true);
            }
            Some(record) if record.reply.is_none() => record.reply = Some(reply),
            Some(_) => {
                let _ = reply.send(false);
            }
            None => {
                self.failed.retain(|(a, _)| a.key() != address.key());
                self.open(address, Origin::Manual, Some(reply), ctx);
            }
        }
    }

    async fn listen(&mut self, address: PeerAddress, ctx: &Context<PoolMessage>) -> bool {
        let mut listener = match Listener::bind(&address, &self.hub).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(%address, "listen failed: {e}");
                return false;
            }
        };
        info!(%address, "listening");
        let mailbox = ctx.mailbox().clone();
        self.listeners.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, address)) => {
                        if mailbox.send(PoolMessage::Incoming { stream, address }).is_err() {
                            break;
                        }
                    }
                    Err(NetworkError::NotConnected) => break,
                    Err(e) => {
                        debug!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }));
        true
    }

    async fn on_message(&mut self, id: PeerId, message: NetworkMessage, ctx: &Context<PoolMessage>) {
        let active = match self.peers.get_mut(&id) {
            Some(record) => {
                record.last_seen = Instant::now();
                record.is_active()
            }
            None => return,
        };
        let command = message.command();
        trace!(%id, %command, "received");

        match message {
            NetworkMessage::Version(version) => self.on_version(id, version, ctx).await,
            NetworkMessage::Verack => {
                if let Some(record) = self.peers.get_mut(&id) {
                    record.verack_received = true;
                }
                self.check_handshake(id, ctx).await;
            }
            _ if !active => debug!(%id, %command, "ignored before handshake"),
            NetworkMessage::Ping(nonce) => {
                self.send_to(id, NetworkMessage::Pong(nonce));
            }
            NetworkMessage::Pong(nonce) => {
                if let Some(record) = self.peers.get_mut(&id) {
                    if record.ping.is_some_and(|(sent, _)| sent == nonce) {
                        record.ping = None;
                    }
                }
            }
            NetworkMessage::Headers(headers) => self.ingest_headers(headers, ctx).await,
            NetworkMessage::Inv(items) => {
                let announces_block = items
                    .iter()
                    .any(|i| matches!(i, Inventory::Block(_) | Inventory::WitnessBlock(_)));
                if announces_block && self.jobs.push(Job::GetHeaders) {
                    ctx.trigger();
                }
            }
            NetworkMessage::CFHeaders(msg) => match FilterHeadersBatch::try_from(msg) {
                Ok(batch) => self.route_filter(FilterSyncMessage::FilterHeaders(batch)),
                Err(e) => warn!(%id, "cfheaders rejected: {e}"),
            },
            NetworkMessage::CFilter(msg) => match ReceivedFilter::try_from(msg) {
                Ok(filter) => self.route_filter(FilterSyncMessage::Filter(filter)),
                Err(e) => warn!(%id, "cfilter rejected: {e}"),
            },
            NetworkMessage::Block(block) => match &self.routes.block_cache {
                Some(cache) => {
                    if !cache.submit(block) {
                        debug!(%id, "block cache refused block");
                    }
                }
                None => trace!(%id, "no block route"),
            },
            NetworkMessage::Addr(list) => {
                let addresses: Vec<PeerAddress> = list
                    .into_iter()
                    .filter_map(|(_, a)| {
                        a.socket_addr()
                            .ok()
                            .map(|s| PeerAddress::tcp(Protocol::Bitcoin, s, a.services))
                    })
                    .collect();
                if !addresses.is_empty() {
                    debug!(%id, count = addresses.len(), "learned addresses");
                    if let Err(e) = self.store.insert(addresses).await {
                        error!("storing peer addresses failed: {e:#}");
                    }
                }
            }
            other => trace!(%id, command = %other.command(), "unhandled"),
        }
    }

    async fn on_version(&mut self, id: PeerId, version: VersionMessage, ctx: &Context<PoolMessage>) {
        let Some(record) = self.peers.get_mut(&id) else {
            return;
        };
        if record.version_received {
            debug!(%id, "duplicate version");
            return;
        }
        record.version_received = true;
        record.services = version.services;
        record.start_height = version.start_height;
        debug!(
            %id,
            version = version.version,
            agent = %version.user_agent,
            height = version.start_height,
            "version received"
        );
        let reply_version = !record.version_sent;
        if reply_version {
            self.send_version(id).await;
        }
        self.send_to(id, NetworkMessage::Verack);
        self.check_handshake(id, ctx).await;
    }

    async fn check_handshake(&mut self, id: PeerId, ctx: &Context<PoolMessage>) {
        let Some(record) = self.peers.get_mut(&id) else {
            return;
        };
        if record.state != PeerState::Handshaking || !record.handshake_done() {
            return;
        }
        record.enter(PeerState::Active);
        self.active.fetch_add(1, Ordering::AcqRel);
        record.answer(true);
        transmit(record, NetworkMessage::SendHeaders);
        let address = record.address.with_services(record.services);
        let origin = record.origin;

        info!(%id, peer = %address, services = %address.services(), "peer active");
        if origin != Origin::Incoming {
            if let Err(e) = self.store.confirm(&address).await {
                error!("recording peer failed: {e:#}");
            }
        }
        self.events.publish(Event::PeerConnected { id, address });
        self.jobs.push(Job::GetHeaders);
        ctx.trigger();
    }

    async fn ingest_headers(&mut self, headers: Vec<Header>, ctx: &Context<PoolMessage>) {
        if headers.is_empty() {
            return;
        }
        match self.headers.add_headers(&headers).await {
            Ok(reorg) => {
                if let Some(ancestor) = reorg {
                    info!(%ancestor, "best chain switched branches");
                    self.events.publish(Event::Reorg { ancestor });
                }
                match self.headers.best_chain().await {
                    Ok(best) => {
                        debug!(%best, count = headers.len(), "headers connected");
                        self.events.publish(Event::ChainUpdated { best });
                    }
                    Err(e) => error!("best chain unavailable: {e:#}"),
                }
                if headers.len() >= MAX_HEADERS_PER_MESSAGE && self.jobs.push(Job::GetHeaders) {
                    ctx.trigger();
                }
            }
            Err(e) => warn!(count = headers.len(), "headers rejected: {e:#}"),
        }
    }

    fn route_filter(&self, message: FilterSyncMessage) {
        match &self.routes.filter_sync {
            Some(mailbox) => {
                if let Err(e) = mailbox.send(message) {
                    debug!("filter sync refused message: {e}");
                }
            }
            None => trace!("no filter route"),
        }
    }

    /// Disconnect stalled handshakes and unanswered pings, queue pings on idle peers.
    fn check_peers(&mut self) {
        let timeouts = &self.config.timeouts;
        let mut stale = Vec::new();
        let mut idle = Vec::new();
        for (id, record) in &self.peers {
            match record.state {
                PeerState::Handshaking if record.since.elapsed() > timeouts.handshake => {
                    stale.push((*id, "handshake timed out"));
                }
                PeerState::Active => match record.ping {
                    Some((_, sent)) if sent.elapsed() > timeouts.heartbeat => {
                        stale.push((*id, "ping timed out"));
                    }
                    None if record.last_seen.elapsed() >= self.config.ping_interval => {
                        idle.push(*id);
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        for (id, reason) in stale {
            self.drop_peer(id, reason);
        }
        for id in idle {
            self.jobs.push(Job::Heartbeat(id));
        }
    }

    /// Whether a handshake or an unanswered ping still has a deadline to check.
    fn awaiting_reply(&self) -> bool {
        self.peers.values().any(|record| match record.state {
            PeerState::Handshaking => true,
            PeerState::Active => record.ping.is_some(),
            PeerState::Connecting | PeerState::Disconnected => false,
        })
    }

    /// Wake the pool when the next idle peer is due a ping.
    fn schedule_heartbeat(&mut self, ctx: &Context<PoolMessage>) {
        let interval = self.config.ping_interval;
        let due = self
            .peers
            .values()
            .filter(|record| record.is_active() && record.ping.is_none())
            .map(|record| record.last_seen + interval)
            .min();
        if let Some(timer) = self.heartbeat.take() {
            timer.abort();
        }
        let Some(due) = due else {
            return;
        };
        let mailbox = ctx.mailbox().clone();
        self.heartbeat = Some(tokio::spawn(async move {
            time::sleep_until(time::Instant::from_std(due)).await;
            mailbox.trigger();
        }));
    }

    async fn fill_slots(&mut self, ctx: &Context<PoolMessage>) {
        while self.open_slots() > 0 {
            let exclude = self.exclusions();
            match self.book.next(&*self.store, &exclude).await {
                Ok(Some(address)) => self.open(address, Origin::Maintained, None, ctx),
                Ok(None) => {
                    if let Some((seeds, port)) = self.book.start_resolving() {
                        debug!(count = seeds.len(), "resolving dns seeds");
                        let mailbox = ctx.mailbox().clone();
                        tokio::spawn(async move {
                            let found = resolve_seeds(seeds, port).await;
                            let _ = mailbox.send(PoolMessage::SeedsResolved(found));
                        });
                    }
                    break;
                }
                Err(e) => {
                    error!("peer database lookup failed: {e:#}");
                    break;
                }
            }
        }
    }

    fn pick_peer(&mut self, needs_filters: bool) -> Option<PeerId> {
        let active: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_active())
            .map(|(id, _)| *id)
            .collect();
        let serving: Vec<PeerId> = active
            .iter()
            .copied()
            .filter(|id| self.peers.get(id).is_some_and(PeerRecord::serves_filters))
            .collect();
        let candidates = if needs_filters && !serving.is_empty() {
            serving
        } else {
            active
        };
        if candidates.is_empty() {
            return None;
        }
        self.cursor = self.cursor.wrapping_add(1);
        Some(candidates[self.cursor % candidates.len()])
    }

    /// Send one job. Returns `false` when no peer could take it.
    async fn send_job(&mut self, job: &Job) -> bool {
        let message = match job {
            Job::Heartbeat(id) => {
                let nonce: u64 = rand::random();
                if let Some(record) = self.peers.get_mut(id).filter(|r| r.is_active()) {
                    record.ping = Some((nonce, Instant::now()));
                    transmit(record, NetworkMessage::Ping(nonce));
                }
                return true;
            }
            Job::BroadcastTransaction(tx) => {
                let mut sent = 0;
                for record in self.peers.values().filter(|r| r.is_active()) {
                    if transmit(record, NetworkMessage::Tx(tx.clone())) {
                        sent += 1;
                    }
                }
                debug!(txid = %tx.compute_txid(), peers = sent, "transaction broadcast");
                return sent > 0;
            }
            Job::GetHeaders => match block_locator(&*self.headers).await {
                Ok(locator) => NetworkMessage::GetHeaders(GetHeadersMessage::new(
                    locator,
                    BlockHash::all_zeros(),
                )),
                Err(e) => {
                    error!("building block locator failed: {e:#}");
                    return true;
                }
            },
            Job::GetFilterHeaders {
                filter_type,
                start_height,
                stop_hash,
            } => NetworkMessage::GetCFHeaders(GetCFHeaders {
                filter_type: filter_type.wire_code(),
                start_height: *start_height,
                stop_hash: *stop_hash,
            }),
            Job::GetFilters {
                filter_type,
                start_height,
                stop_hash,
            } => NetworkMessage::GetCFilters(GetCFilters {
                filter_type: filter_type.wire_code(),
                start_height: *start_height,
                stop_hash: *stop_hash,
            }),
            Job::GetBlock(hash) => NetworkMessage::GetData(vec![Inventory::WitnessBlock(*hash)]),
        };
        let Some(id) = self.pick_peer(job.needs_filters()) else {
            return false;
        };
        debug!(%id, kind = ?job.kind(), "dispatching");
        self.send_to(id, message)
    }

    async fn dispatch_jobs(&mut self) {
        if self.active.load(Ordering::Acquire) == 0 {
            return;
        }
        for kind in JobKind::ALL {
            while let Some(job) = self.jobs.pop(kind) {
                if !self.send_job(&job).await {
                    self.jobs.push_front(job);
                    break;
                }
            }
        }
    }
}

fn transmit(record: &PeerRecord, message: NetworkMessage) -> bool {
    match &record.connection {
        Some(connection) => {
            // Write failures come back as a disconnect event.
            let _ = connection.transmit(message);
            true
        }
        None => false,
    }
}

fn version_message(user_agent: &str, remote: &PeerAddress, height: u32) -> VersionMessage {
    let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
    let receiver = Address::new(
        &remote.socket_addr().unwrap_or(unspecified),
        remote.services(),
    );
    let sender = Address::new(&unspecified, OUR_SERVICES);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64);
    let mut version = VersionMessage::new(
        OUR_SERVICES,
        timestamp,
        receiver,
        sender,
        rand::random(),
        user_agent.to_string(),
        i32::try_from(height).unwrap_or(i32::MAX),
    );
    version.version = PROTOCOL_VERSION;
    version
}

#[async_trait]
impl<S, H> Actor for PeerPool<S, H>
where
    S: PeerStore + 'static,
    H: HeaderOracle + 'static,
{
    type Message = PoolMessage;
    const NAME: &'static str = "peer-pool";

    async fn started(&mut self, ctx: &Context<PoolMessage>) {
        let policy = match self.store.block_policy().await {
            Ok(policy) => policy,
            Err(e) => {
                error!("block policy unavailable: {e:#}");
                BlockPolicy::None
            }
        };
        self.target = target_peers(policy, self.config.network, self.config.target_peers);
        info!(target = self.target, ?policy, "peer pool started");

        for address in self.config.listen.clone() {
            self.listen(address, ctx).await;
        }
        ctx.trigger();
    }

    async fn handle(&mut self, message: PoolMessage, ctx: &Context<PoolMessage>) {
        match message {
            PoolMessage::Peer(PeerEvent::Message(id, message)) => {
                self.on_message(id, message, ctx).await
            }
            PoolMessage::Peer(PeerEvent::Disconnected(id, reason)) => {
                self.drop_peer(id, &reason);
                ctx.trigger();
            }
            PoolMessage::Connected {
                id,
                connection,
                result,
            } => self.on_connected(id, connection, result, ctx).await,
            PoolMessage::AddPeer { address, reply } => self.on_add_peer(address, reply, ctx),
            PoolMessage::Listen { address, reply } => {
                let ok = self.listen(address, ctx).await;
                let _ = reply.send(ok);
            }
            PoolMessage::Incoming { stream, address } => self.on_incoming(stream, address, ctx),
            PoolMessage::Disconnect(id) => {
                self.drop_peer(id, "requested");
                ctx.trigger();
            }
            PoolMessage::Job(job) => {
                if self.active.load(Ordering::Acquire) == 0 {
                    debug!(kind = ?job.kind(), "no active peers, job dropped");
                } else if self.jobs.push(job) {
                    ctx.trigger();
                }
            }
            PoolMessage::SeedsResolved(addresses) => {
                debug!(count = addresses.len(), "dns seeds resolved");
                self.book.add_seeds(addresses);
                ctx.trigger();
            }
        }
    }

    async fn tick(&mut self, ctx: &Context<PoolMessage>) -> bool {
        self.check_peers();
        if !ctx.is_stopping() {
            self.fill_slots(ctx).await;
        }
        self.dispatch_jobs().await;
        let queued = !self.jobs.is_empty() && self.active.load(Ordering::Acquire) > 0;
        if queued || self.open_slots() > 0 || self.awaiting_reply() {
            return true;
        }
        if !ctx.is_stopping() {
            self.schedule_heartbeat(ctx);
        }
        false
    }

    async fn stopping(&mut self) {
        if let Some(timer) = self.heartbeat.take() {
            timer.abort();
        }
        for task in self.listeners.drain(..) {
            task.abort();
        }
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.drop_peer(id, "shutting down");
        }
    }
}

/// Caller-side handle on the pool. Every request fails fast (returns
/// `false`) while no peer is active.
#[derive(Debug, Clone)]
pub struct PeerPoolHandle {
    mailbox: Mailbox<PoolMessage>,
    active: Arc<AtomicUsize>,
    confirm: Duration,
}

impl PeerPoolHandle {
    /// Kick the maintenance tick.
    pub fn connect(&self) {
        self.mailbox.trigger();
    }

    /// Connect to `address` and wait (bounded) for the handshake to finish.
    pub async fn add_peer(&self, address: PeerAddress) -> bool {
        self.mailbox
            .ask(|reply| PoolMessage::AddPeer { address, reply }, self.confirm)
            .await
            .unwrap_or(false)
    }

    /// Accept inbound peers on `address`; waits (bounded) for the bind.
    pub async fn listen(&self, address: PeerAddress) -> bool {
        self.mailbox
            .ask(|reply| PoolMessage::Listen { address, reply }, self.confirm)
            .await
            .unwrap_or(false)
    }

    /// Tear down peer `id`.
    pub fn disconnect(&self, id: PeerId) -> bool {
        self.mailbox.send(PoolMessage::Disconnect(id)).is_ok()
    }

    /// Peers that completed their handshake.
    pub fn active_peers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Relay `tx` to every active peer.
    pub fn broadcast_transaction(&self, tx: Transaction) -> bool {
        self.submit(Job::BroadcastTransaction(tx))
    }

    fn submit(&self, job: Job) -> bool {
        if self.active_peers() == 0 {
            trace!(kind = ?job.kind(), "no active peers");
            return false;
        }
        self.mailbox.send(PoolMessage::Job(job)).is_ok()
    }
}

impl FilterSource for PeerPoolHandle {
    fn request_headers(&self) -> bool {
        self.submit(Job::GetHeaders)
    }

    fn request_filter_headers(
        &self,
        filter_type: FilterType,
        start_height: u32,
        stop_hash: BlockHash,
    ) -> bool {
        self.submit(Job::GetFilterHeaders {
            filter_type,
            start_height,
            stop_hash,
        })
    }

    fn request_filters(&self, filter_type: FilterType, start_height: u32, stop_hash: BlockHash) -> bool {
        self.submit(Job::GetFilters {
            filter_type,
            start_height,
            stop_hash,
        })
    }
}

impl BlockSource for PeerPoolHandle {
    fn request_block(&self, hash: BlockHash) -> bool {
        self.submit(Job::GetBlock(hash))
    }
}
