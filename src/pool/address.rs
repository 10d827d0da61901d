//! Target peer count and the address selection cascade.
use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bitcoin::{p2p::ServiceFlags, Network};
use tracing::{debug, warn};

use crate::{
    config::Config,
    peer::{PeerAddress, Protocol},
    store::PeerStore,
    types::BlockPolicy,
};

/// How long resolved seed addresses are trusted before resolving again.
const SEED_REFRESH: Duration = Duration::from_secs(600);

/// Connections the pool keeps open. An explicit setting wins; regtest is an
/// isolated network and gets none by default.
pub fn target_peers(policy: BlockPolicy, network: Network, configured: Option<usize>) -> usize {
    if let Some(target) = configured {
        return target;
    }
    if network == Network::Regtest {
        return 0;
    }
    match policy {
        BlockPolicy::All => 8,
        BlockPolicy::Cache => 2,
        BlockPolicy::None => 1,
    }
}

/// Picks the next address to dial: the configured default peer, then a
/// filter-serving peer of the preferred protocol, then a DNS seed result,
/// then any address the peer database knows.
#[derive(Debug)]
pub struct AddressBook {
    default_peer: Option<PeerAddress>,
    preferred: Option<Protocol>,
    dns_seeds: Vec<String>,
    port: u16,
    seeds: Vec<PeerAddress>,
    resolving: bool,
    resolved_at: Option<Instant>,
}

impl AddressBook {
    /// Book for `config`; seeds resolve to `config.network`'s default port.
    pub fn new(config: &Config) -> Self {
        Self {
            default_peer: config.default_peer.clone(),
            preferred: config.preferred_protocol,
            dns_seeds: config.dns_seeds.clone(),
            port: crate::config::default_port(config.network),
            seeds: Vec::new(),
            resolving: false,
            resolved_at: None,
        }
    }

    /// Next address not in `exclude`.
    pub async fn next<S>(&mut self, store: &S, exclude: &[PeerAddress]) -> anyhow::Result<Option<PeerAddress>>
    where
        S: PeerStore + ?Sized,
    {
        let excluded = |a: &PeerAddress| exclude.iter().any(|e| e.key() == a.key());

        if let Some(peer) = self.default_peer.as_ref().filter(|p| !excluded(p)) {
            debug!(%peer, "using default peer");
            return Ok(Some(peer.clone()));
        }
        if let Some(peer) = store
            .find(self.preferred, ServiceFlags::COMPACT_FILTERS, exclude)
            .await?
        {
            debug!(%peer, "using preferred peer");
            return Ok(Some(peer));
        }
        if let Some(i) = self.seeds.iter().position(|s| !excluded(s)) {
            let peer = self.seeds.swap_remove(i);
            debug!(%peer, "using seed peer");
            return Ok(Some(peer));
        }
        let fallback = store.find(None, ServiceFlags::NONE, exclude).await?;
        if let Some(peer) = &fallback {
            debug!(%peer, "using fallback peer");
        }
        Ok(fallback)
    }

    /// Whether a DNS lookup should start now. Marks the lookup as running.
    pub fn start_resolving(&mut self) -> Option<(Vec<String>, u16)> {
        let fresh = self
            .resolved_at
            .is_some_and(|at| at.elapsed() < SEED_REFRESH);
        if self.resolving || fresh || self.dns_seeds.is_empty() || !self.seeds.is_empty() {
            return None;
        }
        self.resolving = true;
        Some((self.dns_seeds.clone(), self.port))
    }

    /// Record the result of a DNS lookup.
    pub fn add_seeds(&mut self, addresses: Vec<SocketAddr>) {
        self.resolving = false;
        self.resolved_at = Some(Instant::now());
        for socket in addresses {
            let address = PeerAddress::tcp(Protocol::Bitcoin, socket, ServiceFlags::NONE);
            if !self.seeds.iter().any(|s| s.key() == address.key()) {
                self.seeds.push(address);
            }
        }
    }

    /// Seed addresses not handed out yet.
    pub fn seeds(&self) -> &[PeerAddress] {
        &self.seeds
    }
}

/// Resolve every seed host to socket addresses on `port`.
pub async fn resolve_seeds(seeds: Vec<String>, port: u16) -> Vec<SocketAddr> {
    let mut addresses = Vec::new();
    for seed in seeds {
        match tokio::net::lookup_host((seed.as_str(), port)).await {
            Ok(found) => {
                let before = addresses.len();
                addresses.extend(found);
                debug!(%seed, count = addresses.len() - before, "seed resolved");
            }
            Err(e) => warn!(%seed, "seed lookup failed: {e}"),
        }
    }
    addresses.sort();
    addresses.dedup();
    addresses
}
