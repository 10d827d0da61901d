//! Node configuration passed to every actor at construction.
use std::time::Duration;

use bitcoin::Network;

use crate::{
    error::ConfigError,
    peer::{PeerAddress, Protocol},
    types::FilterType,
};

/// Filter headers requested per `getcfheaders`.
pub const MAX_FILTER_HEADERS_PER_REQUEST: u32 = 2_000;
/// Filters requested per `getcfilters`.
pub const MAX_FILTERS_PER_REQUEST: u32 = 1_000;
/// Heights walked by one wallet scan job.
pub const SCAN_WINDOW: u32 = 10_000;
/// How far back a confirmed match rewinds the scan position.
pub const RESCAN_DEPTH: u32 = 1_000;

/// Tick spacing for each actor.
#[derive(Debug, Clone)]
pub struct Intervals {
    /// Peer pool maintenance tick.
    pub pool: Duration,
    /// Filter sync tick.
    pub filters: Duration,
    /// Wallet scan tick.
    pub wallet: Duration,
    /// Block cache flush tick.
    pub block_cache: Duration,
}

/// Expiry of outstanding requests and bounded waits.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// In-flight `getcfheaders` request.
    pub filter_headers: Duration,
    /// In-flight `getcfilters` window.
    pub filters: Duration,
    /// `version`/`verack` exchange.
    pub handshake: Duration,
    /// Time a peer has to answer a ping.
    pub heartbeat: Duration,
    /// Outstanding `getdata` for a block.
    pub block: Duration,
    /// How long `AddPeer`/`Listen` callers wait for the pool to confirm.
    pub confirm: Duration,
    /// Time allowed for actors to drain during shutdown.
    pub shutdown: Duration,
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Chain to follow.
    pub network: Network,
    /// Filter type synced from the network and scanned by the wallet.
    pub filter_type: FilterType,
    /// Peer tried first when filling connection slots.
    pub default_peer: Option<PeerAddress>,
    /// Protocol preferred when picking addresses from the peer database.
    pub preferred_protocol: Option<Protocol>,
    /// DNS seeds resolved when the database has no usable address.
    pub dns_seeds: Vec<String>,
    /// Addresses to accept inbound connections on at startup.
    pub listen: Vec<PeerAddress>,
    /// Explicit target peer count; derived from the block policy when unset.
    pub target_peers: Option<usize>,
    /// User agent advertised in `version`.
    pub user_agent: String,
    /// Interval between pings on an idle connection.
    pub ping_interval: Duration,
    /// Actor tick spacing.
    pub intervals: Intervals,
    /// Request expiry.
    pub timeouts: Timeouts,
    /// Size of the shared worker pool.
    pub worker_threads: usize,
    /// Maximum blocks memoized by the block cache.
    pub block_cache_capacity: usize,
    /// Height the wallet starts scanning from.
    pub birth_height: u32,
}

impl Config {
    /// Defaults for `network`.
    pub fn for_network(network: Network) -> Self {
        let worker_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            network,
            filter_type: FilterType::Basic,
            default_peer: None,
            preferred_protocol: None,
            dns_seeds: default_dns_seeds(network)
                .iter()
                .map(|s| s.to_string())
                .collect(),
            listen: Vec::new(),
            target_peers: None,
            user_agent: format!("/niebla-spv:{}/", env!("CARGO_PKG_VERSION")),
            ping_interval: Duration::from_secs(120),
            intervals: Intervals {
                pool: Duration::from_secs(1),
                filters: Duration::from_millis(250),
                wallet: Duration::from_millis(250),
                block_cache: Duration::from_millis(500),
            },
            timeouts: Timeouts {
                filter_headers: Duration::from_secs(30),
                filters: Duration::from_secs(30),
                handshake: Duration::from_secs(10),
                heartbeat: Duration::from_secs(60),
                block: Duration::from_secs(60),
                confirm: Duration::from_secs(10),
                shutdown: Duration::from_secs(5),
            },
            worker_threads,
            block_cache_capacity: 256,
            birth_height: 0,
        }
    }

    /// Set the peer tried first.
    pub fn with_default_peer(mut self, peer: PeerAddress) -> Self {
        self.default_peer = Some(peer);
        self
    }

    /// Set the preferred protocol.
    pub fn with_preferred_protocol(mut self, protocol: Protocol) -> Self {
        self.preferred_protocol = Some(protocol);
        self
    }

    /// Replace the DNS seed list.
    pub fn with_dns_seeds<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dns_seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    /// Add a listen address.
    pub fn with_listen(mut self, address: PeerAddress) -> Self {
        self.listen.push(address);
        self
    }

    /// Override the target peer count.
    pub fn with_target_peers(mut self, target: usize) -> Self {
        self.target_peers = Some(target);
        self
    }

    /// Set the default filter type.
    pub fn with_filter_type(mut self, filter_type: FilterType) -> Self {
        self.filter_type = filter_type;
        self
    }

    /// Set the wallet birth height.
    pub fn with_birth_height(mut self, height: u32) -> Self {
        self.birth_height = height;
        self
    }

    /// Set every actor tick interval to `interval`.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.intervals = Intervals {
            pool: interval,
            filters: interval,
            wallet: interval,
            block_cache: interval,
        };
        self
    }

    /// Set the worker pool size.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Check the configuration for values the actors cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Zero("worker_threads"));
        }
        if self.block_cache_capacity == 0 {
            return Err(ConfigError::Zero("block_cache_capacity"));
        }
        for (name, value) in [
            ("timeouts.filter_headers", self.timeouts.filter_headers),
            ("timeouts.filters", self.timeouts.filters),
            ("timeouts.handshake", self.timeouts.handshake),
            ("timeouts.confirm", self.timeouts.confirm),
            ("timeouts.block", self.timeouts.block),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.timeouts.heartbeat >= self.ping_interval {
            return Err(ConfigError::Invalid(
                "timeouts.heartbeat",
                "must be shorter than ping_interval".to_string(),
            ));
        }
        if self.listen.iter().any(|a| a.port() == 0 && !a.is_inproc()) {
            return Err(ConfigError::Invalid(
                "listen",
                "TCP listen addresses need a port".to_string(),
            ));
        }
        Ok(())
    }
}

/// DNS seeds shipped for each network.
pub fn default_dns_seeds(network: Network) -> &'static [&'static str] {
    match network {
        Network::Bitcoin => &[
            "seed.bitcoin.sipa.be",
            "dnsseed.bluematt.me",
            "seed.bitcoinstats.com",
            "seed.bitcoin.jonasschnelli.ch",
            "seed.btc.petertodd.net",
        ],
        Network::Testnet => &[
            "testnet-seed.bitcoin.jonasschnelli.ch",
            "seed.tbtc.petertodd.net",
            "testnet-seed.bluematt.me",
        ],
        Network::Signet => &["seed.signet.bitcoin.sprovoost.nl"],
        _ => &[],
    }
}

/// Default P2P port for each network.
pub fn default_port(network: Network) -> u16 {
    match network {
        Network::Bitcoin => 8333,
        Network::Testnet => 18333,
        Network::Signet => 38333,
        _ => 18444,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        for network in [Network::Bitcoin, Network::Testnet, Network::Regtest] {
            assert!(Config::for_network(network).validate().is_ok());
        }
        assert!(Config::for_network(Network::Regtest).dns_seeds.is_empty());
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = Config::for_network(Network::Regtest).with_worker_threads(0);
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("worker_threads")));
    }
}
