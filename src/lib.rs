#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! niebla-spv: a compact block filter (BIP157/158) light client.
//!
//! The client is a handful of single-threaded actors talking over mailboxes:
//!
//! - [`PeerPool`]: keeps peer connections open (TCP or in-process), runs the
//!   `version`/`verack` handshake and hands requests to active peers.
//! - [`FilterSync`]: keeps the filter-header chain and the filter chain level
//!   with the best block-header chain, verifying every batch.
//! - [`BlockCache`]: downloads blocks on demand and memoizes them.
//! - [`WalletScan`]: derives scripts from wallet keys, tests filters against
//!   them and records the transactions of matching blocks.
//!
//! CPU-bound work (filter matching, key derivation, filter construction) runs
//! on a shared [`WorkerPool`]; results come back as mailbox messages.
//!
//! ## What you implement
//! - [`HeaderOracle`]: the best block-header chain.
//! - [`FilterStore`], [`PeerStore`], [`WalletStore`]: persistence. In-memory
//!   versions live in [`store::memory`]; [`SqliteStore`] persists filters.
//! - [`KeySource`]: public keys of the wallet, per subchain.
//!
//! ## Minimal usage
//! ```rust,ignore
//! use std::sync::Arc;
//! use niebla_spv::prelude::*;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let config = Config::for_network(bitcoin::Network::Signet);
//!     let mut node = Node::start(
//!         config,
//!         Arc::new(MemoryFilterStore::new()),
//!         Arc::new(MemoryHeaders::new(bitcoin::Network::Signet)),
//!         Arc::new(MemoryPeerStore::new(BlockPolicy::None)),
//!         InprocHub::new(),
//!     )?;
//!     node.add_wallet(Arc::new(MemoryWalletStore::new()), Arc::new(MemoryKeys::new()))?;
//!     let mut events = node.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
/// Actor trait, mailboxes and the actor driver.
pub mod actor;

/// On-demand block download and memoization.
pub mod block_cache;

/// Node configuration.
pub mod config;

/// Error types.
pub mod error;

/// State-change notifications.
pub mod events;

/// Request seams to the peer pool and validated filter messages.
pub mod filter_source;

/// Filter sync engine.
pub mod filters;

/// Block header oracle.
pub mod headers;

/// Wallet key material.
pub mod hooks;

/// Logging setup.
pub mod logging;

/// Filter construction and matching.
pub mod matcher;

/// Actor wiring.
pub mod node;

/// Peer addresses and connections.
pub mod peer;

/// Pending results.
pub mod pending;

/// Peer pool manager.
pub mod pool;

/// Persistence layer (traits, in-memory and SQLite implementations).
pub mod store;

/// Shared value types.
pub mod types;

/// Wallet scan engine.
pub mod wallet;

/// Worker pool for CPU-bound jobs.
pub mod workers;

// Internal helpers:
mod cfheaders;

// Public re-exports
pub use actor::{Actor, ActorHandle, Context, Mailbox};
pub use block_cache::{BlockCache, BlockCacheHandle, BlockLoader};
pub use config::Config;
pub use error::{Error, NetworkError, SyncError};
pub use events::{Event, EventBus};
pub use filter_source::{BlockSource, FilterSource};
pub use filters::FilterSync;
pub use headers::HeaderOracle;
pub use hooks::KeySource;
pub use node::Node;
pub use peer::{InprocHub, PeerAddress, Protocol};
pub use pending::Pending;
pub use pool::{PeerPool, PeerPoolHandle};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use store::{FilterStore, PeerStore, WalletStore};
pub use types::{BlockPolicy, FilterType, PeerId, Position};
pub use wallet::{Subchain, WalletScan};
pub use workers::WorkerPool;

/// Convenience prelude for end users.
pub mod prelude {
    #[cfg(feature = "store-sqlite")]
    pub use crate::SqliteStore;
    pub use crate::{
        store::{MemoryFilterStore, MemoryHeaders, MemoryKeys, MemoryPeerStore, MemoryWalletStore},
        BlockPolicy, Config, Event, FilterStore, FilterType, HeaderOracle, InprocHub, KeySource,
        Node, PeerAddress, PeerStore, Position, Subchain, WalletStore,
    };
}
