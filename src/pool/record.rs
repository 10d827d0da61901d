//! Per-peer bookkeeping owned by the pool actor.
use std::time::Instant;

use bitcoin::p2p::ServiceFlags;
use tokio::sync::oneshot;

use crate::peer::{Connection, PeerAddress};

/// Lifecycle of one connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Dialling the transport.
    Connecting,
    /// Exchanging `version`/`verack`.
    Handshaking,
    /// Serving requests.
    Active,
    /// Torn down; the record is removed right after.
    Disconnected,
}

/// Where the slot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Picked by the maintenance tick; counts toward the target.
    Maintained,
    /// Requested through `AddPeer`.
    Manual,
    /// Accepted on a listen address.
    Incoming,
}

/// What the pool knows about one peer.
#[derive(Debug)]
pub struct PeerRecord {
    pub(crate) address: PeerAddress,
    pub(crate) origin: Origin,
    pub(crate) state: PeerState,
    pub(crate) connection: Option<Box<Connection>>,
    pub(crate) since: Instant,
    pub(crate) last_seen: Instant,
    pub(crate) version_sent: bool,
    pub(crate) version_received: bool,
    pub(crate) verack_received: bool,
    pub(crate) services: ServiceFlags,
    pub(crate) start_height: i32,
    pub(crate) ping: Option<(u64, Instant)>,
    pub(crate) reply: Option<oneshot::Sender<bool>>,
}

impl PeerRecord {
    pub(crate) fn new(address: PeerAddress, origin: Origin) -> Self {
        let now = Instant::now();
        Self {
            services: address.services(),
            address,
            origin,
            state: PeerState::Connecting,
            connection: None,
            since: now,
            last_seen: now,
            version_sent: false,
            version_received: false,
            verack_received: false,
            start_height: 0,
            ping: None,
            reply: None,
        }
    }

    /// Remote address.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Current state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Services from the peer's `version`, or from its address before that.
    pub fn services(&self) -> ServiceFlags {
        self.services
    }

    /// Whether the peer serves compact filters.
    pub fn serves_filters(&self) -> bool {
        self.services.has(ServiceFlags::COMPACT_FILTERS)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == PeerState::Active
    }

    pub(crate) fn handshake_done(&self) -> bool {
        self.version_received && self.verack_received
    }

    pub(crate) fn enter(&mut self, state: PeerState) {
        self.state = state;
        self.since = Instant::now();
    }

    /// Answer a waiting `AddPeer` caller, if any.
    pub(crate) fn answer(&mut self, ok: bool) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(ok);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Protocol;

    #[tokio::test]
    async fn answers_once() {
        let address = PeerAddress::inproc(Protocol::Bitcoin, "a", ServiceFlags::COMPACT_FILTERS);
        let mut record = PeerRecord::new(address, Origin::Manual);
        assert!(record.serves_filters());
        let (tx, rx) = oneshot::channel();
        record.reply = Some(tx);
        record.answer(true);
        record.answer(false);
        assert_eq!(rx.await, Ok(true));

        record.version_received = true;
        assert!(!record.handshake_done());
        record.verack_received = true;
        assert!(record.handshake_done());
    }
}
