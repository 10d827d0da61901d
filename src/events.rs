//! Broadcast notifications about state changes (new filters, reorgs, peers,
//! balances). Actors subscribe by forwarding the events they care about into
//! their own mailbox.
use bitcoin::Amount;
use tokio::sync::broadcast;

use crate::{
    actor::Mailbox,
    peer::PeerAddress,
    types::{FilterType, PeerId, Position},
    wallet::Subchain,
};

const EVENT_CAPACITY: usize = 1_024;

/// A state-change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The filter-content tip advanced.
    NewFilter {
        /// Filter type whose tip moved.
        filter_type: FilterType,
        /// New tip.
        position: Position,
    },
    /// The filter-header tip advanced.
    NewFilterHeader {
        /// Filter type whose tip moved.
        filter_type: FilterType,
        /// New tip.
        position: Position,
    },
    /// The best block-header chain changed.
    ChainUpdated {
        /// New best position.
        best: Position,
    },
    /// The best chain switched branches; everything above `ancestor` is stale.
    Reorg {
        /// Last block shared by the old and new branch.
        ancestor: Position,
    },
    /// A peer finished its handshake.
    PeerConnected {
        /// Pool-assigned identifier.
        id: PeerId,
        /// Remote address.
        address: PeerAddress,
    },
    /// A peer was removed from the pool.
    PeerDisconnected {
        /// Pool-assigned identifier.
        id: PeerId,
    },
    /// Unspent total of a subchain changed.
    BalanceChanged {
        /// Subchain whose balance changed.
        subchain: Subchain,
        /// New unspent total.
        balance: Amount,
    },
    /// A subchain finished scanning up to `position`.
    ScanProgress {
        /// Scanned subchain.
        subchain: Subchain,
        /// Last tested block.
        position: Position,
    },
}

/// Publish/subscribe primitive shared by all actors.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event; a bus without subscribers drops it.
    pub fn publish(&self, event: Event) {
        tracing::trace!(?event, "publish");
        let _ = self.tx.send(event);
    }

    /// Raw subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Forward events selected by `select` into `mailbox` until either side closes.
    pub fn forward<M, F>(&self, mailbox: Mailbox<M>, mut select: F)
    where
        M: Send + 'static,
        F: FnMut(Event) -> Option<M> + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(message) = select(event) {
                            if mailbox.send(message).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(actor = mailbox.name(), skipped, "event forwarder lagged");
                        mailbox.trigger();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
