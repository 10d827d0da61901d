//! Channel-backed pending results.
//!
//! A [`Pending`] is handed out before a value exists (a block that still has
//! to arrive from a peer, say). Actors poll it from their tick with
//! [`Pending::try_get`]; plain tasks can [`Pending::wait`] for it. Neither
//! blocks a worker thread.
use tokio::sync::watch;

use crate::error::ActorError;

/// Read side of a pending value. Cheap to clone; every clone sees the same value.
#[derive(Debug, Clone)]
pub struct Pending<T> {
    rx: watch::Receiver<Option<T>>,
}

/// Write side of a pending value.
#[derive(Debug)]
pub struct Resolver<T> {
    tx: watch::Sender<Option<T>>,
}

/// Create a linked resolver/pending pair.
pub fn pending<T>() -> (Resolver<T>, Pending<T>) {
    let (tx, rx) = watch::channel(None);
    (Resolver { tx }, Pending { rx })
}

impl<T: Clone> Pending<T> {
    /// A handle that is already resolved.
    pub fn ready(value: T) -> Self {
        let (_tx, rx) = watch::channel(Some(value));
        Self { rx }
    }

    /// Whether the value has arrived.
    pub fn is_ready(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The value, if it has arrived.
    pub fn try_get(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    /// Whether the resolver went away without resolving; such a handle never becomes ready.
    pub fn is_abandoned(&self) -> bool {
        !self.is_ready() && self.rx.has_changed().is_err()
    }

    /// Wait for the value. Fails if the resolver is dropped without resolving.
    pub async fn wait(mut self) -> Result<T, ActorError> {
        let value = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ActorError::Abandoned)?;
        value.clone().ok_or(ActorError::Abandoned)
    }
}

impl<T> Resolver<T> {
    /// Publish the value to every handle.
    pub fn resolve(self, value: T) {
        self.tx.send_replace(Some(value));
    }

    /// Another handle for the same value.
    pub fn subscribe(&self) -> Pending<T> {
        Pending {
            rx: self.tx.subscribe(),
        }
    }

    /// Whether any handle is still interested.
    pub fn is_wanted(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_every_clone() {
        let (resolver, first) = pending::<u32>();
        let second = resolver.subscribe();
        let third = first.clone();
        assert!(!first.is_ready());

        resolver.resolve(7);

        assert_eq!(first.try_get(), Some(7));
        assert_eq!(second.wait().await, Ok(7));
        assert_eq!(third.wait().await, Ok(7));
    }

    #[tokio::test]
    async fn dropped_resolver_abandons() {
        let (resolver, handle) = pending::<u32>();
        assert!(!handle.is_abandoned());
        drop(resolver);
        assert!(handle.is_abandoned());
        assert_eq!(handle.wait().await, Err(ActorError::Abandoned));
    }

    #[test]
    fn ready_handle() {
        let handle = Pending::ready("block");
        assert!(handle.is_ready());
        assert_eq!(handle.try_get(), Some("block"));
    }
}
