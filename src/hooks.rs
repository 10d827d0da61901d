//! Wallet glue: where watched keys come from.
use async_trait::async_trait;
use bitcoin::PublicKey;

use crate::wallet::Subchain;

/// Supplies the public keys of each subchain. The wallet scan engine
/// indexes every key up to `key_count` into watched elements.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Number of keys generated so far for `subchain`.
    async fn key_count(&self, subchain: Subchain) -> anyhow::Result<u32>;

    /// Public key at `index` of `subchain`.
    async fn public_key(&self, subchain: Subchain, index: u32) -> anyhow::Result<PublicKey>;
}
