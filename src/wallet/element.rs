//! Watched elements, unspent outputs and confirmed transactions.
use std::fmt;

use bitcoin::{Amount, OutPoint, PublicKey, ScriptBuf, TxOut, Txid};

use crate::types::Position;

/// Independent key sequence of a wallet account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subchain {
    /// Externally handed-out receive keys.
    Receive,
    /// Internal change keys.
    Change,
}

impl Subchain {
    /// Every subchain, in scheduling order.
    pub const ALL: [Subchain; 2] = [Subchain::Receive, Subchain::Change];
}

impl fmt::Display for Subchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subchain::Receive => f.write_str("receive"),
            Subchain::Change => f.write_str("change"),
        }
    }
}

/// Output template derived from one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    /// Pay to public key.
    P2pk,
    /// Pay to public key hash.
    P2pkh,
    /// Pay to witness public key hash (compressed keys only).
    P2wpkh,
}

/// Identity of a watched element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId {
    /// Owning subchain.
    pub subchain: Subchain,
    /// Key index within the subchain.
    pub index: u32,
    /// Output template.
    pub kind: ElementKind,
}

/// A script the wallet watches for, with the key it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedElement {
    id: ElementId,
    key: PublicKey,
    script: ScriptBuf,
}

impl WatchedElement {
    /// Element of `kind` for `key`. Returns `None` for a witness template of
    /// an uncompressed key.
    pub fn new(subchain: Subchain, index: u32, kind: ElementKind, key: PublicKey) -> Option<Self> {
        let script = match kind {
            ElementKind::P2pk => ScriptBuf::new_p2pk(&key),
            ElementKind::P2pkh => ScriptBuf::new_p2pkh(&key.pubkey_hash()),
            ElementKind::P2wpkh => ScriptBuf::new_p2wpkh(&key.wpubkey_hash().ok()?),
        };
        Some(Self {
            id: ElementId {
                subchain,
                index,
                kind,
            },
            key,
            script,
        })
    }

    /// Every element a key produces.
    pub fn derive(subchain: Subchain, index: u32, key: PublicKey) -> Vec<Self> {
        [ElementKind::P2pk, ElementKind::P2pkh, ElementKind::P2wpkh]
            .into_iter()
            .filter_map(|kind| Self::new(subchain, index, kind, key))
            .collect()
    }

    /// Identity.
    pub fn id(&self) -> ElementId {
        self.id
    }

    /// Source key.
    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Output script paying to this element.
    pub fn script(&self) -> &ScriptBuf {
        &self.script
    }

    /// Bytes tested against block filters.
    pub fn pattern(&self) -> &[u8] {
        self.script.as_bytes()
    }
}

/// An unspent output owned by a watched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Transaction output reference.
    pub outpoint: OutPoint,
    /// The output itself.
    pub txout: TxOut,
    /// Element the output pays to.
    pub owner: ElementId,
    /// Block that confirmed the output.
    pub position: Position,
}

impl Utxo {
    /// Output value.
    pub fn value(&self) -> Amount {
        self.txout.value
    }

    /// Serialized outpoint as indexed by extended filters.
    pub fn outpoint_pattern(&self) -> Vec<u8> {
        bitcoin::consensus::serialize(&self.outpoint)
    }
}

/// A transaction that pays to or spends from the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedTx {
    /// Transaction id.
    pub txid: Txid,
    /// Outputs paying to watched elements.
    pub created: Vec<Utxo>,
    /// Wallet outputs consumed by its inputs.
    pub spent: Vec<OutPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn key(seed: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        PublicKey::new(sk.public_key(&secp))
    }

    #[test]
    fn compressed_keys_yield_three_templates() {
        let elements = WatchedElement::derive(Subchain::Receive, 4, key(7));
        let kinds: Vec<_> = elements.iter().map(|e| e.id().kind).collect();
        assert_eq!(
            kinds,
            vec![ElementKind::P2pk, ElementKind::P2pkh, ElementKind::P2wpkh]
        );
        assert!(elements[1].script().is_p2pkh());
        assert!(elements[2].script().is_p2wpkh());
        assert!(elements.iter().all(|e| e.id().index == 4));
    }

    #[test]
    fn uncompressed_keys_skip_witness_template() {
        let mut uncompressed = key(9);
        uncompressed.compressed = false;
        let elements = WatchedElement::derive(Subchain::Change, 0, uncompressed);
        assert_eq!(elements.len(), 2);
    }
}
