//! Worker-pool halves of the wallet phases: testing filters against the
//! watched set and extracting wallet transactions from a block.
use std::collections::{HashMap, HashSet};

use bitcoin::{bip158, bip158::BlockFilter, Block, OutPoint, Script};

use super::element::{ConfirmedTx, ElementId, Utxo, WatchedElement};
use crate::{
    matcher::{filter_matches_any, matching},
    types::{FilterType, Position},
};

/// Byte patterns one scan job tests filters against.
#[derive(Debug, Clone, Default)]
pub struct Patterns {
    elements: Vec<(ElementId, Vec<u8>)>,
    spends: Vec<Vec<u8>>,
}

impl Patterns {
    /// Patterns for `elements` and, when the filter type indexes outpoints,
    /// the outpoints of `unspent`. Basic filters carry spent scripts, which
    /// the element scripts already cover.
    pub fn new(filter_type: FilterType, elements: &[WatchedElement], unspent: &[Utxo]) -> Self {
        let spends = if filter_type.indexes_outpoints() {
            unspent.iter().map(Utxo::outpoint_pattern).collect()
        } else {
            Vec::new()
        };
        Self {
            elements: elements
                .iter()
                .map(|e| (e.id(), e.pattern().to_vec()))
                .collect(),
            spends,
        }
    }

    /// Whether there is nothing to test.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.spends.is_empty()
    }

    fn all(&self) -> impl Iterator<Item = &[u8]> {
        self.elements
            .iter()
            .map(|(_, p)| p.as_slice())
            .chain(self.spends.iter().map(Vec::as_slice))
    }
}

/// A block whose filter matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit {
    /// Matched block.
    pub position: Position,
    /// Elements whose script is in the filter.
    pub elements: Vec<ElementId>,
    /// Whether a tracked outpoint is in the filter.
    pub spends: bool,
}

/// Result of one scan window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Last block whose filter was tested.
    pub tested_to: Option<Position>,
    /// Matching blocks, ascending.
    pub hits: Vec<ScanHit>,
}

/// Test every filter of the window against `patterns`.
pub fn scan_filters(
    patterns: &Patterns,
    filters: &[(Position, BlockFilter)],
) -> Result<ScanOutcome, bip158::Error> {
    let mut hits = Vec::new();
    if !patterns.is_empty() {
        for (position, filter) in filters {
            if !filter_matches_any(&position.hash, filter, patterns.all())? {
                continue;
            }
            let elements = matching(&position.hash, filter, &patterns.elements)?
                .into_iter()
                .copied()
                .collect();
            let spends = filter_matches_any(
                &position.hash,
                filter,
                patterns.spends.iter().map(Vec::as_slice),
            )?;
            hits.push(ScanHit {
                position: *position,
                elements,
                spends,
            });
        }
    }
    Ok(ScanOutcome {
        tested_to: filters.last().map(|(position, _)| *position),
        hits,
    })
}

/// Transactions of `block` paying to `elements` or spending `unspent`.
///
/// Outputs created earlier in the same block count as tracked for later spends.
pub fn match_block(
    position: Position,
    block: &Block,
    elements: &[WatchedElement],
    unspent: &[Utxo],
) -> Vec<ConfirmedTx> {
    let owners: HashMap<&Script, ElementId> = elements
        .iter()
        .map(|e| (e.script().as_script(), e.id()))
        .collect();
    let mut tracked: HashSet<OutPoint> = unspent.iter().map(|u| u.outpoint).collect();

    let mut confirmed = Vec::new();
    for tx in &block.txdata {
        let txid = tx.compute_txid();
        let spent: Vec<OutPoint> = if tx.is_coinbase() {
            Vec::new()
        } else {
            tx.input
                .iter()
                .map(|input| input.previous_output)
                .filter(|outpoint| tracked.contains(outpoint))
                .collect()
        };
        let created: Vec<Utxo> = tx
            .output
            .iter()
            .enumerate()
            .filter_map(|(vout, txout)| {
                owners
                    .get(txout.script_pubkey.as_script())
                    .map(|owner| Utxo {
                        outpoint: OutPoint::new(txid, vout as u32),
                        txout: txout.clone(),
                        owner: *owner,
                        position,
                    })
            })
            .collect();
        if created.is_empty() && spent.is_empty() {
            continue;
        }
        tracked.extend(created.iter().map(|u| u.outpoint));
        confirmed.push(ConfirmedTx {
            txid,
            created,
            spent,
        });
    }
    confirmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{matcher::build_filter, wallet::Subchain};
    use bitcoin::{
        absolute::LockTime,
        hashes::Hash,
        secp256k1::{Secp256k1, SecretKey},
        transaction, Amount, PublicKey, ScriptBuf, Transaction, TxIn, TxOut,
    };

    fn key(seed: u8) -> PublicKey {
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        PublicKey::new(sk.public_key(&Secp256k1::new()))
    }

    fn tx(inputs: Vec<OutPoint>, outputs: Vec<ScriptBuf>) -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    ..TxIn::default()
                })
                .collect(),
            output: outputs
                .into_iter()
                .map(|script_pubkey| TxOut {
                    value: Amount::from_sat(1_000),
                    script_pubkey,
                })
                .collect(),
        }
    }

    fn block(txdata: Vec<Transaction>) -> Block {
        let mut block = bitcoin::constants::genesis_block(bitcoin::Network::Regtest);
        block.txdata = txdata;
        block
    }

    #[test]
    fn finds_payments_and_spends_in_one_block() {
        let elements = WatchedElement::derive(Subchain::Receive, 0, key(1));
        let ours = elements[2].script().clone();
        let other = ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([9; 20]));
        let funding = tx(vec![], vec![other.clone()]);
        let pay = tx(vec![OutPoint::new(funding.compute_txid(), 0)], vec![ours, other.clone()]);
        let pay_id = pay.compute_txid();
        let spend = tx(vec![OutPoint::new(pay_id, 0)], vec![other]);
        let position = Position::blank(7);

        let found = match_block(position, &block(vec![funding, pay, spend.clone()]), &elements, &[]);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].txid, pay_id);
        assert_eq!(found[0].created.len(), 1);
        assert_eq!(found[0].created[0].owner, elements[2].id());
        assert_eq!(found[1].txid, spend.compute_txid());
        assert_eq!(found[1].spent, vec![OutPoint::new(pay_id, 0)]);
    }

    #[test]
    fn scan_reports_element_hits_and_last_tested_block() -> anyhow::Result<()> {
        let elements = WatchedElement::derive(Subchain::Receive, 0, key(2));
        let stranger = ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([3; 20]));
        let miss = block(vec![tx(vec![], vec![stranger])]);
        let hit = block(vec![tx(vec![], vec![elements[1].script().clone()])]);
        let filters = vec![
            (
                Position::new(1, miss.block_hash()),
                build_filter(FilterType::Basic, &miss, &HashMap::new())?,
            ),
            (
                Position::new(2, hit.block_hash()),
                build_filter(FilterType::Basic, &hit, &HashMap::new())?,
            ),
        ];

        let patterns = Patterns::new(FilterType::Basic, &elements, &[]);
        let outcome = scan_filters(&patterns, &filters)?;
        assert_eq!(outcome.tested_to, Some(filters[1].0));
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].position.height, 2);
        assert!(outcome.hits[0].elements.contains(&elements[1].id()));
        assert!(!outcome.hits[0].spends);
        Ok(())
    }

    #[test]
    fn empty_patterns_still_advance() -> anyhow::Result<()> {
        let stranger = ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([4; 20]));
        let b = block(vec![tx(vec![], vec![stranger])]);
        let filter = build_filter(FilterType::Basic, &b, &HashMap::new())?;
        let position = Position::new(5, b.block_hash());
        let outcome = scan_filters(&Patterns::default(), &[(position, filter)])?;
        assert_eq!(outcome.tested_to, Some(position));
        assert!(outcome.hits.is_empty());
        Ok(())
    }
}
