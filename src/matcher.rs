//! Building block filters and testing patterns against them.
use std::collections::HashMap;

use bitcoin::{
    bip158::{self, BlockFilter, BlockFilterWriter},
    consensus, Block, BlockHash, OutPoint, ScriptBuf,
};

use crate::types::FilterType;

/// Whether any of `patterns` is in `filter`.
pub fn filter_matches_any<'a, I>(
    block_hash: &BlockHash,
    filter: &BlockFilter,
    patterns: I,
) -> Result<bool, bip158::Error>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    if filter.content.is_empty() {
        return Ok(false);
    }
    let mut it = patterns.into_iter().peekable();
    if it.peek().is_none() {
        return Ok(false);
    }
    filter.match_any(block_hash, &mut it)
}

/// The candidates whose pattern is in `filter`.
pub fn matching<'c, T>(
    block_hash: &BlockHash,
    filter: &BlockFilter,
    candidates: &'c [(T, Vec<u8>)],
) -> Result<Vec<&'c T>, bip158::Error> {
    let mut hits = Vec::new();
    for (item, pattern) in candidates {
        if filter_matches_any(block_hash, filter, [pattern.as_slice()])? {
            hits.push(item);
        }
    }
    Ok(hits)
}

/// Build the `filter_type` filter of `block`.
///
/// `prevouts` holds the scripts of outputs the block may spend; inputs whose
/// previous output is unknown contribute nothing.
pub fn build_filter(
    filter_type: FilterType,
    block: &Block,
    prevouts: &HashMap<OutPoint, ScriptBuf>,
) -> Result<BlockFilter, bitcoin::io::Error> {
    let mut content = Vec::new();
    {
        let mut writer = BlockFilterWriter::new(&mut content, block);
        writer.add_output_scripts();
        for tx in block.txdata.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.input {
                if let Some(script) = prevouts.get(&input.previous_output) {
                    if !script.is_empty() {
                        writer.add_element(script.as_bytes());
                    }
                }
                if filter_type.indexes_outpoints() {
                    writer.add_element(&consensus::serialize(&input.previous_output));
                }
            }
        }
        writer.finish()?;
    }
    Ok(BlockFilter::new(&content))
}

/// Outputs created by `block`, keyed by outpoint.
pub fn block_outputs(block: &Block) -> Vec<(OutPoint, ScriptBuf)> {
    block
        .txdata
        .iter()
        .flat_map(|tx| {
            let txid = tx.compute_txid();
            tx.output
                .iter()
                .enumerate()
                .map(move |(vout, out)| (OutPoint::new(txid, vout as u32), out.script_pubkey.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        absolute::LockTime, block::Header, block::Version, hashes::Hash, pow::CompactTarget,
        transaction, Amount, Sequence, Transaction, TxIn, TxMerkleNode, TxOut, WPubkeyHash,
        Witness,
    };

    fn tx(inputs: Vec<OutPoint>, outputs: Vec<ScriptBuf>) -> Transaction {
        let input = if inputs.is_empty() {
            vec![TxIn::default()]
        } else {
            inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect()
        };
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input,
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
        Block {
            header: Header {
                version: Version::ONE,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0x207f_ffff),
                nonce: 0,
            },
            txdata,
        }
    }

    fn script(n: u8) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([n; 20]))
    }

    #[test]
    fn basic_filter_agrees_with_script_filter() -> anyhow::Result<()> {
        let funding = OutPoint::new(bitcoin::Txid::from_byte_array([5; 32]), 0);
        let b = block(vec![tx(vec![], vec![script(1)]), tx(vec![funding], vec![script(2)])]);
        let prevouts = HashMap::from([(funding, script(3))]);

        let ours = build_filter(FilterType::Basic, &b, &prevouts)?;
        let reference = BlockFilter::new_script_filter(&b, |op| {
            prevouts
                .get(op)
                .cloned()
                .ok_or(bip158::Error::UtxoMissing(*op))
        })?;
        assert_eq!(ours, reference);

        let hash = b.block_hash();
        assert!(filter_matches_any(&hash, &ours, [script(3).as_bytes()])?);
        assert!(!filter_matches_any(&hash, &ours, [script(9).as_bytes()])?);
        Ok(())
    }

    #[test]
    fn extended_filter_indexes_spent_outpoints() -> anyhow::Result<()> {
        let funding = OutPoint::new(bitcoin::Txid::from_byte_array([6; 32]), 1);
        let b = block(vec![tx(vec![], vec![script(1)]), tx(vec![funding], vec![script(2)])]);
        let hash = b.block_hash();
        let outpoint = consensus::serialize(&funding);

        let basic = build_filter(FilterType::Basic, &b, &HashMap::new())?;
        let extended = build_filter(FilterType::Extended, &b, &HashMap::new())?;
        assert!(!filter_matches_any(&hash, &basic, [outpoint.as_slice()])?);
        assert!(filter_matches_any(&hash, &extended, [outpoint.as_slice()])?);
        Ok(())
    }

    #[test]
    fn reports_which_candidates_matched() -> anyhow::Result<()> {
        let b = block(vec![tx(vec![], vec![script(1), script(2)])]);
        let hash = b.block_hash();
        let filter = build_filter(FilterType::Basic, &b, &HashMap::new())?;
        let candidates = vec![
            ("a", script(1).to_bytes()),
            ("b", script(7).to_bytes()),
            ("c", script(2).to_bytes()),
        ];
        let hits = matching(&hash, &filter, &candidates)?;
        assert_eq!(hits, vec![&"a", &"c"]);
        assert!(!filter_matches_any(&hash, &BlockFilter::new(&[]), [script(1).as_bytes()])?);
        Ok(())
    }
}
