//! Blocks waiting for a locally computed filter.
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use bitcoin::{bip158::FilterHeader, Block, BlockHash, OutPoint, ScriptBuf};

use crate::{pending::Pending, types::Position};

/// Output scripts remembered for later spends before the table is cleared.
const MAX_TRACKED_OUTPUTS: usize = 250_000;

/// Queue of `(position, pending block)` entries processed one at a time, in order.
#[derive(Debug, Default)]
pub struct BlockQueue {
    entries: VecDeque<(Position, Pending<Arc<Block>>)>,
    in_flight: Option<Position>,
    last: Option<(Position, FilterHeader)>,
    outputs: HashMap<OutPoint, ScriptBuf>,
}

impl BlockQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block.
    pub fn push(&mut self, position: Position, block: Pending<Arc<Block>>) {
        self.entries.push_back((position, block));
    }

    /// Put a block back at the head of the queue.
    pub fn push_front(&mut self, position: Position, block: Pending<Arc<Block>>) {
        self.entries.push_front((position, block));
    }

    /// Whether nothing is queued or being computed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.in_flight.is_none()
    }

    /// Whether a filter is being computed.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Pop the head entry if its block has arrived. Entries whose block will
    /// never arrive are dropped.
    pub fn next_ready(&mut self) -> Option<(Position, Arc<Block>)> {
        while let Some((position, block)) = self.entries.front() {
            if let Some(block) = block.try_get() {
                let position = *position;
                self.entries.pop_front();
                return Some((position, block));
            }
            if !block.is_abandoned() {
                return None;
            }
            tracing::debug!(position = %position, "block abandoned, skipping");
            self.entries.pop_front();
        }
        None
    }

    /// Mark `position` as being computed.
    pub fn begin(&mut self, position: Position) {
        self.in_flight = Some(position);
    }

    /// The cached filter header of `previous`, if it is the block computed last.
    pub fn cached_previous(&self, position: &Position, previous: &BlockHash) -> Option<FilterHeader> {
        self.last
            .filter(|(last, _)| last.hash == *previous && last.height + 1 == position.height)
            .map(|(_, header)| header)
    }

    /// Scripts of outputs `block` spends that an earlier queued block created.
    pub fn prevouts_for(&self, block: &Block) -> HashMap<OutPoint, ScriptBuf> {
        block
            .txdata
            .iter()
            .flat_map(|tx| tx.input.iter())
            .filter_map(|input| {
                self.outputs
                    .get(&input.previous_output)
                    .map(|script| (input.previous_output, script.clone()))
            })
            .collect()
    }

    /// Record the computed header of `position` and the outputs it created.
    pub fn complete(
        &mut self,
        position: Position,
        header: FilterHeader,
        outputs: Vec<(OutPoint, ScriptBuf)>,
    ) {
        self.in_flight = None;
        self.last = Some((position, header));
        if self.outputs.len() + outputs.len() > MAX_TRACKED_OUTPUTS {
            self.outputs.clear();
        }
        self.outputs.extend(outputs);
    }

    /// Computation of the in-flight block failed.
    pub fn abort(&mut self) {
        self.in_flight = None;
        self.last = None;
    }

    /// Drop every entry above `ancestor` and the cached header.
    pub fn reorg(&mut self, ancestor: &Position) {
        self.entries.retain(|(p, _)| p.height <= ancestor.height);
        self.last = None;
        self.outputs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::pending;
    use bitcoin::{constants::genesis_block, hashes::Hash, Network};

    #[test]
    fn releases_blocks_in_order_once_resolved() {
        let mut q = BlockQueue::new();
        let (first, first_handle) = pending();
        let (_second, second_handle) = pending::<Arc<Block>>();
        q.push(Position::blank(1), first_handle);
        q.push(Position::blank(2), second_handle);

        assert!(q.next_ready().is_none());
        first.resolve(Arc::new(genesis_block(Network::Regtest)));
        let (position, _) = q.next_ready().unwrap();
        assert_eq!(position.height, 1);
        assert!(q.next_ready().is_none());
    }

    #[test]
    fn skips_abandoned_blocks() {
        let mut q = BlockQueue::new();
        let (dropped, handle) = pending::<Arc<Block>>();
        drop(dropped);
        q.push(Position::blank(1), handle);
        q.push(
            Position::blank(2),
            Pending::ready(Arc::new(genesis_block(Network::Regtest))),
        );
        assert_eq!(q.next_ready().map(|(p, _)| p.height), Some(2));
    }

    #[test]
    fn caches_only_the_sequential_header() {
        let mut q = BlockQueue::new();
        let prev = Position::new(10, BlockHash::from_byte_array([1; 32]));
        let header = FilterHeader::from_byte_array([7; 32]);
        q.begin(prev);
        q.complete(prev, header, vec![]);
        assert!(!q.is_busy());

        assert_eq!(q.cached_previous(&Position::blank(11), &prev.hash), Some(header));
        assert_eq!(q.cached_previous(&Position::blank(12), &prev.hash), None);
        assert_eq!(
            q.cached_previous(&Position::blank(11), &BlockHash::all_zeros()),
            None
        );

        q.reorg(&Position::blank(5));
        assert_eq!(q.cached_previous(&Position::blank(11), &prev.hash), None);
    }
}
