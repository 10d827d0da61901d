//! In-flight request bookkeeping for filter sync.
use std::time::{Duration, Instant};

use bitcoin::{bip158::BlockFilter, BlockHash};

use crate::{
    error::{SyncError, SyncResult},
    types::Position,
};

/// A single outstanding `getcfheaders` request, keyed by stop hash.
#[derive(Debug)]
pub struct RequestQueue {
    timeout: Duration,
    active: Option<(BlockHash, Instant)>,
}

impl RequestQueue {
    /// Queue whose requests expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            active: None,
        }
    }

    /// Whether a request is outstanding and has not expired.
    pub fn is_running(&self) -> bool {
        self.active
            .is_some_and(|(_, since)| since.elapsed() < self.timeout)
    }

    /// Record a request ending at `stop`.
    pub fn start(&mut self, stop: BlockHash) {
        self.active = Some((stop, Instant::now()));
    }

    /// Clear the request ending at `stop`; returns whether it was outstanding.
    pub fn finish(&mut self, stop: &BlockHash) -> bool {
        match self.active {
            Some((active, _)) if active == *stop => {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    /// Forget any outstanding request.
    pub fn reset(&mut self) {
        self.active = None;
    }
}

/// The outstanding `getcfilters` window: one slot per requested block,
/// filled as `cfilter` messages arrive.
#[derive(Debug)]
pub struct FilterQueue {
    timeout: Duration,
    started: Option<Instant>,
    start_height: u32,
    slots: Vec<(BlockHash, Option<BlockFilter>)>,
    filled: usize,
}

impl FilterQueue {
    /// Empty queue whose windows expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            started: None,
            start_height: 0,
            slots: Vec::new(),
            filled: 0,
        }
    }

    /// Open a window for `hashes` (ascending) starting at `start_height`.
    pub fn start(&mut self, start_height: u32, hashes: Vec<BlockHash>) {
        self.started = Some(Instant::now());
        self.start_height = start_height;
        self.slots = hashes.into_iter().map(|h| (h, None)).collect();
        self.filled = 0;
    }

    /// Whether a window is open and has not expired.
    pub fn is_running(&self) -> bool {
        !self.slots.is_empty()
            && self
                .started
                .is_some_and(|since| since.elapsed() < self.timeout)
    }

    /// Whether the window holds a slot for `hash` at `height`.
    pub fn contains(&self, height: u32, hash: &BlockHash) -> bool {
        self.slot(height).is_some_and(|(h, _)| h == hash)
    }

    fn slot(&self, height: u32) -> Option<&(BlockHash, Option<BlockFilter>)> {
        height
            .checked_sub(self.start_height)
            .and_then(|i| self.slots.get(i as usize))
    }

    /// Fill the slot for `hash` at `height`. Returns `false` when the slot was
    /// already filled.
    pub fn insert(&mut self, height: u32, hash: BlockHash, filter: BlockFilter) -> SyncResult<bool> {
        let index = height
            .checked_sub(self.start_height)
            .map(|i| i as usize)
            .filter(|&i| i < self.slots.len())
            .ok_or(SyncError::Unrequested(hash))?;
        let slot = &mut self.slots[index];
        if slot.0 != hash {
            return Err(SyncError::Unrequested(hash));
        }
        if slot.1.is_some() {
            return Ok(false);
        }
        slot.1 = Some(filter);
        self.filled += 1;
        Ok(true)
    }

    /// Whether every slot is filled.
    pub fn is_full(&self) -> bool {
        !self.slots.is_empty() && self.filled == self.slots.len()
    }

    /// Number of filled slots.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Last block of the window.
    pub fn stop_position(&self) -> Option<Position> {
        let last = self.slots.last()?;
        Some(Position::new(
            self.start_height + self.slots.len() as u32 - 1,
            last.0,
        ))
    }

    /// Take the filled window, ascending, and reset. Returns `None` unless full.
    pub fn take(&mut self) -> Option<Vec<(BlockHash, BlockFilter)>> {
        if !self.is_full() {
            return None;
        }
        let slots = std::mem::take(&mut self.slots);
        self.reset();
        slots
            .into_iter()
            .map(|(hash, filter)| filter.map(|f| (hash, f)))
            .collect()
    }

    /// Drop the window.
    pub fn reset(&mut self) {
        self.started = None;
        self.slots.clear();
        self.filled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn hash(n: u8) -> BlockHash {
        BlockHash::from_byte_array([n; 32])
    }

    #[test]
    fn request_queue_expires_and_matches_stop_hash() {
        let mut q = RequestQueue::new(Duration::from_secs(30));
        assert!(!q.is_running());
        q.start(hash(1));
        assert!(q.is_running());
        assert!(!q.finish(&hash(2)));
        assert!(q.finish(&hash(1)));
        assert!(!q.is_running());

        let mut expired = RequestQueue::new(Duration::ZERO);
        expired.start(hash(1));
        assert!(!expired.is_running());
    }

    #[test]
    fn filter_window_fills_and_flushes_ascending() {
        let mut q = FilterQueue::new(Duration::from_secs(30));
        q.start(91, (1..=3).map(hash).collect());
        assert!(q.is_running());
        assert_eq!(q.stop_position(), Some(Position::new(93, hash(3))));

        assert_eq!(q.insert(93, hash(3), BlockFilter::new(&[3])), Ok(true));
        assert_eq!(q.insert(91, hash(1), BlockFilter::new(&[1])), Ok(true));
        assert_eq!(q.insert(91, hash(1), BlockFilter::new(&[1])), Ok(false));
        assert_eq!(
            q.insert(92, hash(9), BlockFilter::new(&[9])),
            Err(SyncError::Unrequested(hash(9)))
        );
        assert_eq!(
            q.insert(90, hash(1), BlockFilter::new(&[1])),
            Err(SyncError::Unrequested(hash(1)))
        );
        assert!(q.take().is_none());

        assert_eq!(q.insert(92, hash(2), BlockFilter::new(&[2])), Ok(true));
        let window = q.take().unwrap();
        let contents: Vec<_> = window.iter().map(|(_, f)| f.content[0]).collect();
        assert_eq!(contents, vec![1, 2, 3]);
        assert!(!q.is_running());
        assert!(!q.contains(91, &hash(1)));
    }
}
