//! Work the pool hands to connected peers, one queue per task.
use std::collections::{HashMap, VecDeque};

use bitcoin::{BlockHash, Transaction};

use crate::types::{FilterType, PeerId};

/// A request to send to some peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// `getheaders` from our best chain.
    GetHeaders,
    /// `getcfheaders`.
    GetFilterHeaders {
        /// Filter type.
        filter_type: FilterType,
        /// First height of the range.
        start_height: u32,
        /// Last block of the range.
        stop_hash: BlockHash,
    },
    /// `getcfilters`.
    GetFilters {
        /// Filter type.
        filter_type: FilterType,
        /// First height of the range.
        start_height: u32,
        /// Last block of the range.
        stop_hash: BlockHash,
    },
    /// `getdata` for one block.
    GetBlock(BlockHash),
    /// Relay a transaction to every active peer.
    BroadcastTransaction(Transaction),
    /// Ping one peer.
    Heartbeat(PeerId),
}

/// Queue a job waits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Block headers.
    Headers,
    /// Filter headers.
    FilterHeaders,
    /// Filters.
    Filters,
    /// Blocks.
    Block,
    /// Transaction relay.
    Broadcast,
    /// Pings.
    Heartbeat,
}

impl JobKind {
    /// Every queue, in dispatch order.
    pub const ALL: [JobKind; 6] = [
        JobKind::Heartbeat,
        JobKind::Headers,
        JobKind::FilterHeaders,
        JobKind::Filters,
        JobKind::Block,
        JobKind::Broadcast,
    ];
}

impl Job {
    /// Queue this job belongs to.
    pub fn kind(&self) -> JobKind {
        match self {
            Job::GetHeaders => JobKind::Headers,
            Job::GetFilterHeaders { .. } => JobKind::FilterHeaders,
            Job::GetFilters { .. } => JobKind::Filters,
            Job::GetBlock(_) => JobKind::Block,
            Job::BroadcastTransaction(_) => JobKind::Broadcast,
            Job::Heartbeat(_) => JobKind::Heartbeat,
        }
    }

    /// Whether the job should go to a peer serving compact filters.
    pub fn needs_filters(&self) -> bool {
        matches!(
            self,
            Job::GetFilterHeaders { .. } | Job::GetFilters { .. }
        )
    }
}

/// Per-task FIFO queues. Identical pending jobs are queued once.
#[derive(Debug, Default)]
pub struct JobQueues {
    queues: HashMap<JobKind, VecDeque<Job>>,
}

impl JobQueues {
    /// Empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job`; returns `false` when an identical job is already waiting.
    pub fn push(&mut self, job: Job) -> bool {
        let queue = self.queues.entry(job.kind()).or_default();
        if queue.contains(&job) {
            return false;
        }
        queue.push_back(job);
        true
    }

    /// Next job of `kind`.
    pub fn pop(&mut self, kind: JobKind) -> Option<Job> {
        self.queues.get_mut(&kind)?.pop_front()
    }

    /// Put a job back at the head of its queue.
    pub fn push_front(&mut self, job: Job) {
        self.queues.entry(job.kind()).or_default().push_front(job);
    }

    /// Jobs waiting in every queue.
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Whether every queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the queued heartbeat of `peer`.
    pub fn forget_peer(&mut self, peer: PeerId) {
        if let Some(queue) = self.queues.get_mut(&JobKind::Heartbeat) {
            queue.retain(|job| job != &Job::Heartbeat(peer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn queues_identical_jobs_once() {
        let mut jobs = JobQueues::new();
        assert!(jobs.push(Job::GetHeaders));
        assert!(!jobs.push(Job::GetHeaders));
        let block = BlockHash::from_byte_array([1; 32]);
        assert!(jobs.push(Job::GetBlock(block)));
        assert!(!jobs.push(Job::GetBlock(block)));
        assert!(jobs.push(Job::Heartbeat(PeerId(1))));
        assert_eq!(jobs.len(), 3);

        jobs.forget_peer(PeerId(1));
        assert_eq!(jobs.pop(JobKind::Heartbeat), None);
        assert_eq!(jobs.pop(JobKind::Headers), Some(Job::GetHeaders));
        assert_eq!(jobs.pop(JobKind::Headers), None);
        assert!(!jobs.is_empty());
    }

    #[test]
    fn only_filter_requests_need_filter_peers() {
        let stop = BlockHash::all_zeros();
        assert!(Job::GetFilters {
            filter_type: FilterType::Basic,
            start_height: 0,
            stop_hash: stop,
        }
        .needs_filters());
        assert!(!Job::GetBlock(stop).needs_filters());
        assert_eq!(Job::Heartbeat(PeerId(3)).kind(), JobKind::Heartbeat);
    }
}
