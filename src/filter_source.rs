//! Request seams between actors and the peer pool, plus the decoded form of
//! `cfheaders` batches.
use bitcoin::{
    bip158::{BlockFilter, FilterHash, FilterHeader},
    p2p::message_filter::{CFHeaders, CFilter},
    BlockHash,
};

use crate::{error::DecodeError, types::FilterType};

/// Requests the filter sync engine sends to peers. Every call fails fast
/// (returns `false`) when no peer is connected.
pub trait FilterSource: Send + Sync {
    /// Ask for block headers following our best chain.
    fn request_headers(&self) -> bool;

    /// `getcfheaders(filter_type, start_height, stop_hash)`.
    fn request_filter_headers(
        &self,
        filter_type: FilterType,
        start_height: u32,
        stop_hash: BlockHash,
    ) -> bool;

    /// `getcfilters(filter_type, start_height, stop_hash)`.
    fn request_filters(&self, filter_type: FilterType, start_height: u32, stop_hash: BlockHash)
        -> bool;
}

/// Requests the block cache sends to peers.
pub trait BlockSource: Send + Sync {
    /// `getdata` for one block.
    fn request_block(&self, hash: BlockHash) -> bool;
}

/// A validated `cfheaders` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterHeadersBatch {
    /// Filter type of the batch.
    pub filter_type: FilterType,
    /// Last block covered by the batch.
    pub stop_hash: BlockHash,
    /// Filter header of the block before the first one covered.
    pub previous: FilterHeader,
    /// Filter hashes, one per block, ascending.
    pub filter_hashes: Vec<FilterHash>,
}

impl TryFrom<CFHeaders> for FilterHeadersBatch {
    type Error = DecodeError;

    fn try_from(msg: CFHeaders) -> Result<Self, Self::Error> {
        let filter_type = FilterType::try_from(msg.filter_type)?;
        if msg.filter_hashes.is_empty() {
            return Err(DecodeError::EmptyBatch("cfheaders"));
        }
        Ok(Self {
            filter_type,
            stop_hash: msg.stop_hash,
            previous: msg.previous_filter_header,
            filter_hashes: msg.filter_hashes,
        })
    }
}

/// A validated `cfilter` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFilter {
    /// Filter type.
    pub filter_type: FilterType,
    /// Block the filter belongs to.
    pub block_hash: BlockHash,
    /// Filter content.
    pub filter: BlockFilter,
}

impl TryFrom<CFilter> for ReceivedFilter {
    type Error = DecodeError;

    fn try_from(msg: CFilter) -> Result<Self, Self::Error> {
        let filter_type = FilterType::try_from(msg.filter_type)?;
        if msg.filter.is_empty() {
            return Err(DecodeError::EmptyBatch("cfilter"));
        }
        Ok(Self {
            filter_type,
            block_hash: msg.block_hash,
            filter: BlockFilter::new(&msg.filter),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn rejects_malformed_cfheaders() {
        let base = CFHeaders {
            filter_type: 0,
            stop_hash: BlockHash::all_zeros(),
            previous_filter_header: FilterHeader::all_zeros(),
            filter_hashes: vec![],
        };
        assert_eq!(
            FilterHeadersBatch::try_from(base.clone()),
            Err(DecodeError::EmptyBatch("cfheaders"))
        );

        let unknown = CFHeaders {
            filter_type: 9,
            filter_hashes: vec![FilterHash::all_zeros()],
            ..base.clone()
        };
        assert_eq!(
            FilterHeadersBatch::try_from(unknown),
            Err(DecodeError::UnknownFilterType(9))
        );

        let ok = CFHeaders {
            filter_hashes: vec![FilterHash::all_zeros()],
            ..base
        };
        assert_eq!(
            FilterHeadersBatch::try_from(ok).map(|b| b.filter_type),
            Ok(FilterType::Basic)
        );
    }

    #[test]
    fn rejects_empty_cfilter() {
        let msg = CFilter {
            filter_type: 0x58,
            block_hash: BlockHash::all_zeros(),
            filter: vec![],
        };
        assert_eq!(
            ReceivedFilter::try_from(msg.clone()),
            Err(DecodeError::EmptyBatch("cfilter"))
        );
        let ok = ReceivedFilter::try_from(CFilter {
            filter: vec![0],
            ..msg
        });
        assert_eq!(ok.map(|f| f.filter_type), Ok(FilterType::Extended));
    }
}
