//! Filter-header chain linkage.
//!
//! Each block's filter header commits to its filter and to the previous
//! header (BIP157):
//!
//!   header_n = HASH256( filter_hash_n || header_{n-1} )
//!
//! with an all-zero `header_{-1}` before genesis.
use bitcoin::{
    bip158::{FilterHash, FilterHeader},
    hashes::Hash,
};

use crate::error::{SyncError, SyncResult};

/// The header that precedes the genesis filter header.
pub fn genesis_previous() -> FilterHeader {
    FilterHeader::all_zeros()
}

/// One link of a verified batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLink {
    /// Height of the block.
    pub height: u32,
    /// Hash of the block's filter.
    pub filter_hash: FilterHash,
    /// Resulting filter header.
    pub header: FilterHeader,
}

/// Expected previous header of a batch starting at `start_height`.
///
/// `stored` is the header we hold for `start_height - 1` (ignored at genesis).
pub fn expected_previous(start_height: u32, stored: Option<FilterHeader>) -> Option<FilterHeader> {
    if start_height == 0 {
        Some(genesis_previous())
    } else {
        stored
    }
}

/// Check the batch's declared previous header against what we hold.
pub fn verify_previous(
    start_height: u32,
    declared: &FilterHeader,
    expected: &FilterHeader,
) -> SyncResult<()> {
    if declared != expected {
        return Err(SyncError::PreviousHeaderMismatch {
            height: start_height,
        });
    }
    Ok(())
}

/// Chain `filter_hashes` onto `previous`. `filter_hashes[i]` belongs to
/// height `start_height + i`.
pub fn link_batch(
    start_height: u32,
    previous: FilterHeader,
    filter_hashes: &[FilterHash],
) -> Vec<HeaderLink> {
    let mut rolling = previous;
    filter_hashes
        .iter()
        .enumerate()
        .map(|(i, filter_hash)| {
            rolling = filter_hash.filter_header(&rolling);
            HeaderLink {
                height: start_height + i as u32,
                filter_hash: *filter_hash,
                header: rolling,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::sha256d;

    fn fh(n: u8) -> FilterHash {
        FilterHash::from_byte_array([n; 32])
    }

    #[test]
    fn links_commit_to_filter_then_previous() {
        let links = link_batch(10, genesis_previous(), &[fh(1), fh(2)]);
        assert_eq!(links.len(), 2);
        assert_eq!(links[1].height, 11);

        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(fh(2).as_byte_array());
        data.extend_from_slice(links[0].header.as_byte_array());
        let expected = FilterHeader::from_raw_hash(sha256d::Hash::hash(&data));
        assert_eq!(links[1].header, expected);
    }

    #[test]
    fn genesis_uses_zero_previous() {
        assert_eq!(expected_previous(0, None), Some(genesis_previous()));
        assert_eq!(expected_previous(5, None), None);
        let stored = FilterHeader::from_byte_array([3; 32]);
        assert_eq!(expected_previous(5, Some(stored)), Some(stored));
    }

    #[test]
    fn rejects_wrong_previous() {
        let ours = FilterHeader::from_byte_array([1; 32]);
        let theirs = FilterHeader::from_byte_array([2; 32]);
        assert_eq!(
            verify_previous(50, &theirs, &ours),
            Err(SyncError::PreviousHeaderMismatch { height: 50 })
        );
        assert!(verify_previous(50, &ours, &ours).is_ok());
    }
}
