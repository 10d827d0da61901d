//! Small value types used across the engine.
use std::{cmp::Ordering, fmt};

use bitcoin::{constants::genesis_block, hashes::Hash as _, BlockHash, Network};

use crate::error::DecodeError;

/// A chain-tip marker: a block height together with the block's hash.
///
/// Positions order by height first; two positions are equal only when both
/// height and hash agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    /// Block height.
    pub height: u32,
    /// Hash of the block at `height`.
    pub hash: BlockHash,
}

impl Position {
    /// Create a position.
    pub fn new(height: u32, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// Position of the genesis block of `network`.
    pub fn genesis(network: Network) -> Self {
        Self::new(0, genesis_block(network).block_hash())
    }

    /// A position whose hash is all zeros; only useful as a placeholder in tests.
    pub fn blank(height: u32) -> Self {
        Self::new(height, BlockHash::all_zeros())
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.height, self.hash)
    }
}

/// Compact filter flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterType {
    /// BIP158 basic filter: output scripts and spent input scripts.
    Basic,
    /// Node-local extended filter: basic contents plus serialized spent outpoints.
    Extended,
}

impl FilterType {
    /// Every supported filter type.
    pub const ALL: [FilterType; 2] = [FilterType::Basic, FilterType::Extended];

    /// Byte used on the wire (`getcfilters`, `cfheaders`, ...).
    pub fn wire_code(self) -> u8 {
        match self {
            FilterType::Basic => 0x00,
            FilterType::Extended => 0x58,
        }
    }

    /// Whether wallet matching for this type should include outpoint bytes.
    pub fn indexes_outpoints(self) -> bool {
        matches!(self, FilterType::Extended)
    }
}

impl TryFrom<u8> for FilterType {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x00 => Ok(FilterType::Basic),
            0x58 => Ok(FilterType::Extended),
            other => Err(DecodeError::UnknownFilterType(other)),
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterType::Basic => f.write_str("basic"),
            FilterType::Extended => f.write_str("extended"),
        }
    }
}

/// How many blocks the node keeps locally; drives the target peer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPolicy {
    /// Keep every block.
    All,
    /// Keep recently requested blocks only.
    Cache,
    /// Keep no blocks.
    None,
}

/// Identifier the pool assigns to each peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}
