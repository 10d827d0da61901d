//! Error types shared by the actors.
//!
//! Collaborator traits return `anyhow::Result`; the enums here classify what
//! went wrong inside the engine so callers can decide between "drop and retry
//! on the next tick" and "surface to the operator".
use std::io;

use bitcoin::BlockHash;
use thiserror::Error;

use crate::types::FilterType;

/// Result alias for fallible network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Result alias for filter/header batch validation.
pub type SyncResult<T> = Result<T, SyncError>;

/// Top-level error type of the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport or peer protocol failure.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// A received batch failed validation.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// A message failed validation at the decode boundary.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Actor mailbox or lifecycle failure.
    #[error("actor error: {0}")]
    Actor(#[from] ActorError),

    /// Logging setup failure.
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),

    /// Collaborator (storage, header oracle, key source) failure.
    #[error("collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

/// Network-related errors. All of these are transient: the pool tears the
/// connection down and replaces it on a later maintenance tick.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Dialling the peer failed.
    #[error("connection to {0} failed: {1}")]
    ConnectionFailed(String, String),

    /// The `version`/`verack` exchange failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A frame could not be decoded.
    #[error("frame error: {0}")]
    Frame(#[from] DecodeError),

    /// A message could not be (de)serialized.
    #[error("message serialization error: {0}")]
    Serialization(#[from] bitcoin::consensus::encode::Error),

    /// No answer within the deadline.
    #[error("timeout occurred")]
    Timeout,

    /// The remote closed the connection.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// No transport is open yet.
    #[error("not connected")]
    NotConnected,

    /// No in-process listener is bound under this name.
    #[error("no inproc endpoint named {0}")]
    UnknownEndpoint(String),

    /// Socket failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Rejection reasons for filter headers and filters received from peers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The batch does not chain onto the stored filter header.
    #[error("previous filter header mismatch at height {height}")]
    PreviousHeaderMismatch {
        /// First height of the batch.
        height: u32,
    },

    /// The filter header before the batch is not stored.
    #[error("no stored {0} filter header before height {1}")]
    MissingPreviousHeader(FilterType, u32),

    /// The block header is not in the header index.
    #[error("block header {0} not known")]
    UnknownBlock(BlockHash),

    /// The stop hash is on a side branch.
    #[error("stop hash {0} is not part of the best chain")]
    NotInBestChain(BlockHash),

    /// The filter does not match its committed hash.
    #[error("filter digest mismatch for block {0}")]
    FilterHashMismatch(BlockHash),

    /// No filter header commits to this block yet.
    #[error("no committed filter header for block {0}")]
    MissingFilterHeader(BlockHash),

    /// The filter lies outside the open window.
    #[error("filter for block {0} was not requested")]
    Unrequested(BlockHash),

    /// More hashes than heights up to the stop block.
    #[error("batch of {count} headers ending at height {stop} starts below genesis")]
    BatchUnderflow {
        /// Filter hashes in the batch.
        count: usize,
        /// Height of the stop block.
        stop: u32,
    },
}

/// Errors produced while turning wire data into engine messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Filter type code outside BIP158.
    #[error("unknown filter type {0:#04x}")]
    UnknownFilterType(u8),

    /// A batch message carried no entries.
    #[error("empty {0} batch")]
    EmptyBatch(&'static str),

    /// Payload longer than the protocol allows.
    #[error("payload of {0} bytes exceeds limit")]
    Oversize(usize),

    /// Frame from another network.
    #[error("wrong network magic {0}")]
    WrongMagic(String),

    /// Peer address that does not parse.
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),
}

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A count or duration that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// A value outside its allowed range.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Actor lifecycle and mailbox errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActorError {
    /// The receiving actor is gone.
    #[error("{0} mailbox closed")]
    Closed(&'static str),

    /// The actor no longer accepts requests.
    #[error("{0} is shutting down")]
    ShuttingDown(&'static str),

    /// The actor did not answer in time.
    #[error("{0} did not answer in time")]
    Timeout(&'static str),

    /// The resolver was dropped.
    #[error("pending result was dropped before it resolved")]
    Abandoned,
}

/// Logging setup errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Logging was set up before.
    #[error("a global subscriber is already installed")]
    AlreadyInitialized,

    /// The filter directive does not parse.
    #[error("invalid filter directive: {0}")]
    Filter(String),
}

/// Result alias for logging setup.
pub type LoggingResult<T> = Result<T, LoggingError>;
