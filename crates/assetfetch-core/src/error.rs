use thiserror::Error;

use crate::types::{AssetId, PacketHost};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("transport: {0}")]
    Other(String),
}

impl TransportError {
    /// Status reported to the retry policy when no HTTP response arrived.
    pub fn status(&self) -> u16 {
        crate::collaborators::STATUS_NO_RESPONSE
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported format")]
    Unsupported,
    #[error("decode failed: {0}")]
    Malformed(String),
}

/// Reasons an inbound packet was rejected. The worker survives; the asset is
/// queued for a cancel to its peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("no fetch in progress for {0}")]
    UnknownAsset(AssetId),
    #[error("{asset} is not waiting for packets")]
    NotExpected { asset: AssetId },
    #[error("duplicate header for {0}")]
    DuplicateHeader(AssetId),
    #[error("packet for {0} before its header")]
    MissingHeader(AssetId),
    #[error("empty packet for {0}")]
    Empty(AssetId),
    #[error("packet {index} out of range (total {total})")]
    OutOfRange { index: u32, total: u32 },
    #[error("packet {index} has size {size}, expected {expected}")]
    BadSize {
        index: u32,
        size: usize,
        expected: usize,
    },
    #[error("packet {0} received twice")]
    Duplicate(u32),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("asset {asset} already requested from peer {existing:?}")]
    HostMismatch {
        asset: AssetId,
        existing: Option<PacketHost>,
    },
    #[error("previous request for {0} is still shutting down")]
    Aborting(AssetId),
    #[error("coordinator is shut down")]
    ShutDown,
}
