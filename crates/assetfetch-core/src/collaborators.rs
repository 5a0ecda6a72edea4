//! Boundaries to the services the fetch pipeline drives: asset cache, HTTP
//! transport, image decoder, packet transport and origin lookup.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{CacheError, DecodeError, TransportError};
use crate::headers::HttpHeaders;
use crate::types::{AssetId, AssetKind, DecodedImage, PacketHost};

pub const STATUS_NOT_FOUND: u16 = 404;
/// Synthetic status for requests that never got a response.
pub const STATUS_NO_RESPONSE: u16 = 499;
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Asset(AssetId),
    /// A file outside the cache, named by a `file://` locator.
    LocalFile(PathBuf),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Asset(id) => write!(f, "asset:{id}"),
            CacheKey::LocalFile(path) => write!(f, "file:{}", path.display()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRead {
    /// Bytes starting at the requested offset.
    pub data: Bytes,
    /// Total size of the stored asset; 0 when unknown.
    pub file_size: usize,
    /// The bytes came from a local file rather than the cache proper.
    pub local: bool,
}

#[async_trait]
pub trait AssetCache: Send + Sync {
    async fn read(&self, key: &CacheKey, offset: usize, size: usize)
        -> Result<CacheRead, CacheError>;

    /// Store `data` (the asset prefix fetched so far). `total_size_hint` equals
    /// `data.len()` when the asset is complete and is larger otherwise.
    async fn write(
        &self,
        key: &CacheKey,
        data: Bytes,
        total_size_hint: usize,
    ) -> Result<(), CacheError>;

    fn remove(&self, key: &CacheKey);
}

/// Inclusive-start byte window `[offset, offset + length)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// `Range` header value.
    pub fn header_value(&self) -> String {
        let last = self.offset + self.length.saturating_sub(1);
        format!("bytes={}-{}", self.offset, last)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub range: Option<ByteRange>,
    pub headers: HttpHeaders,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
pub trait ImageDecoder: Send + Sync {
    /// Decode `data` down to `discard` (0 = full resolution).
    async fn decode(
        &self,
        data: Bytes,
        priority: u32,
        discard: u8,
        want_aux: bool,
    ) -> Result<DecodedImage, DecodeError>;
}

/// One entry of an outbound packet request batch.
#[derive(Clone, Debug, PartialEq)]
pub struct PacketRequest {
    pub asset_id: AssetId,
    pub discard: u8,
    pub priority: f32,
    /// First packet the peer should send.
    pub first_packet: u32,
    pub kind: AssetKind,
}

/// Fire-and-forget sender for the packet protocol. Inbound packets are fed to
/// the coordinator by the protocol layer.
pub trait PacketTransport: Send + Sync {
    fn send_requests(&self, host: &PacketHost, requests: &[PacketRequest]);
    fn send_cancels(&self, host: &PacketHost, assets: &[AssetId]);
}

/// Knows which HTTP origin and packet peer serve assets.
pub trait OriginResolver: Send + Sync {
    /// Base URL of the HTTP asset service reachable through `host`
    /// (the default peer when `None`).
    fn http_origin(&self, host: Option<&PacketHost>) -> Option<String>;

    fn default_packet_host(&self) -> Option<PacketHost>;
}

/// Resolver with fixed answers.
#[derive(Clone, Debug, Default)]
pub struct StaticOrigin {
    pub http_origin: Option<String>,
    pub packet_host: Option<PacketHost>,
}

impl OriginResolver for StaticOrigin {
    fn http_origin(&self, _host: Option<&PacketHost>) -> Option<String> {
        self.http_origin.clone()
    }

    fn default_packet_host(&self) -> Option<PacketHost> {
        self.packet_host.clone()
    }
}

/// Everything a coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn AssetCache>,
    pub http: Arc<dyn HttpTransport>,
    pub decoder: Arc<dyn ImageDecoder>,
    /// `None` disables the packet fallback.
    pub packets: Option<Arc<dyn PacketTransport>>,
    pub origins: Arc<dyn OriginResolver>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header() {
        let r = ByteRange {
            offset: 599,
            length: 1001,
        };
        assert_eq!(r.header_value(), "bytes=599-1599");
        let first = ByteRange {
            offset: 0,
            length: 600,
        };
        assert_eq!(first.header_value(), "bytes=0-599");
    }
}
