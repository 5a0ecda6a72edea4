//! Asset fetch pipeline: per-asset workers that read the cache, fetch over
//! HTTP (through per-destination admission) or the packet transport, decode
//! and write back, all driven by one [`FetchCoordinator`].

mod bandwidth;
pub mod collaborators;
pub mod config;
mod coordinator;
pub mod dispatcher;
pub mod error;
mod fail_list;
pub mod headers;
pub mod packets;
pub mod schedule;
pub mod types;
mod worker;

pub use collaborators::{
    AssetCache, ByteRange, CacheKey, CacheRead, Collaborators, HttpRequest, HttpResponse,
    HttpTransport, ImageDecoder, OriginResolver, PacketRequest, PacketTransport, StaticOrigin,
};
pub use config::{config_schema_json, load_config, FairnessConfig, FetchConfig};
pub use coordinator::{Completion, FetchCoordinator, FetchProgress, FetchStats};
pub use dispatcher::{HttpDispatcher, HttpTicket, JobId};
pub use error::{CacheError, DecodeError, FetchError, PacketError, TransportError};
pub use headers::{HeaderOp, HttpHeaders};
pub use types::{
    AssetId, AssetKind, Codec, DecodedImage, Dimensions, FetchRequest, PacketHost, RawImage,
};
pub use worker::{estimate_data_size, FetchState, CACHE_ENTRY_SIZE, MAX_DISCARD_LEVEL, MAX_IMAGE_DATA_SIZE};

pub use assetfetch_throttle as throttle;
