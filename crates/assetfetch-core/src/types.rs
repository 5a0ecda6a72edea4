use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a fetchable asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(Uuid);

impl AssetId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AssetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for AssetId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Address of a packet-transport peer (`ip:port`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketHost(String);

impl PacketHost {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PacketHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind advertised to the packet peer with every request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    #[default]
    Normal,
    /// Served by a specific peer rather than the default one.
    Baked,
}

/// Container format of the fetched bytes, as announced by the packet header
/// or inferred from the locator's extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    Unknown,
    J2c,
    Png,
    Jpeg,
    Tga,
    Bmp,
}

impl Codec {
    pub fn from_wire(code: u8) -> Self {
        match code {
            1 => Codec::Bmp,
            2 => Codec::Tga,
            3 => Codec::J2c,
            4 => Codec::Png,
            5 => Codec::Jpeg,
            _ => Codec::Unknown,
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "j2c" | "jp2" | "j2k" | "jpc" => Codec::J2c,
            "png" => Codec::Png,
            "jpg" | "jpeg" => Codec::Jpeg,
            "tga" => Codec::Tga,
            "bmp" => Codec::Bmp,
            _ => Codec::Unknown,
        }
    }

    /// Codec implied by the last path segment of `locator`, if it has an
    /// extension.
    pub fn from_locator(locator: &str) -> Option<Self> {
        let path = locator.split(['?', '#']).next().unwrap_or_default();
        let name = path.rsplit('/').next().unwrap_or_default();
        let (_, ext) = name.rsplit_once('.')?;
        (!ext.is_empty()).then(|| Codec::from_extension(ext))
    }

    /// Only progressive streams can be fetched and decoded partially.
    pub fn supports_partial(self) -> bool {
        matches!(self, Codec::J2c | Codec::Unknown)
    }
}

/// Decoded pixel buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub pixels: Bytes,
}

/// Decoder output, tagged with the discard level it represents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedImage {
    pub raw: RawImage,
    pub aux: Option<RawImage>,
    pub discard: u8,
}

/// A caller's request to fetch (or refresh) an asset.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchRequest {
    pub asset_id: AssetId,
    /// Empty for assets served by the default origin; `file://` for local files.
    pub locator: String,
    /// Packet peer override; `None` means the default peer.
    pub host: Option<PacketHost>,
    pub priority: f32,
    /// Known image dimensions, used to size partial requests.
    pub dimensions: Option<Dimensions>,
    pub desired_discard: u8,
    pub needs_aux: bool,
    pub can_use_http: bool,
}

impl FetchRequest {
    pub fn new(asset_id: AssetId, locator: impl Into<String>) -> Self {
        Self {
            asset_id,
            locator: locator.into(),
            host: None,
            priority: 1.0,
            dimensions: None,
            desired_discard: 0,
            needs_aux: false,
            can_use_http: true,
        }
    }

    pub fn with_priority(mut self, priority: f32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_discard(mut self, discard: u8) -> Self {
        self.desired_discard = discard;
        self
    }

    pub fn with_host(mut self, host: PacketHost) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32, components: u8) -> Self {
        self.dimensions = Some(Dimensions {
            width,
            height,
            components,
        });
        self
    }

    pub fn without_http(mut self) -> Self {
        self.can_use_http = false;
        self
    }

    pub fn with_aux(mut self) -> Self {
        self.needs_aux = true;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
    pub components: u8,
}
