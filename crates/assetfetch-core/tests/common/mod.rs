#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assetfetch_core::{
    AssetCache, AssetId, CacheError, CacheKey, CacheRead, Collaborators, Completion,
    DecodeError, DecodedImage, FetchConfig, FetchCoordinator, HttpRequest, HttpResponse,
    HttpTransport, ImageDecoder, PacketHost, PacketRequest, PacketTransport, RawImage,
    StaticOrigin, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

pub const ORIGIN: &str = "http://assets.test";

pub fn peer() -> PacketHost {
    PacketHost::new("10.0.0.1:13000")
}

pub fn bytes(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}

/// In-memory cache. A sticky cache ignores removals.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<AssetId, (Bytes, usize)>>,
    files: Mutex<HashMap<PathBuf, Bytes>>,
    sticky: bool,
    pub reads: AtomicUsize,
    pub writes: Mutex<Vec<(AssetId, usize, usize)>>,
    pub removed: Mutex<Vec<AssetId>>,
}

impl MemoryCache {
    pub fn sticky() -> Self {
        Self {
            sticky: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, id: AssetId, data: Bytes, file_size: usize) {
        self.entries.lock().insert(id, (data, file_size));
    }

    pub fn insert_file(&self, path: impl Into<PathBuf>, data: Bytes) {
        self.files.lock().insert(path.into(), data);
    }
}

#[async_trait]
impl AssetCache for MemoryCache {
    async fn read(
        &self,
        key: &CacheKey,
        offset: usize,
        size: usize,
    ) -> Result<CacheRead, CacheError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let id = match key {
            CacheKey::Asset(id) => id,
            CacheKey::LocalFile(path) => {
                let files = self.files.lock();
                let data = files.get(path).ok_or(CacheError::Miss)?;
                if offset >= data.len() {
                    return Err(CacheError::Miss);
                }
                let end = (offset + size).min(data.len());
                return Ok(CacheRead {
                    data: data.slice(offset..end),
                    file_size: data.len(),
                    local: true,
                });
            }
        };
        let entries = self.entries.lock();
        let Some((data, file_size)) = entries.get(id) else {
            return Err(CacheError::Miss);
        };
        if offset >= data.len() {
            return Err(CacheError::Miss);
        }
        let end = (offset + size).min(data.len());
        Ok(CacheRead {
            data: data.slice(offset..end),
            file_size: *file_size,
            local: false,
        })
    }

    async fn write(&self, key: &CacheKey, data: Bytes, hint: usize) -> Result<(), CacheError> {
        let CacheKey::Asset(id) = key else {
            return Err(CacheError::Corrupt(key.to_string()));
        };
        self.writes.lock().push((*id, data.len(), hint));
        self.entries.lock().insert(*id, (data, hint));
        Ok(())
    }

    fn remove(&self, key: &CacheKey) {
        if let CacheKey::Asset(id) = key {
            self.removed.lock().push(*id);
            if !self.sticky {
                self.entries.lock().remove(id);
            }
        }
    }
}

/// Answers requests from a script; 404 once the script runs out. A stalled
/// entry never answers.
#[derive(Default)]
pub struct ScriptedHttp {
    script: Mutex<VecDeque<Option<Result<HttpResponse, TransportError>>>>,
    pub requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttp {
    pub fn respond(&self, response: Result<HttpResponse, TransportError>) {
        self.script.lock().push_back(Some(response));
    }

    pub fn stall(&self) {
        self.script.lock().push_back(None);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

pub fn status(code: u16) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status: code,
        reason: format!("status {code}"),
        body: Bytes::new(),
    })
}

pub fn body(code: u16, body: Bytes) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status: code,
        reason: "OK".into(),
        body,
    })
}

#[async_trait]
impl HttpTransport for ScriptedHttp {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request);
        let next = self.script.lock().pop_front();
        match next {
            Some(Some(response)) => response,
            Some(None) => std::future::pending().await,
            None => status(404),
        }
    }
}

/// Decoder that fails its first `failures` calls and remembers its input.
#[derive(Default)]
pub struct TestDecoder {
    failures: AtomicUsize,
    pub calls: AtomicUsize,
    pub last_input: Mutex<Option<Bytes>>,
}

impl TestDecoder {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageDecoder for TestDecoder {
    async fn decode(
        &self,
        data: Bytes,
        _priority: u32,
        discard: u8,
        want_aux: bool,
    ) -> Result<DecodedImage, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_input.lock() = Some(data.clone());
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DecodeError::Malformed("corrupt stream".into()));
        }
        Ok(DecodedImage {
            raw: RawImage {
                width: 4,
                height: 4,
                components: 3,
                pixels: data,
            },
            aux: want_aux.then(|| RawImage {
                width: 4,
                height: 4,
                components: 1,
                pixels: Bytes::from_static(&[255; 16]),
            }),
            discard,
        })
    }
}

#[derive(Default)]
pub struct RecordingPackets {
    pub requests: Mutex<Vec<(PacketHost, Vec<PacketRequest>)>>,
    pub cancels: Mutex<Vec<(PacketHost, Vec<AssetId>)>>,
}

impl RecordingPackets {
    pub fn requested(&self, id: AssetId) -> bool {
        self.requests
            .lock()
            .iter()
            .any(|(_, batch)| batch.iter().any(|r| r.asset_id == id))
    }

    pub fn cancelled(&self, id: AssetId) -> bool {
        self.cancels
            .lock()
            .iter()
            .any(|(_, ids)| ids.contains(&id))
    }
}

impl PacketTransport for RecordingPackets {
    fn send_requests(&self, host: &PacketHost, requests: &[PacketRequest]) {
        self.requests.lock().push((host.clone(), requests.to_vec()));
    }

    fn send_cancels(&self, host: &PacketHost, assets: &[AssetId]) {
        self.cancels.lock().push((host.clone(), assets.to_vec()));
    }
}

pub struct Harness {
    pub cache: Arc<MemoryCache>,
    pub http: Arc<ScriptedHttp>,
    pub decoder: Arc<TestDecoder>,
    pub packets: Arc<RecordingPackets>,
    pub coordinator: FetchCoordinator,
}

pub struct Setup {
    pub cache: MemoryCache,
    pub decoder: TestDecoder,
    pub http_origin: Option<&'static str>,
    pub packets: bool,
    pub config: FetchConfig,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            cache: MemoryCache::default(),
            decoder: TestDecoder::default(),
            http_origin: Some(ORIGIN),
            packets: true,
            config: config(),
        }
    }
}

pub fn config() -> FetchConfig {
    FetchConfig {
        tick_ms: 5,
        request_interval_ms: 10,
        fetch_timeout_secs: 5,
        ..FetchConfig::default()
    }
}

impl Setup {
    pub fn start(self) -> Harness {
        let cache = Arc::new(self.cache);
        let http = Arc::new(ScriptedHttp::default());
        let decoder = Arc::new(self.decoder);
        let packets = Arc::new(RecordingPackets::default());
        let collaborators = Collaborators {
            cache: cache.clone(),
            http: http.clone(),
            decoder: decoder.clone(),
            packets: self
                .packets
                .then(|| packets.clone() as Arc<dyn PacketTransport>),
            origins: Arc::new(StaticOrigin {
                http_origin: self.http_origin.map(str::to_string),
                packet_host: Some(peer()),
            }),
        };
        Harness {
            coordinator: FetchCoordinator::new(self.config, collaborators),
            cache,
            http,
            decoder,
            packets,
        }
    }
}

/// Poll until `check` holds, for up to five seconds.
pub async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Poll until the request completes (or five seconds pass).
pub async fn completion(coordinator: &FetchCoordinator, id: AssetId) -> Completion {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match coordinator.poll_completion(id, None) {
            Completion::Pending | Completion::Partial(_) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            other => return other,
        }
    }
}
