//! Per-asset fetch state. The coordinator drives the transitions; this module
//! holds the data a worker carries between them and the transitions that need
//! nothing but that data.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::dispatcher::JobId;
use crate::packets::{PacketBuffer, FIRST_PACKET_SIZE};
use crate::schedule::{scale_priority, PRIORITY_HIGH};
use crate::types::{AssetId, AssetKind, Codec, DecodedImage, Dimensions, PacketHost};

/// Smallest read worth issuing; also the size of a header-only fetch.
pub const CACHE_ENTRY_SIZE: usize = FIRST_PACKET_SIZE;
/// Desired size meaning "the whole asset".
pub const MAX_IMAGE_DATA_SIZE: usize = 2048 * 2048 * 8;
pub const MAX_DISCARD_LEVEL: u8 = 5;

const ALMOST_ZERO: f32 = 0.0001;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    Init,
    CacheRead,
    CachePost,
    LoadNetwork,
    LoadPackets,
    SendRequest,
    WaitResponse,
    Decode,
    DecodeUpdate,
    WriteCache,
    WaitWrite,
    Done,
}

impl FetchState {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchState::Init => "init",
            FetchState::CacheRead => "cache_read",
            FetchState::CachePost => "cache_post",
            FetchState::LoadNetwork => "load_network",
            FetchState::LoadPackets => "load_packets",
            FetchState::SendRequest => "send_request",
            FetchState::WaitResponse => "wait_response",
            FetchState::Decode => "decode",
            FetchState::DecodeUpdate => "decode_update",
            FetchState::WriteCache => "write_cache",
            FetchState::WaitWrite => "wait_write",
            FetchState::Done => "done",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteState {
    NotWrite,
    CanWrite,
    ShouldWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SentRequest {
    Unsent,
    Queued,
    SentPackets,
}

/// Result of one state dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Fall through to the next state right away.
    Next(FetchState),
    /// Suspend until a completion or an inbound packet reschedules the worker.
    Idle,
    /// Suspend and run again on the next tick.
    Poll,
    /// Work is complete, successfully or not.
    Finished,
}

/// Outstanding collaborator operations.
#[derive(Debug, Default)]
pub(crate) struct PendingOps {
    pub(crate) read: Option<AbortHandle>,
    pub(crate) write: Option<AbortHandle>,
    pub(crate) decode: Option<AbortHandle>,
}

#[derive(Debug)]
pub(crate) struct FetchWorker {
    pub(crate) id: AssetId,
    pub(crate) host: Option<PacketHost>,
    pub(crate) url: String,
    pub(crate) kind: AssetKind,
    pub(crate) state: FetchState,
    pub(crate) write_state: WriteState,
    pub(crate) sent: SentRequest,

    pub(crate) image_priority: f32,
    pub(crate) work_priority: u32,
    pub(crate) requested_priority: f32,

    pub(crate) desired_discard: u8,
    pub(crate) desired_size: usize,
    pub(crate) packet_requested_discard: Option<u8>,
    pub(crate) requested_discard: Option<u8>,
    pub(crate) loaded_discard: Option<u8>,
    pub(crate) decoded_discard: Option<u8>,

    pub(crate) data: Bytes,
    pub(crate) http_body: Bytes,
    pub(crate) codec: Codec,
    pub(crate) decoded: Option<DecodedImage>,
    pub(crate) packets: PacketBuffer,

    // Negative marks a failed request.
    pub(crate) requested_size: i64,
    pub(crate) requested_offset: usize,
    pub(crate) file_size: usize,
    pub(crate) cached_size: usize,

    pub(crate) loaded: bool,
    pub(crate) decode_done: bool,
    pub(crate) written: bool,
    pub(crate) needs_aux: bool,
    pub(crate) have_all_data: bool,
    pub(crate) in_local_cache: bool,
    pub(crate) can_use_http: bool,
    pub(crate) can_use_net: bool,

    pub(crate) http_status: u16,
    pub(crate) http_reason: String,
    pub(crate) http_fail_count: u32,
    pub(crate) http_job: Option<JobId>,
    pub(crate) retry_attempt: u32,
    pub(crate) active_count: u32,

    pub(crate) requested_at: Instant,
    pub(crate) fetch_started: Instant,

    pub(crate) has_work: bool,
    pub(crate) work_done: bool,
    pub(crate) aborted: bool,
    pub(crate) op_seq: u64,
    pub(crate) pending: PendingOps,
}

impl FetchWorker {
    pub(crate) fn new(
        id: AssetId,
        url: String,
        host: Option<PacketHost>,
        packets_available: bool,
    ) -> Self {
        let now = Instant::now();
        let kind = if host.is_some() {
            AssetKind::Baked
        } else {
            AssetKind::Normal
        };
        Self {
            id,
            can_use_net: url.is_empty() && packets_available,
            host,
            url,
            kind,
            state: FetchState::Init,
            write_state: WriteState::NotWrite,
            sent: SentRequest::Unsent,
            image_priority: 0.0,
            work_priority: 0,
            requested_priority: 0.0,
            desired_discard: MAX_DISCARD_LEVEL,
            desired_size: CACHE_ENTRY_SIZE,
            packet_requested_discard: None,
            requested_discard: None,
            loaded_discard: None,
            decoded_discard: None,
            data: Bytes::new(),
            http_body: Bytes::new(),
            codec: Codec::Unknown,
            decoded: None,
            packets: PacketBuffer::default(),
            requested_size: 0,
            requested_offset: 0,
            file_size: 0,
            cached_size: 0,
            loaded: false,
            decode_done: false,
            written: false,
            needs_aux: false,
            have_all_data: false,
            in_local_cache: false,
            can_use_http: true,
            http_status: 0,
            http_reason: String::new(),
            http_fail_count: 0,
            http_job: None,
            retry_attempt: 0,
            active_count: 0,
            requested_at: now,
            fetch_started: now,
            has_work: false,
            work_done: false,
            aborted: false,
            op_seq: 0,
            pending: PendingOps::default(),
        }
    }

    pub(crate) fn is_local_file(&self) -> bool {
        self.url.starts_with("file://")
    }

    /// Priority too low to be worth fetching from the network.
    pub(crate) fn negligible(&self) -> bool {
        self.image_priority < ALMOST_ZERO
    }

    pub(crate) fn next_op(&mut self) -> u64 {
        self.op_seq += 1;
        self.op_seq
    }

    /// Mark the worker runnable. Returns the priority to schedule it at.
    pub(crate) fn add_work(&mut self) -> u32 {
        self.has_work = true;
        self.work_done = false;
        PRIORITY_HIGH | self.work_priority
    }

    /// Adopt a new caller priority when it moved by more than 5% (or the
    /// worker is done). Returns the new low scheduling bits when it changed.
    pub(crate) fn set_image_priority(&mut self, priority: f32, max_priority: f32) -> Option<u32> {
        let delta = (priority - self.image_priority).abs();
        if delta > self.image_priority * 0.05 || self.state == FetchState::Done {
            self.image_priority = priority;
            self.work_priority = scale_priority(priority, max_priority);
            Some(self.work_priority)
        } else {
            None
        }
    }

    /// Update the requested quality. Returns a priority when the worker must
    /// be (re)scheduled.
    pub(crate) fn set_desired_discard(&mut self, discard: u8, size: usize) -> Option<u32> {
        let mut schedule = None;
        let mut prioritize = false;
        if self.desired_discard != discard {
            if !self.has_work {
                schedule = Some(self.add_work());
            } else if self.desired_discard < discard {
                prioritize = true;
            }
            self.desired_discard = discard;
            self.desired_size = size;
        } else if size > self.desired_size {
            self.desired_size = size;
            prioritize = true;
        }
        self.desired_size = self.desired_size.max(CACHE_ENTRY_SIZE);
        if prioritize && self.state == FetchState::Init {
            schedule = Some(self.add_work());
        } else if self.state == FetchState::Done {
            // A done worker only refetches for better quality than it decoded;
            // otherwise the scheduled pass hands back the existing result.
            if self.decoded_discard.is_none_or(|decoded| discard < decoded) {
                self.state = FetchState::Init;
            }
            schedule = Some(self.add_work());
        }
        schedule
    }

    /// Clear per-attempt state before reading the cache again. Buffered bytes
    /// survive so a better-quality pass continues from them.
    pub(crate) fn reset_for_init(&mut self) {
        self.decoded = None;
        self.requested_discard = None;
        self.loaded_discard = None;
        self.decoded_discard = None;
        self.requested_size = 0;
        self.requested_offset = 0;
        self.file_size = 0;
        self.cached_size = 0;
        self.loaded = false;
        self.sent = SentRequest::Unsent;
        self.decode_done = false;
        self.written = false;
        self.http_body = Bytes::new();
        self.have_all_data = false;
        self.packets.clear();
        self.desired_size = self.desired_size.max(CACHE_ENTRY_SIZE);
    }

    pub(crate) fn reset_data(&mut self) {
        self.data = Bytes::new();
    }

    /// Record a successful HTTP body and note whether it completes the asset.
    pub(crate) fn accept_http_body(&mut self, body: Bytes) {
        let received = body.len() as i64;
        if received > 0 {
            if received < self.requested_size && self.requested_discard == Some(0) {
                self.have_all_data = true;
            } else if received > self.requested_size {
                // The range was ignored and the whole asset came back.
                self.have_all_data = true;
                self.requested_offset = 0;
                self.data = Bytes::new();
            }
        } else {
            self.have_all_data = true;
        }
        self.requested_size = received;
        self.http_body = body;
    }

    /// Splice the last HTTP body onto the buffered bytes, dropping the part
    /// that overlaps what is already buffered. Returns false when the body
    /// starts past the end of the buffer.
    pub(crate) fn merge_http_body(&mut self) -> bool {
        let cur = self.data.len();
        let body = std::mem::take(&mut self.http_body);
        let mut requested = self.requested_size.max(0) as usize;
        let mut src_offset = 0;
        if self.requested_offset != 0 && self.requested_offset != cur {
            if self.requested_offset > cur {
                return false;
            }
            src_offset = cur - self.requested_offset;
            requested = requested.saturating_sub(src_offset);
            self.requested_size = requested as i64;
            self.requested_offset += src_offset;
        }
        let total = cur + requested;
        self.file_size = if self.have_all_data && self.requested_discard == Some(0) {
            total
        } else {
            // One more than we have flags the asset as incomplete.
            total + 1
        };
        let end = (src_offset + requested).min(body.len());
        let mut merged = BytesMut::with_capacity(total);
        merged.extend_from_slice(&self.data);
        if src_offset < end {
            merged.extend_from_slice(&body[src_offset..end]);
        }
        self.data = merged.freeze();
        true
    }

    /// Fold the contiguous packets into the buffer once they cover the
    /// request. Returns true when the packet transfer is over.
    pub(crate) fn process_packets(&mut self) -> bool {
        if self.requested_size < 0 {
            self.data = Bytes::new();
            return true;
        }
        let Some(last) = self.packets.last() else {
            return false;
        };
        if last < self.packets.first() {
            return false;
        }
        let cur = self.data.len();
        let keep_prefix = cur > 0 && self.packets.first() > 0;
        let buffer_size = if keep_prefix { cur } else { 0 } + self.packets.contiguous_len();
        let have_all = self.packets.have_all();
        if self.requested_size <= 0 {
            return true;
        }
        if buffer_size as i64 >= self.requested_size || have_all {
            if have_all {
                self.have_all_data = true;
            }
            if buffer_size > cur || !keep_prefix {
                let mut merged = BytesMut::with_capacity(buffer_size);
                if keep_prefix {
                    merged.extend_from_slice(&self.data);
                }
                for packet in self.packets.contiguous() {
                    merged.extend_from_slice(packet);
                }
                self.data = merged.freeze();
            }
            self.loaded_discard = self.requested_discard;
            return true;
        }
        false
    }
}

/// Bytes worth fetching for `desired_discard`, and the discard actually
/// requested.
pub(crate) fn desired_size_for(
    locator: &str,
    dimensions: Option<Dimensions>,
    desired_discard: u8,
) -> (usize, u8) {
    let partial = locator.is_empty()
        || Codec::from_locator(locator).is_none_or(|codec| codec == Codec::J2c);
    if !partial {
        return (MAX_IMAGE_DATA_SIZE, 0);
    }
    if desired_discard == 0 {
        return (MAX_IMAGE_DATA_SIZE, 0);
    }
    match dimensions {
        Some(d) if d.width > 0 && d.height > 0 && d.components > 0 => (
            estimate_data_size(d.width, d.height, d.components, desired_discard),
            desired_discard,
        ),
        _ => (CACHE_ENTRY_SIZE, MAX_DISCARD_LEVEL),
    }
}

/// Compressed bytes needed to decode a `width`×`height` image at `discard`,
/// assuming one bit per component per pixel.
pub fn estimate_data_size(width: u32, height: u32, components: u8, discard: u8) -> usize {
    let shift = u32::from(discard.min(MAX_DISCARD_LEVEL));
    let w = (u64::from(width) >> shift).max(1);
    let h = (u64::from(height) >> shift).max(1);
    let bytes = (w * h * u64::from(components)) as f64 * 0.125;
    (bytes as usize).max(CACHE_ENTRY_SIZE)
}
