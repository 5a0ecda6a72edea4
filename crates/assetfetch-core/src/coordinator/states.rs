//! State dispatchers and the completion handlers of the operations they start.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use assetfetch_throttle::{DestinationKey, RequestClass};
use bytes::{Bytes, BytesMut};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{Inner, WorkerRef};
use crate::collaborators::{
    ByteRange, CacheKey, CacheRead, HttpRequest, HttpResponse, STATUS_NOT_FOUND,
    STATUS_NO_RESPONSE, STATUS_SERVICE_UNAVAILABLE,
};
use crate::error::{CacheError, DecodeError, TransportError};
use crate::headers::{HeaderOp, HttpHeaders};
use crate::schedule::{PRIORITY_HIGH, PRIORITY_NORMAL};
use crate::types::{AssetId, DecodedImage};
use crate::worker::{FetchState, FetchWorker, SentRequest, Step, WriteState};

/// Completion handler run under the worker lock. Returns true when the
/// worker should be rescheduled.
type Complete<T> = fn(&Inner, &mut FetchWorker, u64, T) -> bool;

impl Inner {
    pub(super) fn process(&self, id: AssetId) {
        let Some(worker) = self.worker(id) else {
            return;
        };
        let mut w = worker.lock();
        if !w.has_work || w.work_done {
            return;
        }
        match self.do_work(&worker, &mut w) {
            Step::Finished => {
                w.work_done = true;
                trace!(target: "assetfetch::fetch", asset = %id, state = w.state.as_str(), "work finished");
            }
            Step::Poll => {
                drop(w);
                self.polling.lock().insert(id);
            }
            Step::Idle | Step::Next(_) => {}
        }
    }

    /// Run dispatchers until one suspends. Never returns [`Step::Next`].
    fn do_work(&self, handle: &WorkerRef, w: &mut FetchWorker) -> Step {
        if (self.quitting() || w.aborted) && w.state < FetchState::Decode {
            return Step::Finished;
        }
        if w.negligible()
            && matches!(
                w.state,
                FetchState::Init | FetchState::LoadNetwork | FetchState::LoadPackets
            )
        {
            return Step::Finished;
        }
        if matches!(
            w.state,
            FetchState::LoadNetwork
                | FetchState::LoadPackets
                | FetchState::SendRequest
                | FetchState::WaitResponse
        ) && !w.can_use_net
            && !w.can_use_http
        {
            debug!(target: "assetfetch::fetch", asset = %w.id, "no source left to fetch from");
            return Step::Finished;
        }
        if w.state != FetchState::Done {
            w.fetch_started = Instant::now();
        }
        loop {
            let step = match w.state {
                FetchState::Init => self.init(w),
                FetchState::CacheRead => self.cache_read(handle, w),
                FetchState::CachePost => self.cache_post(w),
                FetchState::LoadNetwork => self.load_network(w),
                FetchState::LoadPackets => self.load_packets(w),
                FetchState::SendRequest => self.send_request(handle, w),
                FetchState::WaitResponse => self.wait_response(w),
                FetchState::Decode => self.decode(handle, w),
                FetchState::DecodeUpdate => self.decode_update(w),
                FetchState::WriteCache => self.write_cache(handle, w),
                FetchState::WaitWrite => {
                    if w.written {
                        Step::Next(FetchState::Done)
                    } else {
                        Step::Idle
                    }
                }
                FetchState::Done => match w.decoded_discard {
                    Some(discard) if w.desired_discard < discard => {
                        Step::Next(FetchState::Init)
                    }
                    _ => Step::Finished,
                },
            };
            match step {
                Step::Next(next) => {
                    trace!(
                        target: "assetfetch::fetch",
                        asset = %w.id,
                        from = w.state.as_str(),
                        to = next.as_str(),
                        "state"
                    );
                    w.state = next;
                }
                suspended => return suspended,
            }
        }
    }

    fn init(&self, w: &mut FetchWorker) -> Step {
        if self.blocked.read().contains(&w.id) {
            info!(target: "assetfetch::fetch", asset = %w.id, "blocked asset requested");
            w.state = FetchState::Done;
            return Step::Finished;
        }
        w.reset_for_init();
        Step::Next(FetchState::CacheRead)
    }

    fn cache_read(&self, handle: &WorkerRef, w: &mut FetchWorker) -> Step {
        if w.loaded {
            return Step::Next(FetchState::CachePost);
        }
        if w.pending.read.is_some() {
            return Step::Idle;
        }
        let offset = w.data.len();
        if w.desired_size <= offset {
            return Step::Next(FetchState::CachePost);
        }
        let size = w.desired_size - offset;
        w.file_size = 0;
        w.loaded = false;
        let key = if let Some(path) = w.url.strip_prefix("file://") {
            CacheKey::LocalFile(PathBuf::from(path))
        } else if w.url.is_empty() {
            CacheKey::Asset(w.id)
        } else if w.can_use_http {
            return Step::Next(FetchState::SendRequest);
        } else {
            return Step::Next(FetchState::LoadNetwork);
        };
        trace!(target: "assetfetch::fetch", asset = %w.id, key = %key, offset, size, "cache read");
        let cache = Arc::clone(&self.collab.cache);
        let seq = w.next_op();
        let read = self.spawn_op(
            handle,
            seq,
            async move { cache.read(&key, offset, size).await },
            Inner::on_cache_read,
        );
        w.pending.read = Some(read);
        Step::Idle
    }

    fn on_cache_read(
        &self,
        w: &mut FetchWorker,
        seq: u64,
        result: Result<CacheRead, CacheError>,
    ) -> bool {
        if w.op_seq != seq || w.state != FetchState::CacheRead {
            return false;
        }
        w.pending.read = None;
        match result {
            Ok(read) => {
                w.file_size = read.file_size;
                w.in_local_cache = read.local;
                w.data = append(&w.data, &read.data);
                if w.file_size != 0 && w.data.len() >= w.file_size {
                    w.have_all_data = true;
                }
            }
            Err(CacheError::Miss) => {}
            Err(err) => {
                warn!(target: "assetfetch::fetch", asset = %w.id, error = %err, "cache read failed");
            }
        }
        w.loaded = true;
        true
    }

    fn cache_post(&self, w: &mut FetchWorker) -> Step {
        w.cached_size = w.data.len();
        if w.cached_size >= w.desired_size || w.have_all_data {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("assetfetch_cache_hits_total").increment(1);
            debug!(target: "assetfetch::fetch", asset = %w.id, bytes = w.cached_size, "cache hit");
            w.loaded_discard = Some(w.desired_discard);
            w.write_state = WriteState::NotWrite;
            return Step::Next(FetchState::Decode);
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("assetfetch_cache_misses_total").increment(1);
        if w.is_local_file() {
            warn!(target: "assetfetch::fetch", asset = %w.id, url = %w.url, "local file missing");
            return Step::Finished;
        }
        Step::Next(FetchState::LoadNetwork)
    }

    fn load_network(&self, w: &mut FetchWorker) -> Step {
        if self.config.use_http && w.can_use_http && w.url.is_empty() {
            match self
                .collab
                .origins
                .http_origin(w.host.as_ref())
                .filter(|origin| !origin.is_empty())
            {
                Some(origin) => {
                    w.url = format!("{}/?texture_id={}", origin.trim_end_matches('/'), w.id);
                    w.write_state = WriteState::CanWrite;
                }
                None => w.can_use_http = false,
            }
        }
        if w.can_use_http && !w.url.is_empty() {
            let listed = self
                .fail_list
                .lock()
                .listed(&DestinationKey::from_locator(&w.url));
            if let Some(status) = listed {
                debug!(
                    target: "assetfetch::fetch",
                    asset = %w.id,
                    url = %w.url,
                    status,
                    "origin fail-listed; skipping http"
                );
                metrics::counter!("assetfetch_http_fail_listed_total").increment(1);
                w.can_use_http = false;
            }
        }
        if w.can_use_http && !w.url.is_empty() {
            if w.write_state != WriteState::NotWrite {
                w.write_state = WriteState::CanWrite;
            }
            return Step::Next(FetchState::SendRequest);
        }
        if w.sent == SentRequest::Unsent && w.can_use_net {
            w.write_state = WriteState::CanWrite;
            w.requested_size = w.desired_size as i64;
            w.requested_discard = Some(w.desired_discard);
            w.sent = SentRequest::Queued;
            self.add_to_network_queue(w.id);
        }
        Step::Idle
    }

    fn load_packets(&self, w: &mut FetchWorker) -> Step {
        if !w.process_packets() {
            // Keep it queued so the request is re-sent if packets stall.
            self.add_to_network_queue(w.id);
            return Step::Idle;
        }
        self.remove_from_network_queue(w.id, w.host.as_ref(), false);
        if w.data.is_empty() {
            warn!(target: "assetfetch::fetch", asset = %w.id, "packet transfer produced no data");
            return Step::Finished;
        }
        w.write_state = WriteState::ShouldWrite;
        Step::Next(FetchState::Decode)
    }

    fn send_request(&self, handle: &WorkerRef, w: &mut FetchWorker) -> Step {
        if !w.can_use_http {
            return Step::Finished;
        }
        let active = self.net.lock().http.len();
        let kbps = self.bandwidth.lock().kbps();
        if active >= self.config.http_max_requests
            || (kbps > self.config.http_throttle_kbps && active > self.config.http_min_requests)
        {
            return Step::Poll;
        }
        self.remove_from_network_queue(w.id, w.host.as_ref(), false);

        let cur = w.data.len();
        if w.have_all_data {
            if cur == 0 {
                return Step::Finished;
            }
            w.loaded_discard = Some(0);
            return Step::Next(FetchState::Decode);
        }
        w.requested_size = w.desired_size.saturating_sub(cur) as i64;
        w.requested_discard = Some(w.desired_discard);
        w.requested_offset = cur;
        if w.url.is_empty() {
            warn!(target: "assetfetch::fetch", asset = %w.id, "no url to fetch from");
            w.http_fail_count += 1;
            return Step::Finished;
        }
        w.requested_at = Instant::now();
        w.loaded = false;
        w.http_status = 0;
        w.http_reason.clear();
        // Re-read the last byte we have so a truncated response is detectable.
        if w.requested_offset > 0 {
            w.requested_offset -= 1;
            w.requested_size += 1;
        }
        let range = (w.requested_offset > 0 || w.requested_size > 0).then(|| ByteRange {
            offset: w.requested_offset as u64,
            length: w.requested_size.max(0) as u64,
        });
        let mut headers = HttpHeaders::with("Accept", "image/x-j2c");
        if let Some(range) = &range {
            headers.add("Range", range.header_value(), HeaderOp::ReplaceIfExists);
        }
        debug!(
            target: "assetfetch::fetch",
            asset = %w.id,
            url = %w.url,
            offset = w.requested_offset,
            bytes = w.requested_size,
            kbps,
            "http get"
        );
        self.add_to_http_queue(w.id);
        let ticket = self.dispatcher.submit(
            RequestClass::Texture,
            HttpRequest {
                url: w.url.clone(),
                range,
                headers,
                timeout: self.config.fetch_timeout(),
            },
        );
        w.http_job = Some(ticket.id());
        let seq = w.next_op();
        // The dispatcher owns cancellation of the request itself.
        let _ = self.spawn_op(handle, seq, ticket.response(), Inner::on_http_response);
        Step::Next(FetchState::WaitResponse)
    }

    fn on_http_response(
        &self,
        w: &mut FetchWorker,
        seq: u64,
        result: Result<HttpResponse, TransportError>,
    ) -> bool {
        if w.op_seq != seq || w.state != FetchState::WaitResponse || w.loaded {
            debug!(target: "assetfetch::http", asset = %w.id, "response for a request no longer waited on");
            return false;
        }
        w.http_job = None;
        let received = match result {
            Ok(response) if response.is_success() => {
                let received = response.body.len();
                w.http_status = response.status;
                w.accept_http_body(response.body);
                received
            }
            Ok(response) => {
                w.requested_size = -1;
                w.http_status = response.status;
                w.http_reason = response.reason;
                0
            }
            Err(err) => {
                w.requested_size = -1;
                w.http_status = err.status();
                w.http_reason = err.to_string();
                0
            }
        };
        w.loaded = true;
        self.remove_from_http_queue(w.id, received);
        true
    }

    fn wait_response(&self, w: &mut FetchWorker) -> Step {
        if !w.loaded {
            if w.requested_at.elapsed() <= self.config.fetch_timeout() {
                return Step::Poll;
            }
            warn!(target: "assetfetch::http", asset = %w.id, url = %w.url, "http request timed out");
            if let Some(job) = w.http_job.take() {
                self.dispatcher.cancel(job);
            }
            self.remove_from_http_queue(w.id, 0);
            w.state = FetchState::Done;
            return Step::Finished;
        }

        if w.requested_size < 0 {
            let status = w.http_status;
            let max_attempts = match status {
                STATUS_NOT_FOUND | STATUS_NO_RESPONSE => {
                    if status == STATUS_NO_RESPONSE {
                        self.fail_list.lock().add(
                            DestinationKey::from_locator(&w.url),
                            self.config.fail_list_ttl(),
                            status,
                        );
                    }
                    debug!(
                        target: "assetfetch::http",
                        asset = %w.id,
                        status,
                        reason = %w.http_reason,
                        "http fetch failed"
                    );
                    w.http_fail_count = 1;
                    return self.fall_back_or_fail(w);
                }
                STATUS_SERVICE_UNAVAILABLE => {
                    w.http_fail_count += 1;
                    w.http_fail_count + 1
                }
                _ => {
                    w.http_fail_count += 1;
                    self.config.http_max_attempts()
                }
            };
            if w.http_fail_count < max_attempts {
                metrics::counter!("assetfetch_http_retries_total").increment(1);
                info!(
                    target: "assetfetch::http",
                    asset = %w.id,
                    status,
                    attempt = w.http_fail_count,
                    "retrying http fetch"
                );
                return Step::Next(FetchState::SendRequest);
            }
            if !w.data.is_empty() {
                // Decode what the earlier responses delivered.
                w.loaded_discard = w.requested_discard;
                return Step::Next(FetchState::Decode);
            }
            warn!(
                target: "assetfetch::http",
                asset = %w.id,
                status,
                reason = %w.http_reason,
                attempts = w.http_fail_count,
                "http fetch failed"
            );
            return self.fall_back_or_fail(w);
        }

        if w.http_body.is_empty() {
            warn!(target: "assetfetch::http", asset = %w.id, "empty http body");
            return Step::Finished;
        }
        if !w.merge_http_body() {
            warn!(
                target: "assetfetch::http",
                asset = %w.id,
                offset = w.requested_offset,
                have = w.data.len(),
                "http range starts past buffered data"
            );
            return Step::Finished;
        }
        w.loaded_discard = w.requested_discard;
        if w.write_state != WriteState::NotWrite {
            w.write_state = WriteState::ShouldWrite;
        }
        Step::Next(FetchState::Decode)
    }

    fn fall_back_or_fail(&self, w: &mut FetchWorker) -> Step {
        w.reset_data();
        if w.can_use_net {
            debug!(target: "assetfetch::fetch", asset = %w.id, "falling back to packets");
            w.can_use_http = false;
            Step::Next(FetchState::Init)
        } else {
            w.state = FetchState::Done;
            Step::Finished
        }
    }

    fn decode(&self, handle: &WorkerRef, w: &mut FetchWorker) -> Step {
        let Some(loaded) = w.loaded_discard.filter(|_| !w.data.is_empty()) else {
            warn!(target: "assetfetch::fetch", asset = %w.id, "nothing to decode");
            w.state = FetchState::Done;
            return Step::Finished;
        };
        let discard = if w.have_all_data { 0 } else { loaded };
        w.decoded = None;
        w.decode_done = false;
        let decoder = Arc::clone(&self.collab.decoder);
        let data = w.data.clone();
        let priority = PRIORITY_NORMAL | w.work_priority;
        let want_aux = w.needs_aux;
        trace!(
            target: "assetfetch::fetch",
            asset = %w.id,
            bytes = data.len(),
            codec = ?w.codec,
            discard,
            "decode"
        );
        let seq = w.next_op();
        let decode = self.spawn_op(
            handle,
            seq,
            async move { decoder.decode(data, priority, discard, want_aux).await },
            Inner::on_decoded,
        );
        w.pending.decode = Some(decode);
        Step::Next(FetchState::DecodeUpdate)
    }

    fn on_decoded(
        &self,
        w: &mut FetchWorker,
        seq: u64,
        result: Result<DecodedImage, DecodeError>,
    ) -> bool {
        if w.pending.decode.is_none() || w.op_seq != seq {
            return false;
        }
        w.pending.decode = None;
        if w.state != FetchState::DecodeUpdate {
            return false;
        }
        match result {
            Ok(image) => {
                w.decoded_discard = Some(image.discard);
                w.decoded = Some(image);
            }
            Err(err) => {
                metrics::counter!("assetfetch_decode_failures_total").increment(1);
                warn!(target: "assetfetch::fetch", asset = %w.id, error = %err, "decode failed");
                self.remove_from_cache(w);
                w.decoded_discard = None;
            }
        }
        w.decode_done = true;
        true
    }

    fn decode_update(&self, w: &mut FetchWorker) -> Step {
        if !w.decode_done {
            return Step::Idle;
        }
        if w.decoded_discard.is_some() {
            return Step::Next(FetchState::WriteCache);
        }
        if w.cached_size > 0 && !w.in_local_cache && w.retry_attempt == 0 {
            // The cached copy was probably corrupt; fetch it again once.
            info!(target: "assetfetch::fetch", asset = %w.id, "refetching after decode failure");
            w.reset_data();
            w.retry_attempt += 1;
            return Step::Next(FetchState::Init);
        }
        w.state = FetchState::Done;
        Step::Finished
    }

    fn write_cache(&self, handle: &WorkerRef, w: &mut FetchWorker) -> Step {
        if w.write_state != WriteState::ShouldWrite || w.data.is_empty() {
            return Step::Next(FetchState::Done);
        }
        let len = w.data.len();
        if w.file_size < len {
            w.file_size = if w.have_all_data { len } else { len + 1 };
        }
        w.written = false;
        let cache = Arc::clone(&self.collab.cache);
        let key = CacheKey::Asset(w.id);
        let data = w.data.clone();
        let hint = w.file_size;
        let seq = w.next_op();
        let write = self.spawn_op(
            handle,
            seq,
            async move { cache.write(&key, data, hint).await },
            Inner::on_written,
        );
        w.pending.write = Some(write);
        Step::Next(FetchState::WaitWrite)
    }

    fn on_written(&self, w: &mut FetchWorker, _seq: u64, result: Result<(), CacheError>) -> bool {
        w.pending.write = None;
        if let Err(err) = result {
            warn!(target: "assetfetch::fetch", asset = %w.id, error = %err, "cache write failed");
        }
        if w.state != FetchState::WaitWrite {
            return false;
        }
        w.written = true;
        true
    }

    pub(super) fn remove_from_cache(&self, w: &FetchWorker) {
        if !w.in_local_cache {
            self.collab.cache.remove(&CacheKey::Asset(w.id));
        }
    }

    /// Run `op` on the runtime and feed its output to `complete` under the
    /// worker lock. Only weak references are held, so a cancelled worker
    /// that is already gone simply drops the result.
    fn spawn_op<T, F>(&self, handle: &WorkerRef, seq: u64, op: F, complete: Complete<T>) -> AbortHandle
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.this.clone();
        let worker = Arc::downgrade(handle);
        self.runtime
            .spawn(async move {
                let output = op.await;
                let (Some(inner), Some(worker)) = (inner.upgrade(), worker.upgrade()) else {
                    return;
                };
                let reschedule = {
                    let mut w = worker.lock();
                    let wanted = complete(&inner, &mut w, seq, output);
                    (wanted && w.has_work && !w.aborted).then(|| (w.id, PRIORITY_HIGH | w.work_priority))
                };
                if let Some((id, priority)) = reschedule {
                    inner.schedule(id, priority);
                }
            })
            .abort_handle()
    }
}

fn append(data: &Bytes, more: &Bytes) -> Bytes {
    if data.is_empty() {
        return more.clone();
    }
    let mut merged = BytesMut::with_capacity(data.len() + more.len());
    merged.extend_from_slice(data);
    merged.extend_from_slice(more);
    merged.freeze()
}
