//! Packet-transport bookkeeping: the network queue, per-host cancel queues,
//! batched request flushing and inbound packet delivery.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::Ordering;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{Inner, WorkerRef};
use crate::collaborators::PacketRequest;
use crate::error::PacketError;
use crate::packets::{PacketResume, FIRST_PACKET_SIZE};
use crate::schedule::PRIORITY_HIGH;
use crate::types::{AssetId, Codec, PacketHost};
use crate::worker::{FetchState, FetchWorker, SentRequest};

#[derive(Debug, Default)]
pub(super) struct NetworkQueues {
    /// Workers waiting on the packet transport.
    pub(super) network: BTreeSet<AssetId>,
    /// Cancels to send, keyed by peer (`None` is the default peer).
    pub(super) cancels: BTreeMap<Option<PacketHost>, BTreeSet<AssetId>>,
    /// Workers with an HTTP request outstanding.
    pub(super) http: HashSet<AssetId>,
    pub(super) total_http_requests: u64,
}

impl NetworkQueues {
    pub(super) fn cancel_count(&self) -> usize {
        self.cancels.values().map(BTreeSet::len).sum()
    }
}

impl Inner {
    pub(super) fn add_to_network_queue(&self, id: AssetId) {
        let known = self.workers.lock().contains_key(&id);
        let mut net = self.net.lock();
        if known {
            net.network.insert(id);
        }
        for cancels in net.cancels.values_mut() {
            cancels.remove(&id);
        }
    }

    pub(super) fn remove_from_network_queue(
        &self,
        id: AssetId,
        host: Option<&PacketHost>,
        cancel: bool,
    ) {
        let mut net = self.net.lock();
        if net.network.remove(&id) && cancel {
            net.cancels.entry(host.cloned()).or_default().insert(id);
        }
    }

    pub(super) fn add_to_http_queue(&self, id: AssetId) {
        let mut net = self.net.lock();
        net.http.insert(id);
        net.total_http_requests += 1;
    }

    pub(super) fn remove_from_http_queue(&self, id: AssetId, received: usize) {
        self.net.lock().http.remove(&id);
        self.bandwidth.lock().add_bytes(received);
    }

    /// Send due packet requests and queued cancels, at most once per
    /// request interval.
    pub(super) fn flush_network_requests(&self, now: Instant) {
        let Some(transport) = self.collab.packets.as_ref() else {
            return;
        };
        {
            let mut last = self.last_flush.lock();
            if now.saturating_duration_since(*last) < self.config.request_interval() {
                return;
            }
            *last = now;
        }

        let queued: Vec<AssetId> = self.net.lock().network.iter().copied().collect();
        let mut by_host: BTreeMap<PacketHost, Vec<(f32, WorkerRef)>> = BTreeMap::new();
        let mut stale = Vec::new();
        for id in queued {
            let Some(worker) = self.worker(id) else {
                stale.push(id);
                continue;
            };
            let (due, host, priority) = {
                let w = worker.lock();
                if w.aborted
                    || !matches!(w.state, FetchState::LoadNetwork | FetchState::LoadPackets)
                {
                    stale.push(id);
                    continue;
                }
                (self.packet_request_due(&w, now), w.host.clone(), w.image_priority)
            };
            if !due {
                continue;
            }
            let Some(host) = host.or_else(|| self.collab.origins.default_packet_host()) else {
                warn!(target: "assetfetch::fetch", asset = %id, "no packet peer to request from");
                continue;
            };
            by_host.entry(host).or_default().push((priority, worker));
        }
        if !stale.is_empty() {
            let mut net = self.net.lock();
            for id in &stale {
                net.network.remove(id);
            }
        }

        let per_message = self.config.images_per_request.max(1);
        for (host, mut workers) in by_host {
            workers.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(CmpOrdering::Equal));
            let mut sent = 0usize;
            for chunk in workers.chunks(per_message) {
                let batch: Vec<PacketRequest> = chunk
                    .iter()
                    .filter_map(|(_, worker)| self.prepare_packet_request(&mut worker.lock(), now))
                    .collect();
                if batch.is_empty() {
                    continue;
                }
                sent += batch.len();
                transport.send_requests(&host, &batch);
            }
            if sent > 0 {
                metrics::counter!("assetfetch_packet_requests_total").increment(sent as u64);
                debug!(target: "assetfetch::fetch", host = %host, requests = sent, "packet requests sent");
            }
        }

        let cancels = std::mem::take(&mut self.net.lock().cancels);
        for (host, ids) in cancels {
            let Some(host) = host.or_else(|| self.collab.origins.default_packet_host()) else {
                continue;
            };
            let ids: Vec<AssetId> = ids.into_iter().collect();
            for chunk in ids.chunks(per_message) {
                transport.send_cancels(&host, chunk);
            }
            debug!(target: "assetfetch::fetch", host = %host, cancels = ids.len(), "packet cancels sent");
        }
    }

    fn packet_request_due(&self, w: &FetchWorker, now: Instant) -> bool {
        if w.sent == SentRequest::SentPackets && w.packets.have_all() {
            return false;
        }
        if w.packet_requested_discard != Some(w.desired_discard) {
            return true;
        }
        let age = now.saturating_duration_since(w.requested_at);
        let delta = (w.requested_priority - w.image_priority).abs();
        (delta > self.config.min_delta_priority && age >= self.config.min_request_time())
            || age >= self.config.lazy_flush()
    }

    fn prepare_packet_request(&self, w: &mut FetchWorker, now: Instant) -> Option<PacketRequest> {
        if w.aborted || !matches!(w.state, FetchState::LoadNetwork | FetchState::LoadPackets) {
            return None;
        }
        if w.sent != SentRequest::SentPackets {
            match w.packets.setup(w.data.len(), w.file_size) {
                PacketResume::Misaligned => {
                    warn!(
                        target: "assetfetch::fetch",
                        asset = %w.id,
                        cached = w.data.len(),
                        "cached data does not end on a packet boundary; purging"
                    );
                    self.remove_from_cache(w);
                    w.reset_data();
                }
                PacketResume::Refetch => w.reset_data(),
                PacketResume::Fresh | PacketResume::From { .. } => {}
            }
        }
        w.sent = SentRequest::SentPackets;
        w.packet_requested_discard = Some(w.desired_discard);
        w.requested_priority = w.image_priority;
        w.requested_at = now;
        Some(PacketRequest {
            asset_id: w.id,
            discard: w.desired_discard,
            priority: w.image_priority,
            first_packet: w.packets.next_packet(),
            kind: w.kind,
        })
    }

    /// Count a packet the reassembly buffer refused. The transfer goes on.
    fn bad_packet(&self, host: &PacketHost, id: AssetId, err: PacketError) -> PacketError {
        self.counters.bad_packets.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("assetfetch_bad_packets_total").increment(1);
        debug!(target: "assetfetch::fetch", asset = %id, host = %host, error = %err, "packet rejected");
        err
    }

    /// Count a rejected packet and queue a cancel to its sender.
    fn reject(&self, host: &PacketHost, id: AssetId, err: PacketError) -> PacketError {
        let err = self.bad_packet(host, id, err);
        self.net
            .lock()
            .cancels
            .entry(Some(host.clone()))
            .or_default()
            .insert(id);
        err
    }

    fn count_packet(&self) {
        self.counters.packets.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("assetfetch_packets_total").increment(1);
    }

    pub(super) fn receive_image_header(
        &self,
        host: &PacketHost,
        id: AssetId,
        codec: u8,
        packets: u16,
        total_bytes: u32,
        data: Bytes,
    ) -> Result<(), PacketError> {
        self.count_packet();
        let Some(worker) = self.worker(id) else {
            return Err(self.reject(host, id, PacketError::UnknownAsset(id)));
        };
        let mut w = worker.lock();
        if w.state != FetchState::LoadNetwork || w.sent != SentRequest::SentPackets {
            return Err(self.reject(host, id, PacketError::NotExpected { asset: id }));
        }
        if w.packets.started() {
            return Err(self.reject(host, id, PacketError::DuplicateHeader(id)));
        }
        if data.is_empty() {
            return Err(self.reject(host, id, PacketError::Empty(id)));
        }
        self.bandwidth.lock().add_bytes(data.len());
        w.codec = Codec::from_wire(codec);
        w.packets.set_total(u32::from(packets));
        w.file_size = total_bytes as usize;
        if data.len() != FIRST_PACKET_SIZE && data.len() != w.file_size {
            let err = PacketError::BadSize {
                index: 0,
                size: data.len(),
                expected: FIRST_PACKET_SIZE,
            };
            return Err(self.bad_packet(host, id, err));
        }
        let inserted = w
            .packets
            .insert(0, data)
            .map_err(|err| self.bad_packet(host, id, err));
        trace!(target: "assetfetch::fetch", asset = %id, packets, total_bytes, "image header");
        w.state = FetchState::LoadPackets;
        let priority = PRIORITY_HIGH | w.work_priority;
        drop(w);
        self.schedule(id, priority);
        inserted
    }

    pub(super) fn receive_image_packet(
        &self,
        host: &PacketHost,
        id: AssetId,
        index: u16,
        data: Bytes,
    ) -> Result<(), PacketError> {
        self.count_packet();
        let Some(worker) = self.worker(id) else {
            return Err(self.reject(host, id, PacketError::UnknownAsset(id)));
        };
        let mut w = worker.lock();
        if !w.packets.started() {
            return Err(self.reject(host, id, PacketError::MissingHeader(id)));
        }
        if data.is_empty() {
            return Err(self.reject(host, id, PacketError::Empty(id)));
        }
        self.bandwidth.lock().add_bytes(data.len());
        let inserted = w
            .packets
            .insert(u32::from(index), data)
            .map_err(|err| self.bad_packet(host, id, err));
        if matches!(w.state, FetchState::LoadPackets | FetchState::LoadNetwork) {
            w.state = FetchState::LoadPackets;
            let priority = PRIORITY_HIGH | w.work_priority;
            drop(w);
            self.schedule(id, priority);
        } else {
            trace!(target: "assetfetch::fetch", asset = %id, index, state = w.state.as_str(), "packet after transfer ended");
            self.remove_from_network_queue(id, w.host.as_ref(), true);
        }
        inserted
    }
}
