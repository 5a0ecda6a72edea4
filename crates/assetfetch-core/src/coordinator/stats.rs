use std::sync::atomic::Ordering;
use std::time::Duration;

use assetfetch_throttle::{DestinationSnapshot, QueueFlags};
use serde::Serialize;

use super::Inner;
use crate::packets::{FIRST_PACKET_SIZE, MAX_PACKET_SIZE};
use crate::types::AssetId;
use crate::worker::FetchState;

/// Progress of one request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FetchProgress {
    pub state: FetchState,
    /// Fraction of the asset received, 0 when the size is unknown.
    pub data_progress: f32,
    pub requested_priority: f32,
    pub work_priority: u32,
    pub fetch_elapsed: Duration,
    pub request_elapsed: Duration,
    pub can_use_http: bool,
}

/// Point-in-time view of the coordinator.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FetchStats {
    pub workers: usize,
    /// Cancelled workers still draining operations.
    pub deleting: usize,
    pub ready: usize,
    pub polling: usize,
    pub network_queue: usize,
    pub cancel_queue: usize,
    pub http_queue: usize,
    pub total_http_requests: u64,
    pub http_in_flight: usize,
    pub http_queued: usize,
    pub packets: u64,
    pub bad_packets: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub bandwidth_kbps: f64,
    pub bytes_received: u64,
    pub queue_flags: QueueFlags,
    pub destinations: Vec<DestinationSnapshot>,
}

impl Inner {
    pub(super) fn progress(&self, id: AssetId) -> Option<FetchProgress> {
        let worker = self.worker(id)?;
        let w = worker.lock();
        let data_progress = if w.file_size == 0 {
            0.0
        } else {
            let have = if w.state == FetchState::LoadPackets {
                match w.packets.last() {
                    Some(last) if last > 0 => {
                        FIRST_PACKET_SIZE + (last as usize - 1) * MAX_PACKET_SIZE
                    }
                    _ => 0,
                }
            } else {
                w.data.len()
            };
            (have as f32 / w.file_size as f32).min(1.0)
        };
        Some(FetchProgress {
            state: w.state,
            data_progress,
            requested_priority: w.requested_priority,
            work_priority: w.work_priority,
            fetch_elapsed: w.fetch_started.elapsed(),
            request_elapsed: w.requested_at.elapsed(),
            can_use_http: w.can_use_http,
        })
    }

    pub(super) fn stats(&self) -> FetchStats {
        let (network_queue, cancel_queue, http_queue, total_http_requests) = {
            let net = self.net.lock();
            (
                net.network.len(),
                net.cancel_count(),
                net.http.len(),
                net.total_http_requests,
            )
        };
        let (bandwidth_kbps, bytes_received) = {
            let meter = self.bandwidth.lock();
            (meter.kbps(), meter.total_bytes())
        };
        let cache_hits = self.counters.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.counters.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;
        FetchStats {
            workers: self.workers.lock().len(),
            deleting: self.doomed.lock().len(),
            ready: self.ready.lock().len(),
            polling: self.polling.lock().len(),
            network_queue,
            cancel_queue,
            http_queue,
            total_http_requests,
            http_in_flight: self.dispatcher.in_flight(),
            http_queued: self.dispatcher.total_queued(),
            packets: self.counters.packets.load(Ordering::Relaxed),
            bad_packets: self.counters.bad_packets.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
            bandwidth_kbps,
            bytes_received,
            queue_flags: self.dispatcher.flags(),
            destinations: self.dispatcher.snapshot(),
        }
    }

    pub(super) fn publish_gauges(&self) {
        let workers = self.workers.lock().len();
        let ready = self.ready.lock().len();
        let (network, http) = {
            let net = self.net.lock();
            (net.network.len(), net.http.len())
        };
        metrics::gauge!("assetfetch_workers").set(workers as f64);
        metrics::gauge!("assetfetch_ready_queue").set(ready as f64);
        metrics::gauge!("assetfetch_network_queue").set(network as f64);
        metrics::gauge!("assetfetch_http_queue").set(http as f64);
        metrics::gauge!("assetfetch_http_queued").set(self.dispatcher.total_queued() as f64);
    }
}
