//! Fetch coordinator: owns the workers, runs their state machines on one
//! processing task and exposes the request/poll API.
//!
//! Lock order is worker → worker map / queues → dispatcher jobs → destination
//! → registry totals. The worker map, ready queue, polling set and network
//! queues are leaves: nothing locks a worker while holding one of them.

mod network;
mod run;
mod states;
mod stats;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bandwidth::BandwidthMeter;
use crate::collaborators::Collaborators;
use crate::config::FetchConfig;
use crate::dispatcher::HttpDispatcher;
use crate::error::{FetchError, PacketError};
use crate::fail_list::FailList;
use crate::schedule::WorkQueue;
use crate::types::{AssetId, DecodedImage, FetchRequest, PacketHost};
use crate::worker::{desired_size_for, FetchState, FetchWorker};

use network::NetworkQueues;
pub use stats::{FetchProgress, FetchStats};

pub(crate) type WorkerRef = Arc<Mutex<FetchWorker>>;

/// What [`FetchCoordinator::poll_completion`] found.
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    /// No request for this asset (never made, or cancelled).
    Unknown,
    Pending,
    /// Still working, but a better image than the caller holds is ready.
    Partial(DecodedImage),
    Ready(DecodedImage),
    Failed,
}

#[derive(Debug, Default)]
struct Counters {
    packets: AtomicU64,
    bad_packets: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

pub(crate) struct Inner {
    this: Weak<Inner>,
    config: FetchConfig,
    collab: Collaborators,
    runtime: Handle,
    workers: Mutex<HashMap<AssetId, WorkerRef>>,
    // Cancelled workers waiting for outstanding operations to drain.
    doomed: Mutex<Vec<(AssetId, WorkerRef)>>,
    ready: Mutex<WorkQueue>,
    polling: Mutex<HashSet<AssetId>>,
    net: Mutex<NetworkQueues>,
    dispatcher: Arc<HttpDispatcher>,
    fail_list: Mutex<FailList>,
    bandwidth: Mutex<BandwidthMeter>,
    blocked: RwLock<HashSet<AssetId>>,
    counters: Counters,
    last_flush: Mutex<Instant>,
    quitting: AtomicBool,
    wake: Notify,
    cancel: CancellationToken,
}

impl Inner {
    fn worker(&self, id: AssetId) -> Option<WorkerRef> {
        self.workers.lock().get(&id).cloned()
    }

    fn is_doomed(&self, id: AssetId) -> bool {
        self.doomed.lock().iter().any(|(doomed, _)| *doomed == id)
    }

    fn quitting(&self) -> bool {
        self.quitting.load(Ordering::Acquire)
    }

    pub(crate) fn schedule(&self, id: AssetId, priority: u32) {
        self.ready.lock().schedule(id, priority);
        self.wake.notify_one();
    }

    fn reprioritize(&self, id: AssetId, low: u32) {
        self.ready.lock().reprioritize(id, low);
    }

    /// Drop the request and doom its worker.
    fn cancel(&self, id: AssetId) -> bool {
        let Some(worker) = self.workers.lock().remove(&id) else {
            return false;
        };
        {
            let mut w = worker.lock();
            w.aborted = true;
            self.remove_from_network_queue(id, w.host.as_ref(), true);
            if let Some(job) = w.http_job.take() {
                self.dispatcher.cancel(job);
            }
        }
        self.ready.lock().remove(id);
        self.polling.lock().remove(&id);
        self.doomed.lock().push((id, worker));
        debug!(target: "assetfetch::fetch", asset = %id, "request cancelled");
        true
    }
}

/// Front door of the fetch pipeline.
pub struct FetchCoordinator {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FetchCoordinator {
    /// Start a coordinator on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(config: FetchConfig, collaborators: Collaborators) -> Self {
        Self::with_runtime(config, collaborators, Handle::current())
    }

    pub fn with_runtime(config: FetchConfig, collaborators: Collaborators, runtime: Handle) -> Self {
        let dispatcher = HttpDispatcher::new(
            Arc::clone(&collaborators.http),
            config.registry(),
            config.max_http_connections,
            runtime.clone(),
        );
        info!(
            target: "assetfetch::fetch",
            per_destination = config.concurrency_per_destination,
            http_max_requests = config.http_max_requests,
            packets = collaborators.packets.is_some(),
            "fetch coordinator started"
        );
        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            fail_list: Mutex::new(FailList::new(config.fail_list_max_errors)),
            config,
            collab: collaborators,
            runtime: runtime.clone(),
            workers: Mutex::new(HashMap::new()),
            doomed: Mutex::new(Vec::new()),
            ready: Mutex::new(WorkQueue::default()),
            polling: Mutex::new(HashSet::new()),
            net: Mutex::new(NetworkQueues::default()),
            dispatcher,
            bandwidth: Mutex::new(BandwidthMeter::new()),
            blocked: RwLock::new(HashSet::new()),
            counters: Counters::default(),
            last_flush: Mutex::new(Instant::now()),
            quitting: AtomicBool::new(false),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        });
        let task = runtime.spawn(run::run(Arc::clone(&inner)));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// Ask for an asset, or update an outstanding request for it. Repeated
    /// requests for the same asset share one worker.
    pub fn create_or_update_request(&self, request: FetchRequest) -> Result<(), FetchError> {
        let inner = &self.inner;
        if inner.quitting() {
            return Err(FetchError::ShutDown);
        }
        let FetchRequest {
            asset_id,
            locator,
            host,
            priority,
            dimensions,
            desired_discard,
            needs_aux,
            can_use_http,
        } = request;
        let (desired_size, desired_discard) =
            desired_size_for(&locator, dimensions, desired_discard);
        let max_priority = inner.config.max_decode_priority;

        let existing = inner.worker(asset_id);
        if let Some(worker) = &existing {
            let current = worker.lock().host.clone();
            if current != host {
                warn!(
                    target: "assetfetch::fetch",
                    asset = %asset_id,
                    existing = ?current,
                    requested = ?host,
                    "request for a different packet host"
                );
                inner.cancel(asset_id);
                return Err(FetchError::HostMismatch {
                    asset: asset_id,
                    existing: current,
                });
            }
        } else if inner.is_doomed(asset_id) {
            return Err(FetchError::Aborting(asset_id));
        }

        let schedule = match existing {
            Some(worker) => {
                let mut w = worker.lock();
                w.active_count += 1;
                w.needs_aux = needs_aux;
                if let Some(low) = w.set_image_priority(priority, max_priority) {
                    inner.reprioritize(asset_id, low);
                }
                let mut schedule = w.set_desired_discard(desired_discard, desired_size);
                w.can_use_http = can_use_http;
                trace!(target: "assetfetch::fetch", asset = %asset_id, requests = w.active_count, "request updated");
                if !w.has_work {
                    w.state = FetchState::Init;
                    schedule = Some(w.add_work());
                }
                schedule
            }
            None => {
                let mut w = FetchWorker::new(
                    asset_id,
                    locator,
                    host,
                    inner.collab.packets.is_some(),
                );
                w.set_image_priority(priority, max_priority);
                w.active_count = 1;
                w.needs_aux = needs_aux;
                w.can_use_http = can_use_http;
                let schedule = w.add_work();
                w.set_desired_discard(desired_discard, desired_size);
                let mut workers = inner.workers.lock();
                if workers.contains_key(&asset_id) {
                    // Another caller created it first; theirs wins.
                    return Ok(());
                }
                workers.insert(asset_id, Arc::new(Mutex::new(w)));
                Some(schedule)
            }
        };
        debug!(
            target: "assetfetch::fetch",
            asset = %asset_id,
            discard = desired_discard,
            desired_size,
            "request registered"
        );
        if let Some(priority) = schedule {
            inner.schedule(asset_id, priority);
        }
        Ok(())
    }

    /// Check on a request. `have_discard` is the discard level the caller
    /// already holds, if any; partial results are only handed out when they
    /// improve on it.
    pub fn poll_completion(&self, id: AssetId, have_discard: Option<u8>) -> Completion {
        let Some(worker) = self.inner.worker(id) else {
            return Completion::Unknown;
        };
        let mut w = worker.lock();
        if w.aborted {
            return Completion::Failed;
        }
        if !w.has_work {
            let priority = w.add_work();
            drop(w);
            self.inner.schedule(id, priority);
            return Completion::Pending;
        }
        if w.work_done {
            w.has_work = false;
            w.work_done = false;
            return match (&w.decoded, w.decoded_discard) {
                (Some(image), Some(_)) => Completion::Ready(image.clone()),
                _ => Completion::Failed,
            };
        }
        if let (Some(image), Some(discard)) = (&w.decoded, w.decoded_discard) {
            if have_discard.is_none_or(|have| discard < have) && w.state >= FetchState::WaitWrite {
                return Completion::Partial(image.clone());
            }
        }
        Completion::Pending
    }

    pub fn update_priority(&self, id: AssetId, priority: f32) -> bool {
        let Some(worker) = self.inner.worker(id) else {
            return false;
        };
        let mut w = worker.lock();
        if let Some(low) = w.set_image_priority(priority, self.inner.config.max_decode_priority) {
            self.inner.reprioritize(id, low);
        }
        true
    }

    /// Stop fetching `id`. The worker is deleted once its outstanding cache
    /// and decode operations are drained; a packet cancel goes to its peer.
    pub fn cancel(&self, id: AssetId) -> bool {
        self.inner.cancel(id)
    }

    pub fn delete_all_requests(&self) {
        let ids: Vec<AssetId> = self.inner.workers.lock().keys().copied().collect();
        for id in ids {
            self.inner.cancel(id);
        }
    }

    /// Refuse to fetch `id` from now on.
    pub fn block_asset(&self, id: AssetId) {
        self.inner.blocked.write().insert(id);
    }

    pub fn num_requests(&self) -> usize {
        self.inner.workers.lock().len()
    }

    pub fn is_from_local_cache(&self, id: AssetId) -> bool {
        self.inner
            .worker(id)
            .is_some_and(|worker| worker.lock().in_local_cache)
    }

    pub fn fetch_state(&self, id: AssetId) -> Option<FetchProgress> {
        self.inner.progress(id)
    }

    pub fn stats(&self) -> FetchStats {
        self.inner.stats()
    }

    /// Raise or lower every destination's HTTP concurrency limit.
    pub fn adjust_concurrency(&self, increment: isize) {
        self.inner.dispatcher.adjust_concurrency(increment);
    }

    /// Header packet of a packet-transport transfer.
    pub fn receive_image_header(
        &self,
        host: &PacketHost,
        id: AssetId,
        codec: u8,
        packets: u16,
        total_bytes: u32,
        data: Bytes,
    ) -> Result<(), PacketError> {
        self.inner
            .receive_image_header(host, id, codec, packets, total_bytes, data)
    }

    pub fn receive_image_packet(
        &self,
        host: &PacketHost,
        id: AssetId,
        index: u16,
        data: Bytes,
    ) -> Result<(), PacketError> {
        self.inner.receive_image_packet(host, id, index, data)
    }

    /// Cancel everything, stop the processing task and wait (up to the fetch
    /// timeout) for outstanding cache writes.
    pub async fn shutdown(&self) {
        if self.inner.quitting.swap(true, Ordering::AcqRel) {
            return;
        }
        self.delete_all_requests();
        self.inner.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.dispatcher.shutdown();
        let deadline = Instant::now() + self.inner.config.fetch_timeout();
        loop {
            let remaining = self.inner.reap_doomed();
            if remaining == 0 || Instant::now() >= deadline {
                if remaining > 0 {
                    warn!(target: "assetfetch::fetch", remaining, "shutdown with cache writes outstanding");
                }
                break;
            }
            tokio::time::sleep(self.inner.config.tick()).await;
        }
        info!(target: "assetfetch::fetch", "fetch coordinator shut down");
    }
}

impl Drop for FetchCoordinator {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
