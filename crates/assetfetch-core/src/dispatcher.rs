//! HTTP multiplexer in front of [`HttpTransport`]: every request passes the
//! per-destination admission of an [`assetfetch_throttle`] registry before it
//! is handed to the transport, and each completion promotes the next queued
//! request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use assetfetch_throttle::{
    Admission, DestinationHandle, DestinationKey, DestinationRegistry, DestinationSnapshot,
    QueueFlags, RegistryConfig, RequestClass,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::collaborators::{HttpRequest, HttpResponse, HttpTransport};
use crate::error::TransportError;

pub type JobId = u64;

type Reply = oneshot::Sender<Result<HttpResponse, TransportError>>;

/// A request waiting in (or popped from) a destination queue.
#[derive(Debug)]
pub struct HttpJob {
    id: JobId,
    request: HttpRequest,
    reply: Reply,
}

impl PartialEq<JobId> for HttpJob {
    fn eq(&self, other: &JobId) -> bool {
        self.id == *other
    }
}

/// Caller side of a submitted request.
#[derive(Debug)]
pub struct HttpTicket {
    id: JobId,
    rx: oneshot::Receiver<Result<HttpResponse, TransportError>>,
}

impl HttpTicket {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the response. Cancelled or purged requests resolve to
    /// [`TransportError::Cancelled`].
    pub async fn response(self) -> Result<HttpResponse, TransportError> {
        self.rx.await.unwrap_or(Err(TransportError::Cancelled))
    }
}

struct JobEntry {
    destination: DestinationHandle<HttpJob>,
    class: RequestClass,
    abort: Option<AbortHandle>,
}

pub struct HttpDispatcher {
    this: Weak<HttpDispatcher>,
    registry: DestinationRegistry<HttpJob>,
    transport: Arc<dyn HttpTransport>,
    runtime: Handle,
    // Whoever removes an entry owns releasing its admission slot.
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    in_flight: AtomicUsize,
    max_in_flight: usize,
    next_id: AtomicU64,
}

impl HttpDispatcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: RegistryConfig,
        max_in_flight: usize,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry: DestinationRegistry::new(config),
            transport,
            runtime,
            jobs: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: max_in_flight.max(1),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &DestinationRegistry<HttpJob> {
        &self.registry
    }

    /// Queue `request` behind its destination, or start it right away when
    /// the destination and the transport both have room and nothing is
    /// waiting ahead of it.
    pub fn submit(&self, class: RequestClass, request: HttpRequest) -> HttpTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = DestinationKey::from_locator(&request.url);
        let (reply, rx) = oneshot::channel();
        let job = HttpJob { id, request, reply };

        let handle = self.registry.get_or_create(&key);
        let stored = self.registry.get_or_create(&key);
        self.jobs.lock().insert(
            id,
            JobEntry {
                destination: stored,
                class,
                abort: None,
            },
        );
        let ready = {
            let mut queue = handle.lock();
            if queue.admit() && queue.is_empty() && self.has_capacity() {
                queue.mark_admitted(class);
                Some(job)
            } else {
                trace!(target: "assetfetch::http", destination = %key, job = id, "request queued");
                queue.enqueue(job, class);
                None
            }
        };
        if let Some(job) = ready {
            self.launch(job);
        }
        self.registry.release(handle);
        HttpTicket { id, rx }
    }

    /// Drop a queued request or abort a running one. Returns false when the
    /// job already completed.
    pub fn cancel(&self, id: JobId) -> bool {
        let (key, class) = match self.jobs.lock().get(&id) {
            Some(entry) => (entry.destination.key().clone(), entry.class),
            None => return false,
        };
        let handle = self.registry.get_or_create(&key);
        let was_queued = handle.lock().cancel(&id, class);
        let removed = self.jobs.lock().remove(&id);
        let cancelled = match removed {
            Some(entry) if was_queued => {
                self.registry.release(entry.destination);
                true
            }
            Some(entry) => {
                if let Some(abort) = &entry.abort {
                    abort.abort();
                }
                self.retire(entry);
                true
            }
            None => false,
        };
        if cancelled {
            debug!(target: "assetfetch::http", destination = %key, job = id, was_queued, "request cancelled");
        }
        self.registry.release(handle);
        cancelled
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn total_queued(&self) -> usize {
        self.registry.total_queued()
    }

    pub fn flags(&self) -> QueueFlags {
        self.registry.flags()
    }

    pub fn take_flags(&self) -> QueueFlags {
        self.registry.take_flags()
    }

    pub fn adjust_concurrency(&self, increment: isize) {
        self.registry.adjust_concurrency(increment);
    }

    pub fn snapshot(&self) -> Vec<DestinationSnapshot> {
        self.registry.snapshot()
    }

    /// Abort everything in flight and drop everything queued.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        let jobs: Vec<JobEntry> = self.jobs.lock().drain().map(|(_, e)| e).collect();
        for entry in &jobs {
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
        }
        self.in_flight.store(0, Ordering::Release);
        debug!(target: "assetfetch::http", aborted = jobs.len(), "dispatcher shut down");
    }

    fn launch(&self, job: HttpJob) {
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::counter!("assetfetch_http_requests_total").increment(1);
        metrics::gauge!("assetfetch_http_in_flight").set(in_flight as f64);
        let HttpJob { id, request, reply } = job;
        trace!(target: "assetfetch::http", job = id, url = %request.url, "request started");
        let transport = Arc::clone(&self.transport);
        let this = self.this.clone();
        let timeout = request.timeout;
        let task = self.runtime.spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.request(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            if let Some(dispatcher) = this.upgrade() {
                dispatcher.finish(id);
            }
            let _ = reply.send(result);
        });
        match self.jobs.lock().get_mut(&id) {
            Some(entry) => entry.abort = Some(task.abort_handle()),
            // Cancelled (or already finished) before the handle was stored.
            None => task.abort(),
        }
    }

    fn finish(&self, id: JobId) {
        let entry = self.jobs.lock().remove(&id);
        if let Some(entry) = entry {
            self.retire(entry);
        }
    }

    fn retire(&self, entry: JobEntry) {
        entry.destination.lock().mark_released(entry.class, false);
        let in_flight = self
            .in_flight
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        metrics::gauge!("assetfetch_http_in_flight").set(in_flight as f64);
        self.registry.add_queued_to(&entry.destination, self);
        self.registry.release(entry.destination);
    }
}

impl Admission<HttpJob> for HttpDispatcher {
    fn has_capacity(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) < self.max_in_flight
    }

    fn admit(&self, destination: &DestinationKey, class: RequestClass, request: HttpJob) {
        trace!(
            target: "assetfetch::http",
            destination = %destination,
            class = class.as_str(),
            job = request.id,
            "queued request admitted"
        );
        self.launch(request);
    }
}
