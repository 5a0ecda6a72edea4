use std::collections::BTreeMap;
use std::ops::Deref;

use serde::Serialize;
use tracing::{debug, warn};

use crate::class::{FairnessPolicy, RequestClass};
use crate::key::DestinationKey;
use crate::queue::{Admission, Dequeue, DestinationQueue, QueueFlags, QueueTotals, SharedTotals};
use crate::sync::{Arc, AtomicBool, Mutex, MutexGuard, Ordering};

/// Registry settings applied to every destination it creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    pub concurrency_per_destination: usize,
    pub fairness: FairnessPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            concurrency_per_destination: 8,
            fairness: FairnessPolicy::default(),
        }
    }
}

/// A destination shared between the registry and its handle holders.
#[derive(Debug)]
pub struct Destination<R> {
    key: DestinationKey,
    queue: Mutex<DestinationQueue<R>>,
}

impl<R> Destination<R> {
    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    pub fn lock(&self) -> MutexGuard<'_, DestinationQueue<R>> {
        self.queue.lock()
    }
}

/// Counted reference to a registered destination.
///
/// Handles are only minted by [`DestinationRegistry::get_or_create`], under the
/// registry lock, and are not `Clone`: the registry reads the strong count to
/// know when the last holder leaves.
///
/// Every handle must be given back with [`DestinationRegistry::release`].
/// Dropping one instead never erases the entry; it stays registered, empty,
/// until the next holder of the same key releases its own handle.
#[must_use = "give the handle back with DestinationRegistry::release"]
#[derive(Debug)]
pub struct DestinationHandle<R>(Arc<Destination<R>>);

impl<R> DestinationHandle<R> {
    fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Ask whether a producer of `class` requests should make another one.
    /// The returned [`Approval`] must be honored once the request is issued;
    /// dropping it unhonored releases the reservation with a warning.
    pub fn request_approval(
        &self,
        class: RequestClass,
        too_much_bandwidth: bool,
    ) -> Option<Approval<R>> {
        if self.lock().wants_more_requests(class, too_much_bandwidth) {
            Some(Approval {
                destination: Arc::clone(&self.0),
                class,
                settled: false,
            })
        } else {
            None
        }
    }
}

impl<R> Deref for DestinationHandle<R> {
    type Target = Destination<R>;

    fn deref(&self) -> &Destination<R> {
        &self.0
    }
}

/// Reservation obtained from [`DestinationHandle::request_approval`].
#[derive(Debug)]
pub struct Approval<R> {
    destination: Arc<Destination<R>>,
    class: RequestClass,
    settled: bool,
}

impl<R> Approval<R> {
    pub fn class(&self) -> RequestClass {
        self.class
    }

    /// The approved request was issued.
    pub fn honored(mut self) {
        self.settle();
    }

    fn settle(&mut self) {
        if !self.settled {
            self.settled = true;
            self.destination.lock().settle_approval(self.class);
        }
    }
}

impl<R> Drop for Approval<R> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                target: "assetfetch::throttle",
                destination = %self.destination.key,
                class = self.class.as_str(),
                "approval was not honored"
            );
            self.settle();
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DestinationSnapshot {
    pub key: DestinationKey,
    pub limit: usize,
    pub admitted: usize,
    pub queued: usize,
    pub holders: usize,
}

/// Process-scoped map from destination key to its shared queue.
///
/// Entries are created on first use and erased when the last external
/// holder releases its handle while nothing is queued.
pub struct DestinationRegistry<R> {
    map: Mutex<BTreeMap<DestinationKey, Arc<Destination<R>>>>,
    totals: SharedTotals,
    config: RegistryConfig,
    stopped: AtomicBool,
}

impl<R> DestinationRegistry<R> {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
            totals: Arc::new(Mutex::new(QueueTotals::default())),
            config,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn get_or_create(&self, key: &DestinationKey) -> DestinationHandle<R> {
        debug_assert!(!key.is_empty(), "empty destination key");
        let mut map = self.map.lock();
        let destination = map.entry(key.clone()).or_insert_with(|| {
            debug!(target: "assetfetch::throttle", destination = %key, "destination created");
            Arc::new(Destination {
                key: key.clone(),
                queue: Mutex::new(DestinationQueue::new(
                    key.clone(),
                    self.config.concurrency_per_destination,
                    self.config.fairness,
                    Arc::clone(&self.totals),
                )),
            })
        });
        DestinationHandle(Arc::clone(destination))
    }

    /// Give a handle back. When only the registry and this caller hold the
    /// destination and nothing is queued, the entry is erased.
    pub fn release(&self, handle: DestinationHandle<R>) {
        if handle.holders() != 2 || self.stopped.load(Ordering::Acquire) {
            return;
        }
        let mut map = self.map.lock();
        // New handles are only minted under this lock, so the count is stable now.
        if handle.holders() != 2 {
            return;
        }
        if !handle.lock().is_empty() {
            return;
        }
        match map.get(&handle.key) {
            Some(existing) if Arc::ptr_eq(existing, &handle.0) => {
                map.remove(&handle.key);
                debug!(target: "assetfetch::throttle", destination = %handle.key, "destination released");
            }
            _ => debug_assert!(false, "released destination missing from registry"),
        }
    }

    /// Promote one queued request of `handle`'s destination; when that is not
    /// possible (and something is still queued somewhere) every other
    /// destination gets one chance, each locked on its own.
    pub fn add_queued_to<A>(&self, handle: &DestinationHandle<R>, transport: &A) -> bool
    where
        A: Admission<R> + ?Sized,
    {
        let outcome = handle.lock().dequeue_one_for(transport);
        match outcome {
            Dequeue::Admitted => return true,
            Dequeue::Starved => return false,
            Dequeue::Throttled | Dequeue::Empty => {}
        }
        let siblings: Vec<Arc<Destination<R>>> = self
            .map
            .lock()
            .values()
            .filter(|d| !Arc::ptr_eq(d, &handle.0))
            .cloned()
            .collect();
        let mut admitted = false;
        for sibling in siblings {
            if sibling.lock().dequeue_one_for(transport) == Dequeue::Admitted {
                admitted = true;
            }
        }
        admitted
    }

    /// Number of requests queued across all destinations.
    pub fn total_queued(&self) -> usize {
        self.totals.lock().count()
    }

    pub fn flags(&self) -> QueueFlags {
        self.totals.lock().flags()
    }

    pub fn take_flags(&self) -> QueueFlags {
        self.totals.lock().take_flags()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn contains(&self, key: &DestinationKey) -> bool {
        self.map.lock().contains_key(key)
    }

    /// Drop every queued request everywhere.
    pub fn purge(&self) -> usize {
        let map = self.map.lock();
        let mut removed = 0;
        for destination in map.values() {
            let n = destination.lock().purge();
            if n > 0 {
                debug!(target: "assetfetch::throttle", destination = %destination.key, purged = n, "purged destination queue");
            }
            removed += n;
        }
        removed
    }

    /// Raise or lower every destination's concurrency limit, clamped to
    /// `[1, concurrency_per_destination]`.
    pub fn adjust_concurrency(&self, increment: isize) {
        let map = self.map.lock();
        for destination in map.values() {
            let applied = destination.lock().adjust_limit(increment);
            if applied != 0 {
                debug!(
                    target: "assetfetch::throttle",
                    destination = %destination.key,
                    applied,
                    "adjusted destination concurrency"
                );
            }
        }
    }

    pub fn snapshot(&self) -> Vec<DestinationSnapshot> {
        let map = self.map.lock();
        map.values()
            .map(|d| {
                let q = d.lock();
                DestinationSnapshot {
                    key: d.key.clone(),
                    limit: q.limit(),
                    admitted: q.admitted(),
                    queued: q.total_queued(),
                    holders: Arc::strong_count(d) - 1,
                }
            })
            .collect()
    }

    /// Stop erasing entries on release and clear all queues.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.purge();
    }
}

impl<R> Drop for DestinationRegistry<R> {
    fn drop(&mut self) {
        self.purge();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn registry(limit: usize) -> DestinationRegistry<u32> {
        DestinationRegistry::new(RegistryConfig {
            concurrency_per_destination: limit,
            fairness: FairnessPolicy::default(),
        })
    }

    #[test]
    fn same_key_same_destination() {
        let reg = registry(2);
        let key = DestinationKey::from_locator("http://x.example.com/a");
        let a = reg.get_or_create(&key);
        let b = reg.get_or_create(&DestinationKey::from_locator("X.EXAMPLE.COM:80"));
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(reg.len(), 1);
        reg.release(a);
        assert!(reg.contains(&key));
        reg.release(b);
        assert!(!reg.contains(&key));
    }

    #[test]
    fn release_keeps_destination_with_queued_requests() {
        let reg = registry(1);
        let key = DestinationKey::from_locator("x.example.com");
        let h = reg.get_or_create(&key);
        h.lock().enqueue(5, RequestClass::Texture);
        reg.release(h);
        assert!(reg.contains(&key));
        assert_eq!(reg.total_queued(), 1);
        assert_eq!(reg.purge(), 1);
        assert_eq!(reg.total_queued(), 0);
        let h = reg.get_or_create(&key);
        reg.release(h);
        assert!(reg.is_empty());
    }

    #[test]
    fn approval_is_settled_on_drop() {
        let reg = registry(1);
        let h = reg.get_or_create(&DestinationKey::from_locator("x.example.com"));
        let approval = h
            .request_approval(RequestClass::Mesh, false)
            .expect("room for one");
        assert!(h.request_approval(RequestClass::Mesh, false).is_none());
        drop(approval);
        let approval = h
            .request_approval(RequestClass::Mesh, false)
            .expect("released");
        approval.honored();
        assert_eq!(h.lock().approved_requests(RequestClass::Mesh), 0);
        reg.release(h);
    }

    #[test]
    fn adjust_concurrency_clamps_every_destination() {
        let reg = registry(4);
        let a = reg.get_or_create(&DestinationKey::from_locator("a.example.com"));
        let b = reg.get_or_create(&DestinationKey::from_locator("b.example.com"));
        reg.adjust_concurrency(-10);
        assert_eq!(a.lock().limit(), 1);
        assert_eq!(b.lock().limit(), 1);
        reg.adjust_concurrency(2);
        assert_eq!(a.lock().limit(), 3);
        reg.adjust_concurrency(10);
        assert_eq!(b.lock().limit(), 4);
        reg.release(a);
        reg.release(b);
    }

    #[test]
    fn dropped_handle_is_reclaimed_by_the_next_release() {
        let reg = registry(2);
        let key = DestinationKey::from_locator("a.example.com");
        drop(reg.get_or_create(&key));
        assert!(reg.contains(&key));
        assert_eq!(reg.snapshot()[0].holders, 0);

        let h = reg.get_or_create(&key);
        reg.release(h);
        assert!(!reg.contains(&key));
    }

    #[test]
    fn shutdown_stops_erasing() {
        let reg = registry(2);
        let key = DestinationKey::from_locator("a.example.com");
        let h = reg.get_or_create(&key);
        reg.shutdown();
        reg.release(h);
        assert!(reg.contains(&key));
    }
}
