use std::collections::VecDeque;

use serde::Serialize;

use crate::class::{FairnessPolicy, RequestClass};
use crate::key::DestinationKey;
use crate::sync::{Arc, Mutex};

/// Transport side of admission: the multiplexer that actually runs requests.
pub trait Admission<R> {
    /// Whether the transport as a whole can take another request (total
    /// connection cap, bandwidth throttle).
    fn has_capacity(&self) -> bool;

    /// Hand over a request popped from a destination queue. The destination
    /// already counted it as admitted.
    fn admit(&self, destination: &DestinationKey, class: RequestClass, request: R);
}

/// Sticky signals recorded while dequeuing; the multiplexer reads and resets
/// them to tune concurrency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueFlags {
    /// A request was taken and the queue became empty.
    pub empty: bool,
    /// A request was taken and more remained.
    pub full: bool,
    /// There was room to admit but nothing was queued.
    pub starvation: bool,
}

impl QueueFlags {
    pub fn take(&mut self) -> QueueFlags {
        std::mem::take(self)
    }
}

/// Process-wide queued count, guarded by its own lock.
#[derive(Debug, Default)]
pub struct QueueTotals {
    count: usize,
    flags: QueueFlags,
}

impl QueueTotals {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    pub fn take_flags(&mut self) -> QueueFlags {
        self.flags.take()
    }

    fn queued(&mut self) {
        self.count += 1;
        metrics::gauge!("assetfetch_queued_requests").set(self.count as f64);
    }

    fn removed(&mut self, n: usize) {
        debug_assert!(self.count >= n, "global queued count underflow");
        self.count = self.count.saturating_sub(n);
        metrics::gauge!("assetfetch_queued_requests").set(self.count as f64);
    }
}

pub type SharedTotals = Arc<Mutex<QueueTotals>>;

/// Outcome of one [`DestinationQueue::dequeue_one_for`] attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dequeue {
    /// One request was handed to the transport.
    Admitted,
    /// Something is queued here but the destination or transport is saturated.
    Throttled,
    /// Nothing queued here, but other destinations still hold requests.
    Empty,
    /// Nothing queued anywhere.
    Starved,
}

#[derive(Debug)]
struct ClassQueue<R> {
    queued: VecDeque<R>,
    added: usize,
    downloading: usize,
    approved: usize,
    queued_commands: usize,
    max_pipelined: usize,
    flags: QueueFlags,
}

impl<R> ClassQueue<R> {
    fn new(max_pipelined: usize) -> Self {
        Self {
            queued: VecDeque::new(),
            added: 0,
            downloading: 0,
            approved: 0,
            queued_commands: 0,
            max_pipelined,
            flags: QueueFlags::default(),
        }
    }

    fn pipelined(&self) -> usize {
        self.queued_commands + self.queued.len() + self.added
    }
}

/// Admission state for one destination.
///
/// Requests above the concurrency limit wait in one FIFO per
/// [`RequestClass`]; `dequeue_one_for` promotes them as capacity frees up.
#[derive(Debug)]
pub struct DestinationQueue<R> {
    key: DestinationKey,
    classes: [ClassQueue<R>; RequestClass::COUNT],
    total_added: usize,
    limit: usize,
    configured_limit: usize,
    approved_first: usize,
    best_effort_first: usize,
    fairness: FairnessPolicy,
    totals: SharedTotals,
}

impl<R> DestinationQueue<R> {
    pub fn new(
        key: DestinationKey,
        limit: usize,
        fairness: FairnessPolicy,
        totals: SharedTotals,
    ) -> Self {
        let limit = limit.max(1);
        Self {
            key,
            classes: std::array::from_fn(|_| ClassQueue::new(limit)),
            total_added: 0,
            limit,
            configured_limit: limit,
            approved_first: 0,
            best_effort_first: 0,
            fairness,
            totals,
        }
    }

    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    /// Current concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn admitted(&self) -> usize {
        self.total_added
    }

    pub fn admitted_in(&self, class: RequestClass) -> usize {
        self.classes[class.index()].added
    }

    pub fn downloading_in(&self, class: RequestClass) -> usize {
        self.classes[class.index()].downloading
    }

    /// True when another request may go out to this destination right now.
    pub fn admit(&self) -> bool {
        self.total_added < self.limit
    }

    pub fn throttled(&self) -> bool {
        !self.admit()
    }

    pub fn mark_admitted(&mut self, class: RequestClass) {
        self.classes[class.index()].added += 1;
        self.total_added += 1;
    }

    /// The first bytes of an admitted request arrived.
    pub fn mark_downloading(&mut self, class: RequestClass) {
        self.classes[class.index()].downloading += 1;
    }

    /// An admitted request left the transport. `downloaded` must match an
    /// earlier [`mark_downloading`](Self::mark_downloading).
    pub fn mark_released(&mut self, class: RequestClass, downloaded: bool) {
        let ct = &mut self.classes[class.index()];
        debug_assert!(ct.added > 0 && self.total_added > 0, "release without admit");
        ct.added = ct.added.saturating_sub(1);
        if downloaded {
            debug_assert!(ct.downloading > 0);
            ct.downloading = ct.downloading.saturating_sub(1);
        }
        self.total_added = self.total_added.saturating_sub(1);
    }

    pub fn enqueue(&mut self, request: R, class: RequestClass) {
        self.classes[class.index()].queued.push_back(request);
        self.totals.lock().queued();
    }

    pub fn queued_len(&self, class: RequestClass) -> usize {
        self.classes[class.index()].queued.len()
    }

    pub fn total_queued(&self) -> usize {
        self.classes.iter().map(|ct| ct.queued.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(|ct| ct.queued.is_empty())
    }

    pub fn queued(&self, class: RequestClass) -> impl Iterator<Item = &R> {
        self.classes[class.index()].queued.iter()
    }

    /// Requests of `class` that are queued, admitted or about to be added.
    pub fn pipelined_requests(&self, class: RequestClass) -> usize {
        self.classes[class.index()].pipelined()
    }

    pub fn max_pipelined(&self, class: RequestClass) -> usize {
        self.classes[class.index()].max_pipelined
    }

    pub fn added_to_command_queue(&mut self, class: RequestClass) {
        self.classes[class.index()].queued_commands += 1;
    }

    pub fn removed_from_command_queue(&mut self, class: RequestClass) {
        let ct = &mut self.classes[class.index()];
        debug_assert!(ct.queued_commands > 0);
        ct.queued_commands = ct.queued_commands.saturating_sub(1);
    }

    /// Whether a producer of `class` requests should create another one now.
    /// A positive answer reserves an approval that must later be settled with
    /// [`settle_approval`](Self::settle_approval).
    pub fn wants_more_requests(&mut self, class: RequestClass, too_much_bandwidth: bool) -> bool {
        if too_much_bandwidth {
            return false;
        }
        let ct = &mut self.classes[class.index()];
        if ct.approved + ct.pipelined() >= ct.max_pipelined {
            return false;
        }
        ct.approved += 1;
        true
    }

    pub fn approved_requests(&self, class: RequestClass) -> usize {
        self.classes[class.index()].approved
    }

    pub fn settle_approval(&mut self, class: RequestClass) {
        let ct = &mut self.classes[class.index()];
        debug_assert!(ct.approved > 0, "approval settled twice");
        ct.approved = ct.approved.saturating_sub(1);
    }

    pub fn class_flags(&self, class: RequestClass) -> QueueFlags {
        self.classes[class.index()].flags
    }

    pub fn take_class_flags(&mut self, class: RequestClass) -> QueueFlags {
        self.classes[class.index()].flags.take()
    }

    /// Move the limit by `increment`, clamped to `[1, configured]`. Returns
    /// the change that was actually applied.
    pub(crate) fn adjust_limit(&mut self, increment: isize) -> isize {
        let old = self.limit as isize;
        let new = (old + increment).clamp(1, self.configured_limit as isize);
        self.limit = new as usize;
        let applied = new - old;
        for ct in &mut self.classes {
            ct.max_pipelined = (ct.max_pipelined as isize + applied).max(0) as usize;
        }
        applied
    }

    /// Drop every queued request. Returns how many were removed.
    pub fn purge(&mut self) -> usize {
        let removed: usize = self
            .classes
            .iter_mut()
            .map(|ct| {
                let n = ct.queued.len();
                ct.queued.clear();
                n
            })
            .sum();
        if removed > 0 {
            self.totals.lock().removed(removed);
        }
        removed
    }

    // Approved classes: deeper queue first, alternate on a tie. Best-effort
    // classes rotate every call.
    fn class_order(&mut self) -> [usize; RequestClass::COUNT] {
        let mut order = [0; RequestClass::COUNT];
        let s0 = self.classes[0].queued.len();
        let s1 = self.classes[1].queued.len();
        if s0 == s1 {
            order[0] = self.approved_first;
            if self.fairness.alternate_on_tie {
                self.approved_first = 1 - self.approved_first;
            }
            order[1] = 1 - order[0];
        } else if s0 > s1 {
            order[0] = 0;
            order[1] = 1;
        } else {
            order[0] = 1;
            order[1] = 0;
        }
        let best_effort = RequestClass::COUNT - RequestClass::APPROVED;
        let mut n = self.best_effort_first;
        for slot in order.iter_mut().skip(RequestClass::APPROVED) {
            *slot = RequestClass::APPROVED + n;
            n = (n + 1) % best_effort;
        }
        if self.fairness.rotate_best_effort {
            self.best_effort_first = (self.best_effort_first + 1) % best_effort;
        }
        order
    }

    /// Promote at most one queued request to `transport`.
    ///
    /// Nothing is popped unless both this destination and the transport have
    /// room; on [`Dequeue::Throttled`] or [`Dequeue::Empty`] the caller should
    /// try sibling destinations.
    pub fn dequeue_one_for<A>(&mut self, transport: &A) -> Dequeue
    where
        A: Admission<R> + ?Sized,
    {
        let order = self.class_order();
        for (i, &idx) in order.iter().enumerate() {
            if !self.classes[idx].queued.is_empty() {
                if self.throttled() || !transport.has_capacity() {
                    return Dequeue::Throttled;
                }
                let Some(request) = self.classes[idx].queued.pop_front() else {
                    continue;
                };
                let ct = &mut self.classes[idx];
                if ct.queued.is_empty() {
                    ct.flags.empty = true;
                } else {
                    ct.flags.full = true;
                }
                {
                    let mut totals = self.totals.lock();
                    totals.removed(1);
                    if totals.count == 0 {
                        totals.flags.empty = true;
                    } else {
                        totals.flags.full = true;
                    }
                }
                let class = RequestClass::ALL[idx];
                self.mark_admitted(class);
                transport.admit(&self.key, class, request);
                return Dequeue::Admitted;
            }
            self.classes[idx].flags.starvation = true;
            if i == RequestClass::COUNT - 1 {
                let mut totals = self.totals.lock();
                if totals.count == 0 {
                    totals.flags.starvation = true;
                    return Dequeue::Starved;
                }
            }
        }
        Dequeue::Empty
    }
}

impl<R> DestinationQueue<R> {
    /// Remove the queued request matching `request` from the `class` queue,
    /// keeping the order of the rest. Returns false, without side effects, if
    /// nothing matched.
    pub fn cancel<Q>(&mut self, request: &Q, class: RequestClass) -> bool
    where
        Q: ?Sized,
        R: PartialEq<Q>,
    {
        let queue = &mut self.classes[class.index()].queued;
        let Some(pos) = queue.iter().position(|r| *r == *request) else {
            return false;
        };
        queue.remove(pos);
        self.totals.lock().removed(1);
        true
    }
}

impl<R> Drop for DestinationQueue<R> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.is_empty(),
                "destination {} dropped with queued requests",
                self.key
            );
        }
    }
}
