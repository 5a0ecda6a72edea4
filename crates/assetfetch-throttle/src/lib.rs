//! Per-destination admission control for outbound asset requests.
//!
//! Every remote endpoint gets a [`DestinationQueue`] keyed by its canonical
//! `host[:port]`. Requests beyond the destination's concurrency limit wait in
//! per-class FIFOs and are promoted by [`DestinationRegistry::add_queued_to`]
//! whenever a slot frees up.

mod class;
mod key;
mod queue;
mod registry;
mod sync;

pub use class::{FairnessPolicy, RequestClass};
pub use key::{canonical_destination, DestinationKey};
pub use queue::{Admission, Dequeue, DestinationQueue, QueueFlags, QueueTotals, SharedTotals};
pub use registry::{
    Approval, Destination, DestinationHandle, DestinationRegistry, DestinationSnapshot,
    RegistryConfig,
};
