use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::types::AssetId;

pub const PRIORITY_HIGH: u32 = 0x3000_0000;
pub const PRIORITY_NORMAL: u32 = 0x2000_0000;
pub const PRIORITY_LOW: u32 = 0x1000_0000;
pub const PRIORITY_LOWBITS: u32 = 0x0FFF_FFFF;
pub const PRIORITY_HIGHBITS: u32 = 0x7000_0000;

/// Map a caller priority in `[0, max_priority]` onto the low scheduling bits.
pub fn scale_priority(priority: f32, max_priority: f32) -> u32 {
    if priority.is_nan() || priority <= 0.0 || max_priority.is_nan() || max_priority <= 0.0 {
        return 0;
    }
    let scaled = f64::from(priority) * f64::from(PRIORITY_LOWBITS) / f64::from(max_priority);
    scaled.min(f64::from(PRIORITY_LOWBITS)) as u32
}

/// Workers ready to run, highest priority first, FIFO within a priority.
#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    // Reverse so the first key is the highest priority.
    buckets: BTreeMap<Reverse<u32>, VecDeque<AssetId>>,
    index: HashMap<AssetId, u32>,
}

impl WorkQueue {
    /// Queue `id`, or move it if it is already queued at another priority.
    pub(crate) fn schedule(&mut self, id: AssetId, priority: u32) {
        match self.index.get(&id) {
            Some(&current) if current == priority => return,
            Some(&current) => self.unlink(id, current),
            None => {}
        }
        self.buckets
            .entry(Reverse(priority))
            .or_default()
            .push_back(id);
        self.index.insert(id, priority);
    }

    pub(crate) fn pop(&mut self) -> Option<AssetId> {
        let mut entry = self.buckets.first_entry()?;
        let id = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        if let Some(id) = id {
            self.index.remove(&id);
        }
        id
    }

    pub(crate) fn remove(&mut self, id: AssetId) -> bool {
        match self.index.get(&id).copied() {
            Some(priority) => {
                self.unlink(id, priority);
                true
            }
            None => false,
        }
    }

    /// Move a queued `id` to new low bits, keeping its class bits.
    pub(crate) fn reprioritize(&mut self, id: AssetId, low: u32) -> bool {
        let Some(&current) = self.index.get(&id) else {
            return false;
        };
        self.schedule(id, (current & PRIORITY_HIGHBITS) | (low & PRIORITY_LOWBITS));
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    fn unlink(&mut self, id: AssetId, priority: u32) {
        if let Some(bucket) = self.buckets.get_mut(&Reverse(priority)) {
            bucket.retain(|queued| *queued != id);
            if bucket.is_empty() {
                self.buckets.remove(&Reverse(priority));
            }
        }
        self.index.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_is_clamped() {
        assert_eq!(scale_priority(0.0, 100.0), 0);
        assert_eq!(scale_priority(-3.0, 100.0), 0);
        assert_eq!(scale_priority(f32::NAN, 100.0), 0);
        assert_eq!(scale_priority(100.0, 100.0), PRIORITY_LOWBITS);
        assert_eq!(scale_priority(1e9, 100.0), PRIORITY_LOWBITS);
        assert!(scale_priority(50.0, 100.0) < scale_priority(51.0, 100.0));
    }

    #[test]
    fn pops_by_priority_then_fifo() {
        let (a, b, c) = (AssetId::random(), AssetId::random(), AssetId::random());
        let mut q = WorkQueue::default();
        q.schedule(a, PRIORITY_LOW | 5);
        q.schedule(b, PRIORITY_HIGH | 1);
        q.schedule(c, PRIORITY_LOW | 5);
        assert_eq!(q.pop(), Some(b));
        assert_eq!(q.pop(), Some(a));
        assert_eq!(q.pop(), Some(c));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn reschedule_moves_entry() {
        let (a, b) = (AssetId::random(), AssetId::random());
        let mut q = WorkQueue::default();
        q.schedule(a, PRIORITY_LOW);
        q.schedule(b, PRIORITY_NORMAL);
        q.schedule(a, PRIORITY_HIGH);
        assert_eq!(q.len(), 2);
        assert!(q.remove(b));
        assert!(!q.remove(b));
        assert!(q.reprioritize(a, 7));
        assert!(!q.reprioritize(b, 7));
        assert_eq!(q.pop(), Some(a));
        assert_eq!(q.len(), 0);
    }
}
