use std::collections::HashMap;
use std::time::Duration;

use assetfetch_throttle::DestinationKey;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct Entry {
    until: Instant,
    status: u16,
    errors: u32,
}

/// Origins that recently failed without answering. An origin is skipped only
/// after it failed more than `max_errors` times while still listed.
#[derive(Debug)]
pub(crate) struct FailList {
    entries: HashMap<DestinationKey, Entry>,
    max_errors: u32,
}

impl FailList {
    pub(crate) fn new(max_errors: u32) -> Self {
        Self {
            entries: HashMap::new(),
            max_errors,
        }
    }

    pub(crate) fn add(&mut self, origin: DestinationKey, ttl: Duration, status: u16) {
        if origin.is_empty() {
            return;
        }
        let now = Instant::now();
        self.expire(now);
        let errors = self.entries.get(&origin).map_or(0, |e| e.errors + 1);
        if errors > self.max_errors {
            warn!(
                target: "assetfetch::fetch",
                origin = %origin,
                status,
                ttl_secs = ttl.as_secs(),
                "origin fail-listed"
            );
        }
        self.entries.insert(
            origin,
            Entry {
                until: now + ttl,
                status,
                errors,
            },
        );
    }

    /// Last status recorded for `origin` when it should be skipped.
    pub(crate) fn listed(&mut self, origin: &DestinationKey) -> Option<u16> {
        self.expire(Instant::now());
        self.entries
            .get(origin)
            .filter(|e| e.errors > self.max_errors)
            .map(|e| e.status)
    }

    fn expire(&mut self, now: Instant) {
        self.entries.retain(|_, e| e.until > now);
    }
}
