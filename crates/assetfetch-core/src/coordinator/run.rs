use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::Inner;
use crate::schedule::PRIORITY_LOW;
use crate::types::AssetId;

// Workers processed between cooperative yields.
const BATCH: usize = 32;

/// The processing task: runs ready workers, and every tick re-polls
/// suspended ones, flushes packet requests and reaps cancelled workers.
pub(super) async fn run(inner: Arc<Inner>) {
    let tick = inner.config.tick();
    let mut next_tick = Instant::now() + tick;
    debug!(target: "assetfetch::fetch", tick_ms = tick.as_millis() as u64, "processing loop started");
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        let mut processed = 0usize;
        loop {
            let next = inner.ready.lock().pop();
            let Some(id) = next else {
                break;
            };
            inner.process(id);
            processed += 1;
            if processed % BATCH == 0 {
                tokio::task::yield_now().await;
            }
            if Instant::now() >= next_tick {
                break;
            }
        }
        if Instant::now() >= next_tick {
            inner.housekeeping();
            next_tick = Instant::now() + tick;
        }
        if inner.ready.lock().len() > 0 {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                debug!(target: "assetfetch::fetch", "processing loop cancelled");
                break;
            }
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep_until(next_tick) => {}
        }
    }
}

impl Inner {
    fn housekeeping(&self) {
        let now = Instant::now();
        let polled: Vec<AssetId> = self.polling.lock().drain().collect();
        for id in polled {
            let Some(worker) = self.worker(id) else {
                continue;
            };
            let priority = {
                let w = worker.lock();
                (w.has_work && !w.work_done && !w.aborted).then_some(PRIORITY_LOW | w.work_priority)
            };
            if let Some(priority) = priority {
                self.ready.lock().schedule(id, priority);
            }
        }
        self.flush_network_requests(now);
        self.reap_doomed();
        self.bandwidth.lock().sample(now);
        self.publish_gauges();
    }

    /// Delete cancelled workers whose cache write (if any) has finished;
    /// outstanding reads and decodes are aborted. Returns how many remain.
    pub(super) fn reap_doomed(&self) -> usize {
        let mut doomed = self.doomed.lock();
        doomed.retain(|(id, worker)| {
            let mut w = worker.lock();
            if let Some(read) = w.pending.read.take() {
                read.abort();
            }
            if let Some(decode) = w.pending.decode.take() {
                decode.abort();
            }
            let writing = w
                .pending
                .write
                .as_ref()
                .is_some_and(|write| !write.is_finished());
            if !writing {
                trace!(target: "assetfetch::fetch", asset = %id, "worker deleted");
            }
            writing
        });
        doomed.len()
    }
}
