use std::time::Duration;

use tokio::time::Instant;

const MIN_SAMPLE: Duration = Duration::from_millis(250);
const ALPHA: f64 = 0.2;

/// Smoothed download rate fed by HTTP bodies and packet payloads.
#[derive(Debug)]
pub(crate) struct BandwidthMeter {
    pending_bits: u64,
    total_bits: u64,
    since: Instant,
    kbps: f64,
}

impl BandwidthMeter {
    pub(crate) fn new() -> Self {
        Self {
            pending_bits: 0,
            total_bits: 0,
            since: Instant::now(),
            kbps: 0.0,
        }
    }

    pub(crate) fn add_bytes(&mut self, bytes: usize) {
        let bits = bytes as u64 * 8;
        self.pending_bits += bits;
        self.total_bits += bits;
    }

    /// Fold the bits seen since the last sample into the average.
    pub(crate) fn sample(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.since);
        if elapsed < MIN_SAMPLE {
            return self.kbps;
        }
        let rate = self.pending_bits as f64 / elapsed.as_secs_f64() / 1000.0;
        self.kbps = if self.kbps == 0.0 {
            rate
        } else {
            (1.0 - ALPHA) * self.kbps + ALPHA * rate
        };
        self.pending_bits = 0;
        self.since = now;
        metrics::gauge!("assetfetch_bandwidth_kbps").set(self.kbps);
        self.kbps
    }

    pub(crate) fn kbps(&self) -> f64 {
        self.kbps
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bits / 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn averages_samples() {
        let mut meter = BandwidthMeter::new();
        meter.add_bytes(125_000);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((meter.sample(Instant::now()) - 1000.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!((meter.sample(Instant::now()) - 1000.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_millis(900)).await;
        let kbps = meter.sample(Instant::now());
        assert!((kbps - 800.0).abs() < 1e-6);
        assert_eq!(meter.total_bytes(), 125_000);
    }
}
