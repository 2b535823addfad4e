use std::time::{Duration, Instant};

use chunkline_protocol::{TransferProgress, TransferStatistics};

/// Default window for speed calculation.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Default number of retained samples.
const DEFAULT_MAX_SAMPLES: usize = 100;

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: Vec::new(),
            max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES),
            window_size: window_size.unwrap_or(DEFAULT_WINDOW),
        }
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&mut self, bytes: u64, now: Instant) {
        self.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });
        self.prune(now);

        if self.samples.len() > self.max_samples {
            let excess = self.samples.len() - self.max_samples;
            self.samples.drain(..excess);
        }
    }

    /// Drops samples that have aged out of the window.
    pub fn prune(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.window_size) {
            self.samples.retain(|sample| sample.timestamp >= cutoff);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }

        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: u64 = self.samples.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    /// Clears all recorded samples.
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Percent complete, clamped to 0-100.
///
/// Encrypted chunks carry a few bytes of overhead each, so the wire byte count
/// can exceed the declared plaintext size.
pub fn percent(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        return if transferred > 0 { 100.0 } else { 0.0 };
    }
    (transferred as f64 / total as f64 * 100.0).min(100.0)
}

/// Running process-wide counters.
///
/// Counters only ever grow; the live fields (`active_transfers`,
/// `queued_transfers`, `average_speed`) are recomputed by [`refresh`](Self::refresh).
#[derive(Debug, Default)]
pub struct StatisticsTracker {
    stats: TransferStatistics,
}

impl StatisticsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_requested(&mut self) {
        self.stats.total_transfers += 1;
    }

    pub fn record_completed(&mut self, bytes: u64) {
        self.stats.completed_transfers += 1;
        self.stats.total_bytes_transferred += bytes;
    }

    pub fn record_failed(&mut self) {
        self.stats.failed_transfers += 1;
    }

    pub fn record_cancelled(&mut self) {
        self.stats.cancelled_transfers += 1;
    }

    /// Recomputes the live fields from the current active set.
    ///
    /// Average speed is the mean instantaneous speed over every active record.
    pub fn refresh<'a>(
        &mut self,
        active: impl IntoIterator<Item = &'a TransferProgress>,
        queued: usize,
    ) {
        let mut count = 0usize;
        let mut speed_sum = 0.0;
        for progress in active {
            count += 1;
            speed_sum += progress.speed;
        }
        self.stats.active_transfers = count;
        self.stats.queued_transfers = queued;
        self.stats.average_speed = if count == 0 {
            0.0
        } else {
            speed_sum / count as f64
        };
    }

    pub fn snapshot(&self) -> TransferStatistics {
        self.stats.clone()
    }
}
