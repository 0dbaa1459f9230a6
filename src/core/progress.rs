//! Per-transfer progress tracking
//!
//! One tracker instance is owned by each download attempt and shared with
//! its fetch workers. Per-chunk byte counts are folded into one aggregate
//! counter incrementally; chunk counters are high-water marks, so a chunk
//! that restarts from zero after a retry never pushes the aggregate
//! backwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Aggregate progress snapshot for one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub downloaded: u64,
    pub total: u64,
    /// Bytes per second over the last sampling interval
    pub speed_bps: f64,
    /// Remaining seconds at the current speed; `None` while speed is zero
    pub eta_secs: Option<u64>,
}

struct SpeedSample {
    chunks: HashMap<usize, u64>,
    last_bytes: u64,
    last_time: Instant,
    speed_bps: f64,
}

/// Thread-safe progress aggregator for a single download attempt
pub struct ProgressTracker {
    filename: String,
    total: u64,
    downloaded: AtomicU64,
    started: Instant,
    inner: Mutex<SpeedSample>,
}

impl ProgressTracker {
    pub fn new(filename: &str, total: u64) -> Self {
        let now = Instant::now();
        Self {
            filename: filename.to_string(),
            total,
            downloaded: AtomicU64::new(0),
            started: now,
            inner: Mutex::new(SpeedSample {
                chunks: HashMap::new(),
                last_bytes: 0,
                last_time: now,
                speed_bps: 0.0,
            }),
        }
    }

    /// Seed the aggregate with bytes already on disk from a resumed transfer
    pub fn seed(&self, bytes: u64) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        self.downloaded.store(bytes, Ordering::Relaxed);
        inner.last_bytes = bytes;
    }

    /// Record the cumulative byte count of one chunk and return the new
    /// aggregate. Counts only move forward; a lower value is a no-op.
    pub fn record_chunk(&self, index: usize, bytes: u64) -> u64 {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");

        let entry = inner.chunks.entry(index).or_insert(0);
        if bytes <= *entry {
            return self.downloaded.load(Ordering::Relaxed);
        }
        let delta = bytes - *entry;
        *entry = bytes;

        let aggregate = self.downloaded.fetch_add(delta, Ordering::Relaxed) + delta;

        let now = Instant::now();
        let dt = now.duration_since(inner.last_time).as_secs_f64();
        if dt > 0.0 {
            inner.speed_bps = (aggregate - inner.last_bytes) as f64 / dt;
            inner.last_bytes = aggregate;
            inner.last_time = now;
        }

        aggregate
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn snapshot(&self) -> TransferProgress {
        let downloaded = self.downloaded.load(Ordering::Relaxed);
        let speed_bps = {
            let inner = self.inner.lock().expect("tracker lock poisoned");
            inner.speed_bps
        };

        let eta_secs = if speed_bps > 0.0 && self.total > downloaded {
            Some(((self.total - downloaded) as f64 / speed_bps) as u64)
        } else {
            None
        };

        TransferProgress {
            downloaded,
            total: self.total,
            speed_bps,
            eta_secs,
        }
    }

    /// Average speed since the tracker was created, in bytes per second
    pub fn average_speed(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.downloaded.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn complete(&self) {
        self.downloaded.store(self.total, Ordering::Relaxed);
        log::info!(
            "Completed: {} ({} bytes in {:.1}s)",
            self.filename,
            self.total,
            self.started.elapsed().as_secs_f64()
        );
    }

    pub fn fail(&self, error: &str) {
        log::error!("Failed: {} - {}", self.filename, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_from_chunks() {
        let tracker = ProgressTracker::new("file.bin", 100);
        tracker.record_chunk(0, 10);
        tracker.record_chunk(1, 20);
        assert_eq!(tracker.downloaded(), 30);
        tracker.record_chunk(0, 25);
        assert_eq!(tracker.downloaded(), 45);
    }

    #[test]
    fn test_chunk_counters_never_regress() {
        let tracker = ProgressTracker::new("file.bin", 100);
        tracker.record_chunk(0, 40);
        // A retried chunk re-reports from zero; the aggregate must not drop
        tracker.record_chunk(0, 0);
        assert_eq!(tracker.downloaded(), 40);
        tracker.record_chunk(0, 10);
        assert_eq!(tracker.downloaded(), 40);
        // Completion lands on the exact chunk size
        tracker.record_chunk(0, 50);
        assert_eq!(tracker.downloaded(), 50);
    }

    #[test]
    fn test_monotonic_aggregate_out_of_order() {
        let tracker = ProgressTracker::new("file.bin", 103);
        let mut last = 0;
        for (index, bytes) in [(4usize, 3u64), (1, 25), (3, 25), (0, 25), (2, 25)] {
            let aggregate = tracker.record_chunk(index, bytes);
            assert!(aggregate >= last);
            last = aggregate;
        }
        assert_eq!(tracker.downloaded(), 103);
    }

    #[test]
    fn test_eta_undefined_at_zero_speed() {
        let tracker = ProgressTracker::new("file.bin", 100);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.speed_bps, 0.0);
        assert_eq!(snapshot.eta_secs, None);
    }

    #[test]
    fn test_eta_present_when_moving() {
        let tracker = ProgressTracker::new("file.bin", 1_000_000);
        std::thread::sleep(std::time::Duration::from_millis(10));
        tracker.record_chunk(0, 500_000);
        let snapshot = tracker.snapshot();
        assert!(snapshot.speed_bps > 0.0);
        assert!(snapshot.eta_secs.is_some());
    }

    #[test]
    fn test_seed_counts_toward_aggregate() {
        let tracker = ProgressTracker::new("file.bin", 100);
        tracker.seed(50);
        assert_eq!(tracker.downloaded(), 50);
        tracker.record_chunk(2, 25);
        assert_eq!(tracker.downloaded(), 75);
    }
}
