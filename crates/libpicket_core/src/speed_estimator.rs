use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;

#[derive(Clone, Copy)]
struct ProgressSnapshot {
    progress_bytes: u64,
    instant: Instant,
}

/// Estimates a transfer rate over a sliding window of snapshots.
///
/// Fed with a monotonically increasing byte counter (one snapshot per
/// scheduler tick); the published rate is readable without locking.
pub struct SpeedEstimator {
    latest_snapshots: Mutex<VecDeque<ProgressSnapshot>>,
    bytes_per_second: AtomicU64,
}

impl SpeedEstimator {
    pub fn new(window_snapshots: usize) -> Self {
        assert!(window_snapshots > 1);
        Self {
            latest_snapshots: Mutex::new(VecDeque::with_capacity(window_snapshots)),
            bytes_per_second: Default::default(),
        }
    }

    pub fn bps(&self) -> u64 {
        self.bytes_per_second.load(Ordering::Relaxed)
    }

    pub fn add_snapshot(&self, progress_bytes: u64, instant: Instant) {
        let first = {
            let mut g = self.latest_snapshots.lock();

            let current = ProgressSnapshot {
                progress_bytes,
                instant,
            };

            if g.is_empty() {
                g.push_back(current);
                return;
            } else if g.len() < g.capacity() {
                g.push_back(current);
                g.front().copied().unwrap()
            } else {
                let first = g.pop_front().unwrap();
                g.push_back(current);
                first
            }
        };

        let elapsed = instant - first.instant;
        if elapsed.is_zero() {
            return;
        }
        let diff = progress_bytes.saturating_sub(first.progress_bytes);
        let bps = diff as f64 / elapsed.as_secs_f64();
        self.bytes_per_second.store(bps as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_over_window() {
        let e = SpeedEstimator::new(5);
        let start = Instant::now();
        e.add_snapshot(0, start);
        assert_eq!(e.bps(), 0);

        e.add_snapshot(10_000, start + Duration::from_secs(1));
        assert_eq!(e.bps(), 10_000);

        e.add_snapshot(30_000, start + Duration::from_secs(2));
        assert_eq!(e.bps(), 15_000);
    }

    #[test]
    fn test_window_slides() {
        let e = SpeedEstimator::new(2);
        let start = Instant::now();
        e.add_snapshot(0, start);
        e.add_snapshot(100, start + Duration::from_secs(1));
        // rate is always computed against the oldest retained snapshot
        e.add_snapshot(300, start + Duration::from_secs(2));
        assert_eq!(e.bps(), 150);
    }
}
