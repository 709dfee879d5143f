use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

const MIB: f64 = 1024.0 * 1024.0;

/// Snapshot emitted after every finished segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub completed: usize,
    pub total: usize,
    pub bytes: u64,
    /// Average rate since the pool started, in MiB/s.
    pub throughput_mbps: f64,
}

/// Counters shared by every download task of one pool.
#[derive(Debug)]
pub struct ThroughputMeter {
    started: Instant,
    total: usize,
    completed: AtomicUsize,
    bytes: AtomicU64,
}

impl ThroughputMeter {
    pub fn new(total: usize) -> Self {
        Self {
            started: Instant::now(),
            total,
            completed: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Record a finished segment and return the resulting snapshot.
    pub fn record(&self, bytes: u64) -> DownloadProgress {
        let completed = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        let bytes = self.bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        DownloadProgress {
            completed,
            total: self.total,
            bytes,
            throughput_mbps: throughput_mbps(bytes, self.started.elapsed()),
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Bytes over elapsed time, in MiB/s. Zero when no time has passed.
pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        bytes as f64 / MIB / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn throughput_is_mib_per_second() {
        let rate = throughput_mbps(4 * 1024 * 1024, Duration::from_secs(2));
        assert!((rate - 2.0).abs() < 1e-9);
        assert_eq!(throughput_mbps(1024, Duration::ZERO), 0.0);
    }

    #[test]
    fn concurrent_records_are_all_counted() {
        let meter = Arc::new(ThroughputMeter::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let meter = Arc::clone(&meter);
                std::thread::spawn(move || {
                    for _ in 0..8 {
                        meter.record(10);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(meter.completed(), 64);
        assert_eq!(meter.bytes(), 640);
    }
}
