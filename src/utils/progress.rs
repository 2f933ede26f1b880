//! Progress tracking utilities
//!
//! [`ProgressTracker`] logs throughput at fixed byte intervals and a summary
//! at the end. [`ProgressThrottle`] rate-limits progress events sent to
//! observers.

use std::time::{Duration, Instant};

use super::{bytes_to_mb, format_rate, MB};
use crate::{log_debug, log_info};

/// Progress tracker for operations with speed calculation
pub struct ProgressTracker {
    /// Operation name for logging (e.g., "Download", "Write", "Verify")
    operation_name: &'static str,
    module_name: &'static str,
    /// Total bytes to process, 0 if unknown
    total_bytes: u64,
    processed_bytes: u64,
    start_time: Instant,
    last_log_time: Instant,
    last_log_bytes: u64,
    log_interval_bytes: u64,
}

impl ProgressTracker {
    pub fn new(operation: &'static str, module: &'static str, total_bytes: u64, log_interval_mb: u64) -> Self {
        let now = Instant::now();
        Self {
            operation_name: operation,
            module_name: module,
            total_bytes,
            processed_bytes: 0,
            start_time: now,
            last_log_time: now,
            last_log_bytes: 0,
            log_interval_bytes: log_interval_mb * MB,
        }
    }

    /// Start counting from `offset` (resumed transfers)
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.processed_bytes = offset;
        self.last_log_bytes = offset;
        self
    }

    pub fn processed(&self) -> u64 {
        self.processed_bytes
    }

    /// Record `bytes_added` and log when an interval boundary is crossed
    pub fn update(&mut self, bytes_added: u64) {
        self.processed_bytes += bytes_added;

        if self.log_interval_bytes == 0 {
            return;
        }

        let current_interval = self.processed_bytes / self.log_interval_bytes;
        let last_interval = self.last_log_bytes / self.log_interval_bytes;
        if current_interval <= last_interval {
            return;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_log_time).as_secs_f64();
        let speed_mbps = if elapsed > 0.0 {
            bytes_to_mb(self.processed_bytes - self.last_log_bytes) / elapsed
        } else {
            0.0
        };
        self.last_log_time = now;
        self.last_log_bytes = self.processed_bytes;

        if self.total_bytes > 0 {
            log_debug!(
                self.module_name,
                "{} progress: {:.1} MB / {:.1} MB ({:.1}%) @ {:.1} MB/s",
                self.operation_name,
                bytes_to_mb(self.processed_bytes),
                bytes_to_mb(self.total_bytes),
                (self.processed_bytes as f64 / self.total_bytes as f64) * 100.0,
                speed_mbps
            );
        } else {
            log_debug!(
                self.module_name,
                "{} progress: {:.1} MB @ {:.1} MB/s",
                self.operation_name,
                bytes_to_mb(self.processed_bytes),
                speed_mbps
            );
        }
    }

    /// Log completion with the average speed
    pub fn finish(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        log_info!(
            self.module_name,
            "{} complete: {:.1} MB in {:.1}s (avg {})",
            self.operation_name,
            bytes_to_mb(self.processed_bytes),
            elapsed,
            format_rate(self.processed_bytes, elapsed)
        );
    }
}

/// Rate-limiter for progress events
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// Whether enough time has passed to emit another event
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::config::progress::EVENT_INTERVAL_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts_from_offset() {
        let mut tracker = ProgressTracker::new("Download", "test", 10 * MB, 1).with_offset(MB);
        tracker.update(3 * MB);
        assert_eq!(tracker.processed(), 4 * MB);
        tracker.finish();
    }

    #[test]
    fn test_throttle_respects_interval() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(50));
        assert!(throttle.should_emit());
        assert!(!throttle.should_emit());

        std::thread::sleep(Duration::from_millis(60));
        assert!(throttle.should_emit());
    }
}
