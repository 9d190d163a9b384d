//! Receive throughput estimation

use std::collections::VecDeque;
use std::time::Instant;

/// Samples taken between two estimates
const ESTIMATE_EVERY: usize = 3;

/// Samples needed before the first estimate
const MIN_SAMPLES: usize = 10;

/// Window size at which the oldest samples are dropped
const MAX_SAMPLES: usize = 30;

/// Speed and remaining time derived from the sample window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Kilobytes (1000 bytes) per second
    pub speed_kbps: f64,
    pub seconds_left: u64,
}

impl Estimate {
    /// "2.2 MB/s" or "522 KB/s"
    pub fn speed_string(&self) -> String {
        format_speed(self.speed_kbps)
    }

    /// "1 min 20s" or "35s"
    pub fn time_string(&self) -> String {
        format_time(self.seconds_left)
    }
}

/// Running window of (time, total bytes received) samples
#[derive(Debug, Default)]
pub struct ThroughputLog {
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Record the running total and, every few samples, estimate speed and
    /// the time left until `total_size`
    pub fn record(&mut self, bytes_received_total: u64, total_size: u64) -> Option<Estimate> {
        self.record_at(Instant::now(), bytes_received_total, total_size)
    }

    pub fn record_at(
        &mut self,
        at: Instant,
        bytes_received_total: u64,
        total_size: u64,
    ) -> Option<Estimate> {
        self.samples.push_back((at, bytes_received_total));

        let len = self.samples.len();
        if len % ESTIMATE_EVERY != 0 || len < MIN_SAMPLES {
            return None;
        }

        let estimate = self.estimate(bytes_received_total, total_size);

        if len >= MAX_SAMPLES {
            self.samples.drain(..ESTIMATE_EVERY);
        }

        estimate
    }

    fn estimate(&self, bytes_received_total: u64, total_size: u64) -> Option<Estimate> {
        let (first_at, first_bytes) = *self.samples.front()?;
        let (last_at, last_bytes) = *self.samples.back()?;

        let seconds = last_at.duration_since(first_at).as_secs_f64();
        let kilobytes = last_bytes.saturating_sub(first_bytes) as f64 / 1000.0;
        if seconds <= 0.0 || kilobytes <= 0.0 {
            return None;
        }

        let speed_kbps = kilobytes / seconds;
        let bytes_left = total_size.saturating_sub(bytes_received_total) as f64;
        let seconds_left = (bytes_left / speed_kbps / 1000.0).round() as u64;

        Some(Estimate {
            speed_kbps,
            seconds_left,
        })
    }
}

pub fn format_speed(speed_kbps: f64) -> String {
    if speed_kbps >= 1000.0 {
        let speed_mbps = (speed_kbps / 100.0).round() / 10.0;
        format!("{} MB/s", speed_mbps)
    } else {
        format!("{} KB/s", speed_kbps.round())
    }
}

pub fn format_time(seconds: u64) -> String {
    if seconds >= 60 {
        format!("{} min {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_estimates_every_third_sample_after_ten() {
        let start = Instant::now();
        let mut log = ThroughputLog::new();
        let mut estimates = Vec::new();

        for i in 0..15u64 {
            let at = start + Duration::from_secs(i);
            if log.record_at(at, i * 100_000, 10_000_000).is_some() {
                estimates.push(i + 1);
            }
        }

        assert_eq!(estimates, vec![12, 15]);
    }

    #[test]
    fn test_estimate_values() {
        let start = Instant::now();
        let mut log = ThroughputLog::new();
        let mut last = None;
        for i in 0..12u64 {
            last = log.record_at(start + Duration::from_secs(i), i * 500_000, 9_500_000);
        }

        // 5.5 MB over 11 s
        let estimate = last.unwrap();
        assert!((estimate.speed_kbps - 500.0).abs() < 1e-9);
        assert_eq!(estimate.seconds_left, 8);
        assert_eq!(estimate.speed_string(), "500 KB/s");
        assert_eq!(estimate.time_string(), "8s");
    }

    #[test]
    fn test_window_is_trimmed() {
        let start = Instant::now();
        let mut log = ThroughputLog::new();
        for i in 0..30u64 {
            log.record_at(start + Duration::from_millis(i * 10), i * 1000, 1_000_000);
        }
        assert_eq!(log.len(), 27);
    }

    #[test]
    fn test_no_estimate_without_elapsed_time() {
        let at = Instant::now();
        let mut log = ThroughputLog::new();
        let mut last = None;
        for i in 0..12u64 {
            last = log.record_at(at, i * 1000, 1_000_000);
        }
        assert!(last.is_none());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_speed(2234.0), "2.2 MB/s");
        assert_eq!(format_speed(521.6), "522 KB/s");
        assert_eq!(format_time(80), "1 min 20s");
        assert_eq!(format_time(35), "35s");
    }
}
