//! Per-session network adapter.
//!
//! Pure, synchronous bookkeeping: no sockets, no timers. The batcher
//! (`crate::batch`) drives this with `(bytes, elapsed_ms)` observations and
//! reads back `(delay, batch_size)` pairs before every flush decision.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::NetworkDefaults;

/// Category buckets used by the performance telemetry's session distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RttCategory {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

/// A pending RTT measurement stamped onto an outbound batch.
#[derive(Debug, Clone, Copy)]
struct PendingMeasurement {
    started_at: Instant,
}

/// A point-in-time read of the adapter, returned by [`NetworkMetrics::snapshot`].
#[derive(Debug, Clone)]
pub struct NetworkMetricsSnapshot {
    pub using_fallback: bool,
    pub unstable: bool,
    pub category: RttCategory,
    pub rtt_avg_ms: f64,
    pub rtt_sample_count: usize,
    pub bandwidth_bps: f64,
    pub optimal_delay_ms: u64,
    pub optimal_batch_size: usize,
}

/// Per-session running network telemetry and adapter state.
pub struct NetworkMetrics {
    defaults: NetworkDefaults,

    rtt_samples: VecDeque<f64>,
    rtt_sum: f64,
    rtt_min: f64,
    rtt_max: f64,

    bandwidth_samples: VecDeque<f64>,

    pending_measurements: std::collections::HashMap<u64, PendingMeasurement>,
    next_measurement_id: u64,
    last_measurement_stamped: Option<Instant>,

    consecutive_failed_measurements: u32,
    using_fallback: bool,

    unstable_noted: bool,
}

impl NetworkMetrics {
    pub fn new(defaults: NetworkDefaults) -> Self {
        Self {
            defaults,
            rtt_samples: VecDeque::new(),
            rtt_sum: 0.0,
            rtt_min: f64::INFINITY,
            rtt_max: 0.0,
            bandwidth_samples: VecDeque::new(),
            pending_measurements: std::collections::HashMap::new(),
            next_measurement_id: 1,
            last_measurement_stamped: None,
            consecutive_failed_measurements: 0,
            using_fallback: false,
            unstable_noted: false,
        }
    }

    /// Whether this tick should stamp a new measurement id onto the outbound
    /// batch.
    pub fn should_stamp_measurement(&self, now: Instant) -> bool {
        match self.last_measurement_stamped {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.defaults.rtt_measurement_interval,
        }
    }

    /// Stamp a new measurement id, recording its start time, and return it.
    pub fn stamp_measurement(&mut self, now: Instant) -> u64 {
        let id = self.next_measurement_id;
        self.next_measurement_id += 1;
        self.pending_measurements.insert(id, PendingMeasurement { started_at: now });
        self.last_measurement_stamped = Some(now);
        id
    }

    /// Expire pending measurements older than `MEASUREMENT_TIMEOUT`, each
    /// counting as one failure. Returns how many were expired, so the caller
    /// can record one telemetry timeout event per expiry.
    pub fn expire_stale_measurements(&mut self, now: Instant) -> usize {
        let timeout = self.defaults.measurement_timeout;
        let expired: Vec<u64> = self
            .pending_measurements
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.started_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        let count = expired.len();
        for id in expired {
            self.pending_measurements.remove(&id);
            self.record_failure();
        }
        count
    }

    fn record_failure(&mut self) {
        self.consecutive_failed_measurements += 1;
        if self.consecutive_failed_measurements >= self.defaults.fail_threshold {
            self.using_fallback = true;
        }
    }

    /// Record a client RTT report for a (possibly already-expired)
    /// measurement id. Returns `true` if it was accepted as an RTT sample.
    pub fn report_rtt(&mut self, measurement_id: u64, rtt_ms: f64) -> bool {
        if self.pending_measurements.remove(&measurement_id).is_none() {
            // Already expired and counted as a failure; an unmatched reply
            // arriving late is simply dropped, not double-counted.
            return false;
        }
        self.ingest_rtt_sample(rtt_ms)
    }

    /// Ingest an RTT sample directly (used by tests and by `report_rtt`).
    pub fn ingest_rtt_sample(&mut self, rtt_ms: f64) -> bool {
        if self.rtt_samples.len() >= 5 {
            let lower = self.rtt_min / self.defaults.rtt_outlier_factor;
            let upper = self.rtt_max * self.defaults.rtt_outlier_factor;
            if rtt_ms < lower || rtt_ms > upper {
                return false;
            }
        }

        if self.rtt_samples.len() >= self.defaults.rtt_samples_max {
            if let Some(oldest) = self.rtt_samples.pop_front() {
                self.rtt_sum -= oldest;
            }
        }
        self.rtt_samples.push_back(rtt_ms);
        self.rtt_sum += rtt_ms;
        self.rtt_min = self.rtt_min.min(rtt_ms);
        self.rtt_max = self.rtt_max.max(rtt_ms);

        self.consecutive_failed_measurements = 0;

        let stddev = self.rtt_stddev();
        let avg = self.rtt_avg();
        self.unstable_noted = avg > 0.0 && stddev / avg > self.defaults.unstable_threshold;

        true
    }

    fn rtt_avg(&self) -> f64 {
        if self.rtt_samples.is_empty() {
            0.0
        } else {
            self.rtt_sum / self.rtt_samples.len() as f64
        }
    }

    fn rtt_stddev(&self) -> f64 {
        if self.rtt_samples.len() < 2 {
            return 0.0;
        }
        let avg = self.rtt_avg();
        let variance = self
            .rtt_samples
            .iter()
            .map(|v| (v - avg).powi(2))
            .sum::<f64>()
            / self.rtt_samples.len() as f64;
        variance.sqrt()
    }

    /// Record one flush's `(bytes, elapsed_ms)` observation.
    pub fn record_bandwidth(&mut self, bytes: usize, elapsed_ms: f64) {
        if elapsed_ms <= 0.0 {
            return;
        }
        let bps = bytes as f64 * 1000.0 / elapsed_ms;
        if self.bandwidth_samples.len() >= self.defaults.bandwidth_samples_max {
            self.bandwidth_samples.pop_front();
        }
        self.bandwidth_samples.push_back(bps);
    }

    fn bandwidth_estimate(&self) -> f64 {
        if self.bandwidth_samples.is_empty() {
            return 0.0;
        }
        if self.bandwidth_samples.len() >= 3 {
            let mut sorted: Vec<f64> = self.bandwidth_samples.iter().copied().collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let trim = (sorted.len() as f64 * 0.2).floor() as usize;
            let slice = &sorted[trim..sorted.len() - trim];
            slice.iter().sum::<f64>() / slice.len() as f64
        } else {
            self.bandwidth_samples.iter().sum::<f64>() / self.bandwidth_samples.len() as f64
        }
    }

    /// Explicitly reset to fallback mode (`POST /terminal/reset-network/:id`).
    pub fn reset_to_fallback(&mut self) {
        self.using_fallback = true;
        self.consecutive_failed_measurements = self.defaults.fail_threshold;
    }

    /// The fixed hard cap a batcher compares `now - last_flush` against,
    /// independent of the adaptive delay `optimal_delay()` returns.
    pub fn max_delay(&self) -> Duration {
        self.defaults.max_delay
    }

    pub fn using_fallback(&self) -> bool {
        self.using_fallback
    }

    pub fn is_unstable(&self) -> bool {
        self.unstable_noted
    }

    /// Everything `GET /terminal/network-status/:id` needs about the current
    /// adapter state, gathered under a single lock acquisition.
    pub fn snapshot(&self) -> NetworkMetricsSnapshot {
        NetworkMetricsSnapshot {
            using_fallback: self.using_fallback,
            unstable: self.unstable_noted,
            category: self.rtt_category(),
            rtt_avg_ms: self.rtt_avg(),
            rtt_sample_count: self.rtt_samples.len(),
            bandwidth_bps: self.bandwidth_estimate(),
            optimal_delay_ms: self.optimal_delay().as_millis() as u64,
            optimal_batch_size: self.optimal_batch_size(),
        }
    }

    pub fn rtt_category(&self) -> RttCategory {
        if self.rtt_samples.is_empty() {
            return RttCategory::Unknown;
        }
        let avg = self.rtt_avg();
        if avg < 50.0 {
            RttCategory::Excellent
        } else if avg < 150.0 {
            RttCategory::Good
        } else if avg < 300.0 {
            RttCategory::Fair
        } else {
            RttCategory::Poor
        }
    }

    /// Adaptive flush delay, banded by current RTT and jitter.
    pub fn optimal_delay(&self) -> Duration {
        let d = &self.defaults;
        if self.using_fallback || self.rtt_samples.len() < 5 {
            return d.min_delay;
        }

        let avg = self.rtt_avg();
        let min_delay_ms = d.min_delay.as_secs_f64() * 1000.0;
        let max_delay_ms = d.max_delay.as_secs_f64() * 1000.0;

        let mut base_ms = if avg < 20.0 {
            5.0_f64.max(min_delay_ms.min(avg * 0.5))
        } else if avg < 50.0 {
            min_delay_ms
        } else if avg < 150.0 {
            min_delay_ms * 1.5
        } else if avg < 300.0 {
            min_delay_ms * 2.0
        } else {
            (max_delay_ms * 0.75).min(min_delay_ms * 3.0)
        };

        let stddev = self.rtt_stddev();
        let ratio = if avg > 0.0 { stddev / avg } else { 0.0 };
        if ratio > 0.5 {
            base_ms *= 1.0 + (ratio - 0.5);
        }

        base_ms = base_ms.clamp(min_delay_ms / 2.0, max_delay_ms * 0.8);
        Duration::from_secs_f64(base_ms / 1000.0)
    }

    /// Adaptive flush size, derived from the trimmed-mean bandwidth estimate.
    pub fn optimal_batch_size(&self) -> usize {
        let d = &self.defaults;
        if self.using_fallback {
            return d.flush_threshold;
        }

        let bandwidth = self.bandwidth_estimate();
        if bandwidth <= 0.0 {
            return d.flush_threshold;
        }

        let target_ms = d.target_transmit_time.as_secs_f64() * 1000.0;
        let raw = bandwidth * target_ms / 1000.0;
        raw.clamp(d.min_batch_size as f64, d.max_batch_size as f64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> NetworkMetrics {
        NetworkMetrics::new(NetworkDefaults::default())
    }

    #[test]
    fn fallback_before_five_samples() {
        let m = metrics();
        assert_eq!(m.optimal_delay(), Duration::from_millis(12));
        assert_eq!(m.optimal_batch_size(), 8 * 1024);
    }

    #[test]
    fn delay_is_non_decreasing_as_rtt_bands_rise() {
        let bands = [10.0, 30.0, 100.0, 250.0, 400.0];
        let mut delays = Vec::new();
        for avg in bands {
            let mut m = metrics();
            for _ in 0..5 {
                m.ingest_rtt_sample(avg);
            }
            delays.push(m.optimal_delay());
        }
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0], "delays must be non-decreasing: {:?}", delays);
        }
    }

    #[test]
    fn consecutive_failures_trigger_fallback_mode() {
        let mut m = metrics();
        for _ in 0..5 {
            m.ingest_rtt_sample(100.0);
        }
        assert!(!m.using_fallback());
        for _ in 0..5 {
            m.record_failure();
        }
        assert!(m.using_fallback());
        assert_eq!(m.optimal_delay(), Duration::from_millis(12));
        assert_eq!(m.optimal_batch_size(), 8 * 1024);
    }

    #[test]
    fn outlier_rejected_after_five_samples() {
        let mut m = metrics();
        for _ in 0..5 {
            assert!(m.ingest_rtt_sample(100.0));
        }
        // min=max=100 here, so outlier bounds are [33.3, 300].
        assert!(!m.ingest_rtt_sample(10_000.0));
        assert!(m.ingest_rtt_sample(150.0));
    }

    #[test]
    fn bandwidth_trims_outliers_with_enough_samples() {
        let mut m = metrics();
        m.record_bandwidth(1000, 1000.0); // 1000 B/s
        m.record_bandwidth(2000, 1000.0); // 2000 B/s
        m.record_bandwidth(3000, 1000.0); // 3000 B/s
        m.record_bandwidth(100_000, 1000.0); // outlier high
        let estimate = m.bandwidth_estimate();
        assert!(estimate < 100_000.0);
    }

    #[test]
    fn reset_to_fallback_is_sticky_until_measurements_recover() {
        let mut m = metrics();
        m.reset_to_fallback();
        assert!(m.using_fallback());
    }

    #[test]
    fn measurement_expiry_counts_as_failure() {
        let mut m = metrics();
        let id = m.stamp_measurement(Instant::now());
        let later = Instant::now() + Duration::from_secs(11);
        m.expire_stale_measurements(later);
        assert_eq!(m.consecutive_failed_measurements, 1);
        // A late reply for the now-expired id must not double count.
        assert!(!m.report_rtt(id, 50.0));
    }

    #[test]
    fn five_expired_measurements_reach_fallback_via_timeout_alone() {
        let mut m = metrics();
        for i in 0..5 {
            let start = Instant::now();
            m.stamp_measurement(start);
            let expired_count = m.expire_stale_measurements(start + Duration::from_secs(11));
            assert_eq!(expired_count, 1, "iteration {i}");
        }
        assert!(m.using_fallback());
        assert_eq!(m.optimal_delay(), Duration::from_millis(12));
        assert_eq!(m.optimal_batch_size(), 8 * 1024);
    }
}
