//! Process-wide performance telemetry, exposed at `GET /terminal/performance`
//! and periodically dumped to the log.
//!
//! All counters are plain atomics updated from the hot paths in
//! `crate::session` and `crate::batch`; nothing here blocks.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::batch::FlushReason;

const RTT_BUCKET_WIDTH_MS: u64 = 100;
const RTT_BUCKET_COUNT: usize = 10;

/// Process-lifetime counters. One instance lives in `AppState`, shared by
/// every handler via `Arc`.
pub struct Telemetry {
    started_at: Instant,

    sessions_created: AtomicU64,
    sessions_active: AtomicI64,

    commands_total: AtomicU64,
    bytes_sent_total: AtomicU64,

    flush_size: AtomicU64,
    flush_timeout: AtomicU64,
    flush_control: AtomicU64,

    rtt_buckets: [AtomicU64; RTT_BUCKET_COUNT],

    measurements_succeeded: AtomicU64,
    measurements_timed_out: AtomicU64,
    fallbacks_triggered: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            sessions_created: AtomicU64::new(0),
            sessions_active: AtomicI64::new(0),
            commands_total: AtomicU64::new(0),
            bytes_sent_total: AtomicU64::new(0),
            flush_size: AtomicU64::new(0),
            flush_timeout: AtomicU64::new(0),
            flush_control: AtomicU64::new(0),
            rtt_buckets: Default::default(),
            measurements_succeeded: AtomicU64::new(0),
            measurements_timed_out: AtomicU64::new(0),
            fallbacks_triggered: AtomicU64::new(0),
        }
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_command(&self) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, reason: FlushReason, bytes: usize) {
        self.bytes_sent_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
        let counter = match reason {
            FlushReason::Size => &self.flush_size,
            FlushReason::Timeout => &self.flush_timeout,
            FlushReason::Control => &self.flush_control,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rtt_sample(&self, rtt_ms: f64) {
        self.measurements_succeeded.fetch_add(1, Ordering::Relaxed);
        let idx = ((rtt_ms.max(0.0) as u64) / RTT_BUCKET_WIDTH_MS) as usize;
        let idx = idx.min(RTT_BUCKET_COUNT - 1);
        self.rtt_buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_measurement_timeout(&self) {
        self.measurements_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_triggered(&self) {
        self.fallbacks_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed).max(0) as u64,
            commands_total: self.commands_total.load(Ordering::Relaxed),
            bytes_sent_total: self.bytes_sent_total.load(Ordering::Relaxed),
            flush_size: self.flush_size.load(Ordering::Relaxed),
            flush_timeout: self.flush_timeout.load(Ordering::Relaxed),
            flush_control: self.flush_control.load(Ordering::Relaxed),
            rtt_histogram_ms: self
                .rtt_buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            measurements_succeeded: self.measurements_succeeded.load(Ordering::Relaxed),
            measurements_timed_out: self.measurements_timed_out.load(Ordering::Relaxed),
            fallbacks_triggered: self.fallbacks_triggered.load(Ordering::Relaxed),
        }
    }

    /// Log a structured snapshot. Called on a `telemetry_interval` tick by
    /// the server's background housekeeping task.
    pub fn log_snapshot(&self) {
        let s = self.snapshot();
        tracing::info!(
            uptime_secs = s.uptime_secs,
            sessions_active = s.sessions_active,
            sessions_created = s.sessions_created,
            commands_total = s.commands_total,
            bytes_sent_total = s.bytes_sent_total,
            flush_size = s.flush_size,
            flush_timeout = s.flush_timeout,
            flush_control = s.flush_control,
            fallbacks_triggered = s.fallbacks_triggered,
            "performance telemetry"
        );
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON body for `GET /terminal/performance`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub uptime_secs: u64,
    pub sessions_created: u64,
    pub sessions_active: u64,
    pub commands_total: u64,
    pub bytes_sent_total: u64,
    pub flush_size: u64,
    pub flush_timeout: u64,
    pub flush_control: u64,
    pub rtt_histogram_ms: Vec<u64>,
    pub measurements_succeeded: u64,
    pub measurements_timed_out: u64,
    pub fallbacks_triggered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_sample_lands_in_expected_bucket() {
        let t = Telemetry::new();
        t.record_rtt_sample(250.0); // bucket 2 (200-300ms)
        let snap = t.snapshot();
        assert_eq!(snap.rtt_histogram_ms[2], 1);
        assert_eq!(snap.measurements_succeeded, 1);
    }

    #[test]
    fn rtt_sample_above_max_clamps_to_last_bucket() {
        let t = Telemetry::new();
        t.record_rtt_sample(5_000.0);
        let snap = t.snapshot();
        assert_eq!(snap.rtt_histogram_ms[RTT_BUCKET_COUNT - 1], 1);
    }

    #[test]
    fn session_lifecycle_counters() {
        let t = Telemetry::new();
        t.record_session_created();
        t.record_session_created();
        t.record_session_closed();
        let snap = t.snapshot();
        assert_eq!(snap.sessions_created, 2);
        assert_eq!(snap.sessions_active, 1);
    }
}
