//! Per-subscriber adaptive batching.
//!
//! Each attached SSE subscriber owns its own pending buffer and flush
//! timer; the session's shared network adapter (`crate::network`) supplies
//! the size/delay thresholds the batcher flushes against.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::ctrlseq::contains_control_sequence;
use crate::network::NetworkMetrics;
use crate::sse::{encode_frame, OutputFrame};
use crate::telemetry::Telemetry;

/// Why a flush happened, used by the telemetry aggregator's per-reason
/// flush counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Timeout,
    Control,
}

struct BatchState {
    pending: Vec<u8>,
    last_flush: Instant,
    activity_counter: u32,
}

impl BatchState {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            last_flush: Instant::now(),
            activity_counter: 0,
        }
    }
}

/// One SSE subscriber attached to a session's output, with its own
/// adaptive-batching state. `tx` carries already-rendered SSE frame text to
/// the HTTP handler's response stream.
pub struct Subscriber {
    pub id: u64,
    tx: mpsc::Sender<String>,
    state: Mutex<BatchState>,
    wake: Notify,
    telemetry: Arc<Telemetry>,
}

impl Subscriber {
    pub fn new(id: u64, tx: mpsc::Sender<String>, telemetry: Arc<Telemetry>) -> Arc<Self> {
        Arc::new(Self {
            id,
            tx,
            state: Mutex::new(BatchState::new()),
            wake: Notify::new(),
            telemetry,
        })
    }

    /// Feed newly-arrived PTY output to this subscriber's batcher. Size and
    /// control-sequence triggers flush synchronously; otherwise the pending
    /// bytes wait for [`Self::run_timeout_loop`] to flush them.
    pub async fn enqueue(&self, data: &[u8], net: &Mutex<NetworkMetrics>) -> Option<FlushReason> {
        let is_control = contains_control_sequence(data);
        let (batch_size, max_delay) = {
            let guard = net.lock();
            (guard.optimal_batch_size(), guard.max_delay())
        };

        let reason = {
            let mut state = self.state.lock();
            state.pending.extend_from_slice(data);
            state.activity_counter = state.activity_counter.saturating_add(1);

            if is_control {
                Some(FlushReason::Control)
            } else if state.pending.len() >= batch_size {
                Some(FlushReason::Size)
            } else if state.last_flush.elapsed() >= max_delay {
                // The first un-flushed byte has already waited MAX_DELAY; a
                // steady stream of sub-threshold chunks must not be able to
                // postpone this past the hard cap by repeatedly re-arming
                // the timeout loop's sleep.
                Some(FlushReason::Timeout)
            } else {
                None
            }
        };

        match reason {
            Some(reason) => {
                self.flush(reason, net).await;
            }
            None => self.wake.notify_one(),
        }
        reason
    }

    /// Drain pending bytes and emit one SSE frame, recording bandwidth
    /// against the elapsed time since the previous flush. No-op if nothing
    /// is pending (the timeout loop calls this speculatively).
    async fn flush(&self, reason: FlushReason, net: &Mutex<NetworkMetrics>) -> bool {
        let (bytes, elapsed_ms) = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return false;
            }
            let bytes = std::mem::take(&mut state.pending);
            let elapsed = state.last_flush.elapsed();
            state.last_flush = Instant::now();
            state.activity_counter = state.activity_counter.saturating_sub(5);
            (bytes, elapsed.as_secs_f64() * 1000.0)
        };

        let rtt_measure = {
            let mut guard = net.lock();
            guard.record_bandwidth(bytes.len(), elapsed_ms);
            let now = Instant::now();
            if guard.should_stamp_measurement(now) {
                Some(guard.stamp_measurement(now))
            } else {
                None
            }
        };
        self.telemetry.record_flush(reason, bytes.len());

        let frame = OutputFrame {
            data: String::from_utf8_lossy(&bytes).into_owned(),
            rtt_measure,
        };
        self.tx.send(encode_frame(&frame)).await.is_ok()
    }

    /// Runs until the subscriber's channel closes, flushing on timeout.
    /// Only one instance of this loop ever runs per subscriber — spawned
    /// once from `Session::attach` — so there is never more than one armed
    /// timer per subscriber.
    pub async fn run_timeout_loop(self: Arc<Self>, net: Arc<Mutex<NetworkMetrics>>) {
        loop {
            if self.tx.is_closed() {
                return;
            }
            let delay = net.lock().optimal_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if self.tx.is_closed() {
                        return;
                    }
                    self.flush(FlushReason::Timeout, &net).await;
                }
                _ = self.wake.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkDefaults;

    fn net() -> Mutex<NetworkMetrics> {
        Mutex::new(NetworkMetrics::new(NetworkDefaults::default()))
    }

    fn telemetry() -> Arc<Telemetry> {
        Arc::new(Telemetry::new())
    }

    #[tokio::test]
    async fn small_write_stays_pending_until_flushed() {
        let (tx, mut rx) = mpsc::channel(4);
        let sub = Subscriber::new(1, tx, telemetry());
        let net = net();

        let reason = sub.enqueue(b"hi", &net).await;
        assert!(reason.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn control_sequence_flushes_immediately() {
        let (tx, mut rx) = mpsc::channel(4);
        let sub = Subscriber::new(1, tx, telemetry());
        let net = net();

        let reason = sub.enqueue(b"\x1b[31mred\x1b[0m", &net).await;
        assert_eq!(reason, Some(FlushReason::Control));
        let frame = rx.recv().await.expect("flush produced a frame");
        assert!(frame.starts_with("data: "));
    }

    #[tokio::test]
    async fn size_threshold_triggers_flush() {
        let (tx, mut rx) = mpsc::channel(4);
        let sub = Subscriber::new(1, tx, telemetry());
        let net = net();
        // fallback mode batch size is the flush_threshold default (8 KiB).
        let big = vec![b'a'; 8 * 1024];

        let reason = sub.enqueue(&big, &net).await;
        assert_eq!(reason, Some(FlushReason::Size));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn steady_sub_threshold_chunks_still_flush_within_max_delay() {
        let (tx, mut rx) = mpsc::channel(4);
        let sub = Subscriber::new(1, tx, telemetry());
        let net = net();

        // A small chunk every 10ms, well under the 50ms default MAX_DELAY,
        // previously could re-arm the timeout loop's sleep indefinitely.
        for _ in 0..4 {
            let reason = sub.enqueue(b"x", &net).await;
            assert!(reason.is_none());
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        // The first byte is now 40ms+ old; one more chunk past 50ms must flush.
        tokio::time::advance(Duration::from_millis(15)).await;
        let reason = sub.enqueue(b"x", &net).await;
        assert_eq!(reason, Some(FlushReason::Timeout));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn flush_stamps_an_rtt_measurement_on_first_flush() {
        let (tx, mut rx) = mpsc::channel(4);
        let sub = Subscriber::new(1, tx, telemetry());
        let net = net();

        // Control sequences flush immediately, so this exercises `flush`
        // without waiting on the timeout loop.
        sub.enqueue(b"\x1b[31mred\x1b[0m", &net).await;
        let frame = rx.recv().await.expect("flush produced a frame");
        assert!(frame.contains("_rttMeasure"));
    }
}
