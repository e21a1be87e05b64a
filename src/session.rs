//! One live `kubectl exec` PTY and everything hanging off it: output
//! history, attached SSE subscribers, and per-session network telemetry.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::batch::Subscriber;
use crate::config::GatewayConfig;
use crate::network::{NetworkMetrics, NetworkMetricsSnapshot};
use crate::pty::{PtyError, SpawnedPty, TerminalSize};
use crate::telemetry::Telemetry;

/// Opaque session identifier: `term_<uuid v4, no hyphens>`. CSPRNG-backed,
/// unguessable but still a legible path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("term_{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct OutputChunk {
    at: Instant,
    bytes: Arc<[u8]>,
}

/// One live exec session: the PTY child, its recent-output ring buffer, and
/// every subscriber currently attached to it. Exactly one output pump runs
/// per session, owning the PTY's output channel.
pub struct Session {
    pub id: SessionId,
    pub pod: String,
    pub container: String,

    pty: Arc<SpawnedPty>,
    net: Arc<SyncMutex<NetworkMetrics>>,

    output_buffer: SyncMutex<VecDeque<OutputChunk>>,
    output_buffer_capacity: usize,
    replay_window: Duration,

    subscribers: RwLock<HashMap<u64, Arc<Subscriber>>>,
    next_subscriber_id: AtomicU64,

    created_at: Instant,
    last_activity: SyncMutex<Instant>,

    bytes_sent_total: AtomicU64,
    commands_seen: AtomicU64,
    current_command_id: AtomicU64,

    telemetry: Arc<Telemetry>,
}

impl Session {
    /// Build a session around an already-spawned PTY and start its output
    /// pump. The pump owns the PTY's output channel for the session's
    /// entire lifetime.
    pub fn spawn(
        pod: String,
        container: String,
        pty: SpawnedPty,
        cfg: &GatewayConfig,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        let pty = Arc::new(pty);
        telemetry.record_session_created();
        let session = Arc::new(Self {
            id: SessionId::generate(),
            pod,
            container,
            pty,
            net: Arc::new(SyncMutex::new(NetworkMetrics::new(cfg.network))),
            output_buffer: SyncMutex::new(VecDeque::new()),
            output_buffer_capacity: cfg.output_buffer_capacity,
            replay_window: cfg.replay_window,
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            created_at: Instant::now(),
            last_activity: SyncMutex::new(Instant::now()),
            bytes_sent_total: AtomicU64::new(0),
            commands_seen: AtomicU64::new(0),
            current_command_id: AtomicU64::new(0),
            telemetry,
        });

        tokio::spawn(session.clone().run_output_pump());
        session
    }

    async fn run_output_pump(self: Arc<Self>) {
        let mut output_rx = match self.pty.take_output() {
            Some(rx) => rx,
            None => {
                tracing::error!(session = %self.id, "output channel already taken");
                return;
            }
        };

        while let Some(chunk) = output_rx.recv().await {
            self.record_output(&chunk);

            let subscribers: Vec<Arc<Subscriber>> =
                self.subscribers.read().await.values().cloned().collect();
            for sub in subscribers {
                sub.enqueue(&chunk, &self.net).await;
            }
        }
        tracing::debug!(session = %self.id, "output pump ended, pty closed");
    }

    fn record_output(&self, bytes: &[u8]) {
        let now = Instant::now();
        *self.last_activity.lock() = now;
        self.bytes_sent_total
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let mut buffer = self.output_buffer.lock();
        buffer.push_back(OutputChunk {
            at: now,
            bytes: Arc::from(bytes),
        });
        while buffer.len() > self.output_buffer_capacity {
            buffer.pop_front();
        }
    }

    /// Attach a new SSE subscriber. Returns its id, the receiving end of its
    /// frame channel, and a replay of output from the last `replay_window`
    /// so a quick reconnect doesn't lose anything.
    pub async fn attach(self: &Arc<Self>) -> (u64, mpsc::Receiver<String>, Vec<u8>) {
        let (tx, rx) = mpsc::channel(256);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber::new(id, tx, self.telemetry.clone());

        self.subscribers.write().await.insert(id, subscriber.clone());
        tokio::spawn(subscriber.run_timeout_loop(self.net.clone()));

        let replay = self.replay();
        (id, rx, replay)
    }

    pub async fn detach(&self, subscriber_id: u64) {
        self.subscribers.write().await.remove(&subscriber_id);
    }

    fn replay(&self) -> Vec<u8> {
        let cutoff = Instant::now() - self.replay_window;
        let buffer = self.output_buffer.lock();
        let mut out = Vec::new();
        for chunk in buffer.iter() {
            if chunk.at >= cutoff {
                out.extend_from_slice(&chunk.bytes);
            }
        }
        out
    }

    /// Write verbatim bytes to the child's stdin, with no escaping applied.
    pub async fn write_input(&self, data: Vec<u8>) -> Result<(), PtyError> {
        *self.last_activity.lock() = Instant::now();
        self.commands_seen.fetch_add(1, Ordering::Relaxed);
        self.current_command_id.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_command();
        self.pty.write(data).await
    }

    pub async fn resize(&self, size: TerminalSize) -> Result<(), PtyError> {
        *self.last_activity.lock() = Instant::now();
        self.pty.resize(size).await
    }

    pub async fn close(&self) -> Result<(), PtyError> {
        self.pty.kill().await
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Mark activity without counting it as a command (heartbeat/ping).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn bytes_sent_total(&self) -> u64 {
        self.bytes_sent_total.load(Ordering::Relaxed)
    }

    pub fn commands_seen(&self) -> u64 {
        self.commands_seen.load(Ordering::Relaxed)
    }

    pub fn current_command_id(&self) -> u64 {
        self.current_command_id.load(Ordering::Relaxed)
    }

    /// Record a client-reported RTT for a measurement this session stamped
    /// earlier. Returns whether it was accepted (not already expired).
    pub fn report_rtt(&self, measurement_id: u64, rtt_ms: f64) -> bool {
        let accepted = self.net.lock().report_rtt(measurement_id, rtt_ms);
        if accepted {
            self.telemetry.record_rtt_sample(rtt_ms);
        }
        accepted
    }

    pub fn network_snapshot(&self) -> NetworkMetricsSnapshot {
        self.net.lock().snapshot()
    }

    pub fn reset_network(&self) {
        self.net.lock().reset_to_fallback();
    }

    /// Expire this session's timed-out pending RTT measurements, counting
    /// each as a failure and logging one telemetry timeout event per expiry.
    /// Called periodically for every live session by a background task.
    pub fn expire_stale_measurements(&self) {
        let expired = self.net.lock().expire_stale_measurements(Instant::now());
        for _ in 0..expired {
            self.telemetry.record_measurement_timeout();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.telemetry.record_session_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::test_support::EchoSpawner;
    use crate::pty::PtySpawner;

    #[test]
    fn session_ids_are_prefixed_and_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert!(a.0.starts_with("term_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn expire_stale_measurements_delegates_to_network_adapter() {
        let mut cfg = GatewayConfig::default();
        cfg.network.measurement_timeout = Duration::from_millis(5);
        let telemetry = Arc::new(Telemetry::new());
        let pty = EchoSpawner
            .spawn("p-1", "c-1", TerminalSize::new(80, 24))
            .await
            .unwrap();
        let session = Session::spawn(
            "p-1".to_string(),
            "c-1".to_string(),
            pty,
            &cfg,
            telemetry.clone(),
        );

        let id = session.net.lock().stamp_measurement(Instant::now());
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.expire_stale_measurements();

        assert!(!session.report_rtt(id, 50.0));
        assert_eq!(telemetry.snapshot().measurements_timed_out, 1);

        session.close().await.unwrap();
    }
}
