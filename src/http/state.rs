//! Shared application state handed to every handler.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::pty::PtySpawner;
use crate::rate_limit::{Admission, RateLimiterFamily};
use crate::session::{Session, SessionId};
use crate::telemetry::Telemetry;

/// Cloned into every handler via axum's `State` extractor; everything
/// inside is already `Arc`-shared so cloning `AppState` is cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub spawner: Arc<dyn PtySpawner>,
    pub telemetry: Arc<Telemetry>,

    sessions: Arc<RwLock<std::collections::HashMap<SessionId, Arc<Session>>>>,

    general_limiter: Arc<RateLimiterFamily<IpAddr>>,
    create_limiter: Arc<RateLimiterFamily<IpAddr>>,
    input_limiter: Arc<RateLimiterFamily<(IpAddr, SessionId)>>,
}

impl AppState {
    pub fn new(config: GatewayConfig, spawner: Arc<dyn PtySpawner>) -> Self {
        let general_limiter = Arc::new(RateLimiterFamily::new(config.general_limits));
        let create_limiter = Arc::new(RateLimiterFamily::new(config.terminal_create_limits));
        let input_limiter = Arc::new(RateLimiterFamily::new(config.input_limits));

        Self {
            config: Arc::new(config),
            spawner,
            telemetry: Arc::new(Telemetry::new()),
            sessions: Arc::new(RwLock::new(std::collections::HashMap::new())),
            general_limiter,
            create_limiter,
            input_limiter,
        }
    }

    pub async fn check_general(&self, ip: IpAddr) -> Result<(), GatewayError> {
        admit(self.general_limiter.admit(ip).await)
    }

    pub async fn check_create(&self, ip: IpAddr) -> Result<(), GatewayError> {
        admit(self.create_limiter.admit(ip).await)
    }

    pub async fn check_input(&self, ip: IpAddr, session_id: &SessionId) -> Result<(), GatewayError> {
        admit(self.input_limiter.admit((ip, session_id.clone())).await)
    }

    pub async fn insert_session(&self, session: Arc<Session>) {
        self.sessions.write().await.insert(session.id.clone(), session);
    }

    pub async fn get_session(&self, id: &str) -> Result<Arc<Session>, GatewayError> {
        self.sessions
            .read()
            .await
            .get(&SessionId(id.to_string()))
            .cloned()
            .ok_or(GatewayError::NotFound)
    }

    pub async fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&SessionId(id.to_string()))
    }

    /// Reap sessions idle past `max_idle` with no attached subscribers.
    /// Called from the server's periodic housekeeping task.
    pub async fn sweep_idle(&self) {
        let max_idle = self.config.max_idle;
        let mut doomed = Vec::new();
        for (id, session) in self.sessions.read().await.iter() {
            if session.idle_for() > max_idle && session.subscriber_count().await == 0 {
                doomed.push(id.clone());
            }
        }
        for id in doomed {
            if let Some(session) = self.sessions.write().await.remove(&id) {
                tracing::info!(session = %id, "reaping idle session");
                let _ = session.close().await;
            }
        }

        self.general_limiter.evict_idle().await;
        self.create_limiter.evict_idle().await;
        self.input_limiter.evict_idle().await;
    }

    /// Expire timed-out pending RTT measurements across every live session.
    /// Called from a periodic housekeeping task, independent of `sweep_idle`.
    pub async fn expire_stale_measurements(&self) {
        for session in self.sessions.read().await.values() {
            session.expire_stale_measurements();
        }
    }

    /// Close every live session's child process, regardless of idle state.
    /// Called once on process shutdown so no `kubectl exec` child is left
    /// running after the gateway exits.
    pub async fn close_all_sessions(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            let id = session.id.clone();
            if let Err(err) = session.close().await {
                tracing::warn!(session = %id, error = %err, "failed to close session on shutdown");
            }
        }
    }
}

fn admit(admission: Admission) -> Result<(), GatewayError> {
    match admission {
        Admission::Ok => Ok(()),
        Admission::Denied { retry_after_secs } => Err(GatewayError::RateLimited { retry_after_secs }),
    }
}
