//! Process entry point: bootstrap config and logging, bind the listener,
//! and run the HTTP surface alongside idle-reaping and telemetry
//! housekeeping tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use termgate::config::GatewayConfig;
use termgate::http::{router, AppState};
use termgate::pty::KubectlSpawner;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting termgate");

    let config = GatewayConfig::from_env();
    let port = config.port;
    let sweep_interval = config.sweep_interval;
    let telemetry_interval = config.telemetry_interval;
    let measurement_sweep_interval = config.measurement_sweep_interval;

    let state = AppState::new(config, Arc::new(KubectlSpawner));

    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            sweep_state.sweep_idle().await;
        }
    });

    let telemetry_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(telemetry_interval);
        loop {
            ticker.tick().await;
            telemetry_state.telemetry.log_snapshot();
        }
    });

    let measurement_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(measurement_sweep_interval);
        loop {
            ticker.tick().await;
            measurement_state.expire_stale_measurements().await;
        }
    });

    let shutdown_state = state.clone();
    let app = router(state);

    let socket = tokio::net::TcpSocket::new_v4().expect("failed to create socket");
    socket.set_nodelay(true).expect("failed to set TCP_NODELAY");
    socket
        .bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .expect("failed to bind listener");
    let listener = socket.listen(1024).expect("failed to listen");

    tracing::info!(port, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    tracing::info!("closing all sessions before exit");
    shutdown_state.close_all_sessions().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
