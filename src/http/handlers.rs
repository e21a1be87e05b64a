//! Route handlers.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderName, HeaderValue, Response, StatusCode, Version};
use axum::Json;
use serde::{Deserialize, Serialize};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GatewayError;
use crate::pty::TerminalSize;
use crate::session::Session;
use crate::sse::{encode_frame, keepalive_line, OutputFrame, KEEPALIVE_HTTP1, KEEPALIVE_HTTP2};
use crate::validate::{validate_input, validate_pod_container, validate_resize};

use super::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pod: Option<String>,
    container: Option<String>,
    #[serde(default = "default_cols")]
    cols: i64,
    #[serde(default = "default_rows")]
    rows: i64,
}

fn default_cols() -> i64 {
    80
}

fn default_rows() -> i64 {
    24
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    session_id: String,
}

pub async fn create_terminal(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, GatewayError> {
    state.check_general(addr.ip()).await?;
    state.check_create(addr.ip()).await?;

    let pod = req
        .pod
        .or_else(|| state.config.pod_name.clone())
        .ok_or_else(|| GatewayError::Validation("pod is required".to_string()))?;
    let container = req
        .container
        .or_else(|| state.config.container_name.clone())
        .ok_or_else(|| GatewayError::Validation("container is required".to_string()))?;

    validate_pod_container(&pod, &container).map_err(GatewayError::Validation)?;
    let (cols, rows) = validate_resize(req.cols, req.rows).map_err(GatewayError::Validation)?;

    let spawned = state
        .spawner
        .spawn(&pod, &container, TerminalSize::new(cols, rows))
        .await?;

    let session = Session::spawn(pod, container, spawned, &state.config, state.telemetry.clone());
    let session_id = session.id.to_string();
    state.insert_session(session).await;

    tracing::info!(session = %session_id, "created terminal session");
    Ok(Json(CreateResponse { session_id }))
}

pub async fn input(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<StatusCode, GatewayError> {
    let session = state.get_session(&id).await?;
    state.check_input(addr.ip(), &session.id).await?;

    validate_input(&body).map_err(GatewayError::Validation)?;
    session.write_input(body.to_vec()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    cols: i64,
    rows: i64,
}

pub async fn resize(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<StatusCode, GatewayError> {
    state.check_general(addr.ip()).await?;
    let session = state.get_session(&id).await?;
    let (cols, rows) = validate_resize(req.cols, req.rows).map_err(GatewayError::Validation)?;
    session.resize(TerminalSize::new(cols, rows)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /terminal/output/:id` — the SSE stream. Replays the last
/// `replay_window` of output, then streams live frames, interleaving
/// protocol-appropriate keepalive comments.
pub async fn output(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    version: Version,
) -> Result<Response<Body>, GatewayError> {
    state.check_general(addr.ip()).await?;
    let session = state.get_session(&id).await?;
    let (sub_id, mut rx, replay) = session.attach().await;

    let keepalive_interval = if version == Version::HTTP_2 {
        KEEPALIVE_HTTP2
    } else {
        KEEPALIVE_HTTP1
    };

    let (out_tx, out_rx) = mpsc::channel::<String>(64);
    if !replay.is_empty() {
        let frame = OutputFrame {
            data: String::from_utf8_lossy(&replay).into_owned(),
            rtt_measure: None,
        };
        let _ = out_tx.try_send(encode_frame(&frame));
    }

    let pump_session = session.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(frame) => {
                            if out_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(keepalive_interval) => {
                    if out_tx.send(keepalive_line().to_string()).await.is_err() {
                        break;
                    }
                }
            }
        }
        pump_session.detach(sub_id).await;
    });

    let stream = ReceiverStream::new(out_rx)
        .map(|frame| Ok::<_, Infallible>(axum::body::Bytes::from(frame)));
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    Ok(response)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    session_id: String,
    pod: String,
    container: String,
    uptime_secs: u64,
    idle_secs: u64,
    subscriber_count: usize,
    bytes_sent_total: u64,
    commands_seen: u64,
}

pub async fn status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, GatewayError> {
    state.check_general(addr.ip()).await?;
    let session = state.get_session(&id).await?;
    Ok(Json(StatusResponse {
        session_id: session.id.to_string(),
        pod: session.pod.clone(),
        container: session.container.clone(),
        uptime_secs: session.created_at().elapsed().as_secs(),
        idle_secs: session.idle_for().as_secs(),
        subscriber_count: session.subscriber_count().await,
        bytes_sent_total: session.bytes_sent_total(),
        commands_seen: session.commands_seen(),
    }))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    state.check_general(addr.ip()).await?;
    let session = state.get_session(&id).await?;
    session.touch();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn ping(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    state.check_general(addr.ip()).await?;
    let session = state.get_session(&id).await?;
    session.touch();
    Ok(Json(serde_json::json!({ "pong": true })))
}

pub async fn close(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    state.check_general(addr.ip()).await?;
    match state.remove_session(&id).await {
        Some(session) => {
            session.close().await?;
            tracing::info!(session = %id, "closed terminal session");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(GatewayError::NotFound),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRttRequest {
    measurement_id: u64,
    rtt_ms: f64,
}

pub async fn report_rtt(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    Json(req): Json<ReportRttRequest>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    state.check_general(addr.ip()).await?;
    let session = state.get_session(&id).await?;
    let accepted = session.report_rtt(req.measurement_id, req.rtt_ms);
    Ok(Json(serde_json::json!({ "accepted": accepted })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetricsResponse {
    using_fallback: bool,
    unstable: bool,
    rtt_category: &'static str,
    rtt_avg_ms: f64,
    rtt_sample_count: usize,
    bandwidth_bps: f64,
    optimal_delay_ms: u64,
    optimal_batch_size: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDefaultsResponse {
    min_delay_ms: u64,
    max_delay_ms: u64,
    flush_threshold: usize,
    min_batch_size: usize,
    max_batch_size: usize,
    fail_threshold: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatusResponse {
    success: bool,
    metrics: NetworkMetricsResponse,
    defaults: NetworkDefaultsResponse,
}

pub async fn network_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<Json<NetworkStatusResponse>, GatewayError> {
    state.check_general(addr.ip()).await?;
    let session = state.get_session(&id).await?;
    let snapshot = session.network_snapshot();
    let defaults = &state.config.network;
    Ok(Json(NetworkStatusResponse {
        success: true,
        metrics: NetworkMetricsResponse {
            using_fallback: snapshot.using_fallback,
            unstable: snapshot.unstable,
            rtt_category: match snapshot.category {
                crate::network::RttCategory::Excellent => "excellent",
                crate::network::RttCategory::Good => "good",
                crate::network::RttCategory::Fair => "fair",
                crate::network::RttCategory::Poor => "poor",
                crate::network::RttCategory::Unknown => "unknown",
            },
            rtt_avg_ms: snapshot.rtt_avg_ms,
            rtt_sample_count: snapshot.rtt_sample_count,
            bandwidth_bps: snapshot.bandwidth_bps,
            optimal_delay_ms: snapshot.optimal_delay_ms,
            optimal_batch_size: snapshot.optimal_batch_size,
        },
        defaults: NetworkDefaultsResponse {
            min_delay_ms: defaults.min_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            flush_threshold: defaults.flush_threshold,
            min_batch_size: defaults.min_batch_size,
            max_batch_size: defaults.max_batch_size,
            fail_threshold: defaults.fail_threshold,
        },
    }))
}

pub async fn reset_network(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    state.check_general(addr.ip()).await?;
    let session = state.get_session(&id).await?;
    session.reset_network();
    state.telemetry.record_fallback_triggered();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn performance(State(state): State<AppState>) -> Json<crate::telemetry::TelemetrySnapshot> {
    Json(state.telemetry.snapshot())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvResponse {
    pod_name: Option<String>,
    container_name: Option<String>,
}

pub async fn env(State(state): State<AppState>) -> Json<EnvResponse> {
    Json(EnvResponse {
        pod_name: state.config.pod_name.clone(),
        container_name: state.config.container_name.clone(),
    })
}

pub async fn health() -> &'static str {
    "ok"
}
