//! End-to-end HTTP surface tests, driven against the real router with a
//! fake PTY spawner so no `kubectl` binary or cluster is required.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use termgate::config::GatewayConfig;
use termgate::http::{router, AppState};
use termgate::pty::test_support::EchoSpawner;

fn test_state() -> AppState {
    AppState::new(GatewayConfig::default(), Arc::new(EchoSpawner))
}

/// `ConnectInfo` is normally inserted by `into_make_service_with_connect_info`
/// at accept time; tests that call the router directly via `oneshot` have to
/// stand in for that by inserting it into the request's extensions.
fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        0,
    )));
    req
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_check_responds_ok() {
    let app = router(test_state());
    let response = app
        .oneshot(request("GET", "/health", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_write_status_and_close_round_trip() {
    let app = router(test_state());

    let create_body = json!({ "pod": "my-pod", "container": "my-container" }).to_string();
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/terminal/create",
            Body::from(create_body),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    let session_id = created["sessionId"].as_str().unwrap().to_string();
    assert!(session_id.starts_with("term_"));

    let status_response = app
        .clone()
        .oneshot(request(
            "GET",
            &format!("/terminal/status/{session_id}"),
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(status_response.status(), StatusCode::OK);
    let status = body_json(status_response).await;
    assert_eq!(status["pod"], "my-pod");

    let input_response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/terminal/input/{session_id}"),
            Body::from("echo hi\n"),
        ))
        .await
        .unwrap();
    assert_eq!(input_response.status(), StatusCode::NO_CONTENT);

    let close_response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/terminal/close/{session_id}"),
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(close_response.status(), StatusCode::NO_CONTENT);

    // A second close of an already-closed session reports not found.
    let second_close = app
        .oneshot(request(
            "POST",
            &format!("/terminal/close/{session_id}"),
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(second_close.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_rejects_invalid_pod_name() {
    let app = router(test_state());
    let body = json!({ "pod": "Not Valid!", "container": "c" }).to_string();
    let response = app
        .oneshot(request("POST", "/terminal/create", Body::from(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn operations_on_unknown_session_return_404() {
    let app = router(test_state());
    let response = app
        .oneshot(request(
            "GET",
            "/terminal/status/term_does_not_exist",
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn terminal_create_rate_limit_trips_after_configured_points() {
    let mut cfg = GatewayConfig::default();
    cfg.terminal_create_limits.points = 1;
    let state = AppState::new(cfg, Arc::new(EchoSpawner));
    let app = router(state);

    let make_request = || {
        request(
            "POST",
            "/terminal/create",
            Body::from(json!({ "pod": "p", "container": "c" }).to_string()),
        )
    };

    let first = app.clone().oneshot(make_request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(make_request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = second
        .headers()
        .get(axum::http::header::RETRY_AFTER)
        .expect("429 response must carry a Retry-After header");
    assert_eq!(retry_after.to_str().unwrap(), "120");
}

#[tokio::test]
async fn performance_endpoint_reflects_created_sessions() {
    let app = router(test_state());
    let create_body = json!({ "pod": "p", "container": "c" }).to_string();
    let _ = app
        .clone()
        .oneshot(request(
            "POST",
            "/terminal/create",
            Body::from(create_body),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(request("GET", "/terminal/performance", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot = body_json(response).await;
    assert_eq!(snapshot["sessionsCreated"], 1);
}
