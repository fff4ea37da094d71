//! HTTP API tests driven through the router with `oneshot`.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use nerdcam_common::LivenessState;
use serde_json::Value;
use tower::ServiceExt;

use common::{wait_until, MockCommands, TestHarness, UNREACHABLE};

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn get_json(harness: &TestHarness, uri: &str) -> (StatusCode, Value) {
    let response = harness
        .router()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = body_bytes(response).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_json(harness: &TestHarness, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = harness
        .router()
        .oneshot(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = body_bytes(response).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_check() {
    let harness = TestHarness::new(MockCommands::default());
    let response = harness
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_status_before_start() {
    let harness = TestHarness::new(MockCommands::default());
    let (status, json) = get_json(&harness, "/api/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "starting");
    assert_eq!(json["sequence"], 0);
    assert!(json["last_frame_age_ms"].is_null());
    assert_eq!(json["fanout_clients"], 0);
    assert_eq!(json["active_relays"], 0);
    assert_eq!(json["source"]["sessions_started"], 0);
    assert_eq!(json["recording"]["recording"], false);
    assert!(json["transitions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_status_reports_live_source() {
    let harness = TestHarness::new(MockCommands::default());
    harness.ctx.source.start();
    harness
        .wait_for_state(LivenessState::Live, Duration::from_secs(5))
        .await;

    let (status, json) = get_json(&harness, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "live");
    assert!(json["sequence"].as_u64().unwrap() >= 1);
    assert!(json["last_frame_age_ms"].is_u64());
    assert_eq!(json["source"]["active_sessions"], 1);

    let transitions = json["transitions"].as_array().unwrap();
    assert_eq!(transitions[0]["from"], "starting");
    assert_eq!(transitions[0]["to"], "live");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_unavailable_without_frame() {
    let harness = TestHarness::new(MockCommands::default());
    let (status, json) = get_json(&harness, "/api/snapshot").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], 503);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_snapshot_returns_latest_frame() {
    let harness = TestHarness::new(MockCommands::default());
    harness.ctx.source.start();
    harness
        .wait_for_state(LivenessState::Live, Duration::from_secs(5))
        .await;

    let response = harness
        .router()
        .oneshot(Request::get("/api/snapshot").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");

    let body = body_bytes(response).await;
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
    assert_eq!(&body[body.len() - 2..], &[0xFF, 0xD9]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_mjpeg_unavailable_when_source_failed() {
    let harness = TestHarness::with_config(MockCommands::default().shared(UNREACHABLE), |c| {
        c.liveness.backoff_initial_ms = 10_000;
        c.liveness.backoff_max_ms = 10_000;
    });
    harness.ctx.source.start();
    harness
        .wait_for_state(LivenessState::Failed, Duration::from_secs(5))
        .await;

    let (status, json) = get_json(&harness, "/api/mjpeg").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], 503);
    assert_eq!(harness.ctx.fanout.client_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_get_settings_defaults() {
    let harness = TestHarness::new(MockCommands::default());
    let (status, json) = get_json(&harness, "/api/settings").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rtsp_transport"], "tcp");
    assert_eq!(json["quality"], 7);
    assert_eq!(json["mic_gain"], 3.0);
    assert_eq!(json["frame_rate"], 25);
    assert!(json["rec_codec"].is_string());
    assert_eq!(json["rec_compression"], 5);
}

#[tokio::test]
async fn test_update_mic_gain_rounds_to_one_decimal() {
    let harness = TestHarness::new(MockCommands::default());
    let (status, json) =
        post_json(&harness, "/api/settings", serde_json::json!({ "mic_gain": 2.34 })).await;

    assert_eq!(status, StatusCode::OK);
    let gain = json["mic_gain"].as_f64().unwrap();
    assert!((gain - 2.3).abs() < 1e-6, "gain was {gain}");
    assert!((harness.ctx.settings.read().mic_gain - 2.3).abs() < 1e-6);
}

#[tokio::test]
async fn test_invalid_settings_rejected_without_side_effects() {
    let harness = TestHarness::new(MockCommands::default());

    for body in [
        serde_json::json!({ "quality": 0 }),
        serde_json::json!({ "quality": 11 }),
        serde_json::json!({ "rtsp_transport": "sctp" }),
        serde_json::json!({ "mic_gain": 9.5 }),
        serde_json::json!({ "quality": 3, "mic_gain": 0.2 }),
    ] {
        let (status, json) = post_json(&harness, "/api/settings", body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
        assert_eq!(json["status"], 400);
    }

    let settings = *harness.ctx.settings.read();
    assert_eq!(settings.quality, 7);
    assert_eq!(settings.transport.to_string(), "tcp");
    assert_eq!(settings.mic_gain, 3.0);
}

#[tokio::test]
async fn test_transport_change_restarts_shared_source() {
    let harness = TestHarness::new(MockCommands::default());
    harness.ctx.source.start();
    harness
        .wait_for_state(LivenessState::Live, Duration::from_secs(5))
        .await;

    let (status, json) = post_json(
        &harness,
        "/api/settings",
        serde_json::json!({ "rtsp_transport": "udp" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rtsp_transport"], "udp");

    let source = &harness.ctx.source;
    assert!(
        wait_until(Duration::from_secs(5), || {
            source.stats().sessions_started >= 2 && source.state() == LivenessState::Live
        })
        .await,
        "source did not come back after restart"
    );

    let edges: Vec<_> = source.transitions().iter().map(|t| (t.from, t.to)).collect();
    assert!(edges.contains(&(LivenessState::Live, LivenessState::Restarting)));
    assert_eq!(source.stats().peak_active_sessions, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_mic_gain_change_keeps_shared_source() {
    let harness = TestHarness::new(MockCommands::default());
    harness.ctx.source.start();
    harness
        .wait_for_state(LivenessState::Live, Duration::from_secs(5))
        .await;

    let (status, _) =
        post_json(&harness, "/api/settings", serde_json::json!({ "mic_gain": 4.0 })).await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.ctx.source.stats().sessions_started, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let harness = TestHarness::new(MockCommands::default());
    let response = harness
        .router()
        .oneshot(Request::get("/api/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_events_stream_replays_state_changes() {
    let mut harness = TestHarness::new(MockCommands::default());
    let addr = harness.serve().await;
    harness
        .wait_for_state(LivenessState::Live, Duration::from_secs(5))
        .await;

    let mut response = reqwest::get(format!("http://{addr}/api/events"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = response.chunk().await.unwrap() {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if seen.contains("source_state_changed") && seen.contains(r#""to":"live""#) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "no state change event in: {seen}");

    drop(response);
    harness.shutdown().await;
}
