//! Per-client relays: lifecycle and cleanup.

mod common;

use std::time::Duration;

use nerdcam_common::RelayProfile;

use common::{process_gone, wait_until, MockCommands, TestHarness};

#[tokio::test]
async fn test_relay_content_types() {
    let mut harness = TestHarness::new(MockCommands::default());
    let addr = harness.serve().await;

    for (path, profile) in [
        ("fmp4", RelayProfile::Fmp4),
        ("stream", RelayProfile::MpegTs),
        ("audio", RelayProfile::Audio),
    ] {
        let mut response = reqwest::get(format!("http://{addr}/api/{path}"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], profile.content_type());
        assert_eq!(response.headers()["cache-control"], "no-cache");

        let first = response.chunk().await.unwrap().unwrap();
        let expected = format!("relay:{profile}:tcp;");
        assert!(
            first.starts_with(expected.as_bytes()),
            "unexpected first chunk {:?}",
            String::from_utf8_lossy(&first)
        );
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn test_connect_disconnect_cycles_leave_no_processes() {
    let mut harness = TestHarness::new(MockCommands::default());
    let addr = harness.serve().await;
    let relays = &harness.ctx.relays;

    let mut pids = Vec::new();
    for _ in 0..10 {
        let client = reqwest::Client::new();
        let mut response = client
            .get(format!("http://{addr}/api/fmp4"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        response.chunk().await.unwrap().unwrap();

        let open = relays.relays();
        assert_eq!(open.len(), 1);
        pids.push(open[0].pid.expect("relay pid"));

        drop(response);
        drop(client);
        assert!(
            wait_until(Duration::from_secs(5), || relays.active_count() == 0).await,
            "relay not closed after disconnect"
        );
    }

    assert_eq!(relays.opened_count(), 10);
    assert_eq!(relays.closed_count(), 10);
    for pid in pids {
        assert!(process_gone(pid), "relay process {pid} still present");
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn test_relays_run_independently() {
    let mut harness = TestHarness::new(MockCommands::default());
    let addr = harness.serve().await;

    let mut first = reqwest::get(format!("http://{addr}/api/stream")).await.unwrap();
    let mut second = reqwest::get(format!("http://{addr}/api/stream")).await.unwrap();
    first.chunk().await.unwrap().unwrap();
    second.chunk().await.unwrap().unwrap();

    let open = harness.ctx.relays.relays();
    assert_eq!(open.len(), 2);
    assert_ne!(open[0].pid, open[1].pid);

    drop(first);
    let relays = &harness.ctx.relays;
    assert!(wait_until(Duration::from_secs(5), || relays.active_count() == 1).await);

    // The remaining relay keeps streaming.
    let chunk = tokio::time::timeout(Duration::from_secs(2), second.chunk())
        .await
        .unwrap()
        .unwrap();
    assert!(chunk.is_some());

    drop(second);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_relay_without_output_is_unavailable() {
    let mut harness = TestHarness::new(
        MockCommands::default().relay("echo 'Connection refused' >&2; exit 1"),
    );
    let addr = harness.serve().await;

    let response = reqwest::get(format!("http://{addr}/api/fmp4")).await.unwrap();
    assert_eq!(response.status(), 503);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["status"], 503);

    assert_eq!(harness.ctx.relays.active_count(), 0);
    assert_eq!(harness.ctx.relays.closed_count(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_silent_relay_times_out() {
    let harness = TestHarness::with_config(
        MockCommands::default().relay("exec sleep 1000"),
        |c| c.relay.startup_timeout_ms = 300,
    );

    let started = std::time::Instant::now();
    let result = harness.ctx.relays.open(RelayProfile::Audio, None).await;
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(harness.ctx.relays.active_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_relay_uses_current_transport() {
    let harness = TestHarness::new(MockCommands::default());
    harness.ctx.settings.write().transport = "udp".parse().unwrap();

    let relay = harness
        .ctx
        .relays
        .open(RelayProfile::Fmp4, None)
        .await
        .unwrap();

    use futures::StreamExt;
    let mut stream = Box::pin(relay.into_stream());
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.starts_with(b"relay:fmp4:udp;"));

    drop(stream);
    let relays = &harness.ctx.relays;
    assert!(wait_until(Duration::from_secs(5), || relays.active_count() == 0).await);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_reaps_open_relays() {
    let harness = TestHarness::new(MockCommands::default());

    let relay = harness
        .ctx
        .relays
        .open(RelayProfile::MpegTs, None)
        .await
        .unwrap();
    let pid = harness.ctx.relays.relays()[0].pid.unwrap();

    let relays = std::sync::Arc::clone(&harness.ctx.relays);
    harness.shutdown().await;

    assert_eq!(relays.active_count(), 0);
    assert!(process_gone(pid));
    drop(relay);

    let refused = relays.open(RelayProfile::Audio, None).await;
    assert!(refused.is_err());
}
