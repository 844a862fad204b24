//! Session state machine: authorization gate, version negotiation,
//! replacement policy, dispatch.

mod common;

use cd_test_utils::HubClient;
use common::{connect_authed, hub_connected, pair, start_agent};
use serde_json::json;

/// Any request before the handshake is answered 401.
#[tokio::test]
async fn requests_before_auth_are_rejected() {
    let agent = start_agent().await;
    let mut client = HubClient::connect(agent.port).await.unwrap();

    for kind in ["get_info", "init_upload", "ping"] {
        client.send_request(kind, &json!({})).await.unwrap();
        let resp = client.recv_envelope().await.unwrap();
        assert_eq!(resp.kind, "error", "kind {kind}");
        let err = resp.error.unwrap();
        assert_eq!(err.code, 401);
        assert_eq!(err.message, "Not authorized");
    }
}

/// Out-of-range protocol versions get a 406 and the connection is closed.
#[tokio::test]
async fn incompatible_version_is_406_and_close() {
    let agent = start_agent().await;
    let mut client = HubClient::connect(agent.port).await.unwrap();

    let mut payload = hub_connected("");
    payload.protocol_version = 99;
    client.send_request("hub_connected", &payload).await.unwrap();

    let resp = client.recv_envelope().await.unwrap();
    assert_eq!(resp.kind, "error");
    assert_eq!(resp.error.unwrap().code, 406);
    assert!(client.wait_closed().await, "agent must close after 406");
}

/// Version 0 predates explicit versioning and is accepted as 1.
#[tokio::test]
async fn version_zero_is_normalized() {
    let agent = start_agent().await;
    let mut client = HubClient::connect(agent.port).await.unwrap();

    let mut payload = hub_connected("");
    payload.protocol_version = 0;
    client.send_request("hub_connected", &payload).await.unwrap();

    let resp = client.recv_envelope().await.unwrap();
    assert_eq!(resp.kind, "pairing_required", "got {resp:?}");
}

/// `ping` answers `pong` with the same correlation id once authorized.
#[tokio::test]
async fn ping_pong_round_trip() {
    let agent = start_agent().await;
    let token = pair(&agent).await;
    let (mut client, _) = connect_authed(&agent, &token).await;

    let id = client.send_request("ping", &json!({})).await.unwrap();
    let pong = client.recv_envelope().await.unwrap();
    assert_eq!(pong.kind, "pong");
    assert_eq!(pong.id, id);
    assert!(pong.payload.is_none());
}

/// Unknown types are ignored without an error frame; the session stays up.
#[tokio::test]
async fn unknown_type_is_ignored() {
    let agent = start_agent().await;
    let token = pair(&agent).await;
    let (mut client, _) = connect_authed(&agent, &token).await;

    client
        .send_request("definitely_not_a_thing", &json!({"x": 1}))
        .await
        .unwrap();
    let id = client.send_request("ping", &json!({})).await.unwrap();
    // The very next frame is the pong — nothing was emitted for the unknown
    // type.
    let next = client.recv_envelope().await.unwrap();
    assert_eq!(next.kind, "pong");
    assert_eq!(next.id, id);
}

/// A second inbound connection replaces the session: the old peer is closed
/// and the newcomer authenticates normally.
#[tokio::test]
async fn second_connection_replaces_session() {
    let agent = start_agent().await;
    let token = pair(&agent).await;

    let (mut first, _) = connect_authed(&agent, &token).await;
    let (mut second, status) = connect_authed(&agent, &token).await;
    assert_eq!(status.kind, "agent_status");

    assert!(first.wait_closed().await, "old session must be torn down");

    // The new session is fully functional.
    let id = second.send_request("ping", &json!({})).await.unwrap();
    let pong = second.recv_envelope().await.unwrap();
    assert_eq!((pong.kind.as_str(), pong.id), ("pong", id));

    let report = agent.state.status().await;
    assert!(report.connected);
    assert_eq!(report.hub_name.as_deref(), Some("Test Hub"));
}

/// `get_info` and `get_config` reflect identity and settings.
#[tokio::test]
async fn info_and_config_queries() {
    let agent = start_agent().await;
    let token = pair(&agent).await;
    let (mut client, _) = connect_authed(&agent, &token).await;

    client.send_request("get_info", &json!({})).await.unwrap();
    let info = client.recv_envelope().await.unwrap();
    assert_eq!(info.kind, "info_response");
    let payload = info.payload.unwrap();
    assert_eq!(payload["agent"]["name"], "Test Deck");
    assert_eq!(payload["agent"]["platform"], "linux");
    assert_eq!(
        payload["agent"]["id"].as_str().unwrap().len(),
        8,
        "agent id is 8 hex chars"
    );

    client.send_request("get_config", &json!({})).await.unwrap();
    let config = client.recv_envelope().await.unwrap();
    assert_eq!(config.kind, "config_response");
    assert_eq!(
        config.payload.unwrap()["installPath"],
        agent.install_root.path().to_string_lossy().as_ref()
    );
}

/// Local telemetry toggles reach the live session as `telemetry_status`
/// pushes.
#[tokio::test]
async fn telemetry_toggle_pushes_status() {
    let agent = start_agent().await;
    let token = pair(&agent).await;
    let (mut client, _) = connect_authed(&agent, &token).await;

    agent.state.set_telemetry_interval(5).await;
    let status = client.recv_until("telemetry_status").await.unwrap();
    let payload = status.payload.unwrap();
    assert_eq!(payload["enabled"], false);
    assert_eq!(payload["interval"], 5);

    agent.state.set_telemetry_enabled(true).await;
    let status = client.recv_until("telemetry_status").await.unwrap();
    assert_eq!(status.payload.unwrap()["enabled"], true);

    agent.state.set_telemetry_enabled(false).await;
    let status = client.recv_until("telemetry_status").await.unwrap();
    assert_eq!(status.payload.unwrap()["enabled"], false);
}

/// Remote console-log toggling answers with an echo and a status push.
#[tokio::test]
async fn console_log_remote_toggle() {
    let agent = start_agent().await;
    let token = pair(&agent).await;
    let (mut client, _) = connect_authed(&agent, &token).await;

    client
        .send_request("set_console_log_enabled", &json!({"enabled": true}))
        .await
        .unwrap();
    let echo = client.recv_until("set_console_log_enabled").await.unwrap();
    assert_eq!(echo.payload.unwrap()["enabled"], true);
    let status = client.recv_until("console_log_status").await.unwrap();
    let payload = status.payload.unwrap();
    assert_eq!(payload["enabled"], true);
    assert_eq!(payload["levelMask"], 15);

    client
        .send_request("set_console_log_filter", &json!({"levelMask": 4}))
        .await
        .unwrap();
    let echo = client.recv_until("set_console_log_filter").await.unwrap();
    assert_eq!(echo.payload.unwrap()["levelMask"], 4);
}
