//! Shared harness: boots a real agent on ephemeral ports with tempdir
//! storage and drives it with the mock Hub client.
#![allow(dead_code)]

use agent::bridge::BridgeEvent;
use agent::config::load_config_from_str;
use agent::server::{AgentServer, AgentState};
use agent::settings::Settings;
use cd_protocol::{Envelope, HubConnected, PairConfirm};
use cd_test_utils::HubClient;
use std::sync::Arc;
use std::time::Duration;

pub struct TestAgent {
    pub state: Arc<AgentState>,
    pub port: u16,
    pub install_root: tempfile::TempDir,
    _data_dir: tempfile::TempDir,
}

pub async fn start_agent() -> TestAgent {
    let install_root = tempfile::tempdir().expect("install tempdir");
    let data_dir = tempfile::tempdir().expect("data tempdir");
    let toml = format!(
        r#"
schema_version = 1

[agent]
name = "Test Deck"
install_path = "{}"

[server]
bind = "127.0.0.1:0"

[discovery]
enabled = false
"#,
        install_root.path().display()
    );
    let cfg = load_config_from_str(&toml).expect("config");
    let settings = Settings::open(&data_dir.path().join("agent.sqlite3")).expect("settings");
    let state = AgentState::new(cfg, settings).await;
    state.bridge.sweep_stale().await;

    let server = AgentServer::bind(state.clone()).await.expect("bind");
    let port = server.port();
    tokio::spawn(server.run());

    TestAgent {
        state,
        port,
        install_root,
        _data_dir: data_dir,
    }
}

pub fn hub_connected(token: &str) -> HubConnected {
    HubConnected {
        hub_id: "hub-test".to_owned(),
        name: "Test Hub".to_owned(),
        version: "1.0.0".to_owned(),
        platform: "linux".to_owned(),
        token: token.to_owned(),
        protocol_version: 1,
    }
}

/// Run the full interactive pairing dance; returns the issued token.
pub async fn pair(agent: &TestAgent) -> String {
    let mut client = HubClient::connect(agent.port).await.expect("connect");
    client
        .send_request("hub_connected", &hub_connected(""))
        .await
        .expect("send hub_connected");
    let required = client.recv_envelope().await.expect("pairing_required");
    assert_eq!(required.kind, "pairing_required");

    let code = take_event_wait(agent, "pairing_code").await.data["code"]
        .as_str()
        .expect("code")
        .to_owned();

    client
        .send_request("pair_confirm", &PairConfirm { code })
        .await
        .expect("send pair_confirm");
    let success = client.recv_envelope().await.expect("pair_success");
    assert_eq!(success.kind, "pair_success", "got {success:?}");
    let token = success.payload.expect("payload")["token"]
        .as_str()
        .expect("token")
        .to_owned();
    client.close().await.ok();
    token
}

/// Connect with a valid token and consume the `agent_status` response.
pub async fn connect_authed(agent: &TestAgent, token: &str) -> (HubClient, Envelope) {
    let mut client = HubClient::connect(agent.port).await.expect("connect");
    client
        .send_request("hub_connected", &hub_connected(token))
        .await
        .expect("send hub_connected");
    let status = client.recv_envelope().await.expect("agent_status");
    assert_eq!(status.kind, "agent_status", "got {status:?}");
    (client, status)
}

/// Frontend events commit slightly after the wire response; poll briefly.
pub async fn take_event_wait(agent: &TestAgent, event: &str) -> BridgeEvent {
    for _ in 0..40 {
        if let Some(ev) = agent.state.bridge.take_event(event).await {
            return ev;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("frontend event '{event}' never arrived");
}

/// Wait for a filesystem condition that trails an async task.
pub async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..80 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never became true: {what}");
}
