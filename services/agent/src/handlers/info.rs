//! Info and config query handlers.

use crate::server::{AgentState, ConnState};
use crate::steam;
use cd_protocol::{AgentInfo, ConfigResponse, Envelope, InfoResponse, SteamUser, SteamUsersResponse};
use std::sync::Arc;
use tracing::error;

pub async fn get_info(conn: &mut ConnState, state: &Arc<AgentState>, env: &Envelope) {
    let payload = InfoResponse {
        agent: AgentInfo {
            id: state.agent_id.clone(),
            name: state.agent_name().await,
            platform: "linux".to_owned(),
            version: state.version.clone(),
            accept_connections: state.accept_connections().await,
        },
    };
    conn.outbound
        .send_reply(&env.id, "info_response", &payload)
        .await;
}

pub async fn get_config(conn: &mut ConnState, state: &Arc<AgentState>, env: &Envelope) {
    let payload = ConfigResponse {
        install_path: state.install_path().await,
    };
    conn.outbound
        .send_reply(&env.id, "config_response", &payload)
        .await;
}

pub async fn get_steam_users(conn: &mut ConnState, env: &Envelope) {
    let users = match tokio::task::spawn_blocking(steam::steam_users).await {
        Ok(users) => users,
        Err(e) => {
            error!(error = %e, "steam user scan failed");
            Vec::new()
        }
    };
    let payload = SteamUsersResponse {
        users: users.into_iter().map(|u| SteamUser { id: u.id }).collect(),
    };
    conn.outbound
        .send_reply(&env.id, "steam_users_response", &payload)
        .await;
}
