//! Game management handlers: list, delete, restart the client.

use crate::server::{AgentState, ConnState};
use cd_protocol::{
    DeleteGame, Envelope, OperationResult, ShortcutEntry, ShortcutsResponse, SteamResponse,
    error_codes,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// `list_shortcuts`: serve from tracked data — the client writes the catalog
/// lazily, so it is not the source of truth for freshly created entries.
pub async fn list_shortcuts(conn: &mut ConnState, state: &Arc<AgentState>, env: &Envelope) {
    let shortcuts: Vec<ShortcutEntry> = state
        .tracked_shortcuts()
        .await
        .into_iter()
        .map(|sc| ShortcutEntry {
            app_id: sc.app_id,
            name: sc.name,
            exe: sc.exe,
            start_dir: sc.start_dir,
            launch_options: String::new(),
            last_played: 0,
        })
        .collect();
    conn.outbound
        .send_reply(&env.id, "shortcuts_response", &ShortcutsResponse { shortcuts })
        .await;
}

/// `delete_game`: remove the install directory, the tracked entry, and ask
/// the UI surface to drop the client shortcut.
pub async fn delete_game(conn: &mut ConnState, state: &Arc<AgentState>, env: &Envelope) {
    let p: DeleteGame = env.parse_payload().unwrap_or_default();
    let tracked = state.tracked_shortcuts().await;

    let Some(game) = tracked.iter().find(|sc| sc.app_id == p.app_id).cloned() else {
        conn.outbound
            .send_error(&env.id, error_codes::NOT_FOUND, "game not found")
            .await;
        return;
    };
    let game_name = if game.name.is_empty() {
        game.game_name.clone()
    } else {
        game.name.clone()
    };

    state
        .bridge
        .notify(
            "operation_event",
            json!({
                "type": "delete",
                "status": "start",
                "gameName": game_name,
                "progress": 0,
            }),
        )
        .await;

    let start_dir = game.start_dir.trim_matches('"').to_owned();
    if !start_dir.is_empty() {
        match tokio::fs::remove_dir_all(&start_dir).await {
            Ok(()) => info!(path = %start_dir, "game folder deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(path = %start_dir, error = %e, "failed to delete game folder"),
        }
    }

    state
        .bridge
        .notify("remove_shortcut", json!({ "appId": p.app_id }))
        .await;

    let remaining: Vec<_> = tracked
        .into_iter()
        .filter(|sc| sc.app_id != p.app_id)
        .collect();
    state.set_tracked_shortcuts(&remaining).await;

    state
        .bridge
        .notify(
            "operation_event",
            json!({
                "type": "delete",
                "status": "complete",
                "gameName": game_name,
                "progress": 100,
            }),
        )
        .await;

    conn.outbound
        .send_reply(
            &env.id,
            "operation_result",
            &OperationResult {
                status: Some("deleted".to_owned()),
                game_name: Some(game_name),
                steam_restarted: Some(false),
                ..Default::default()
            },
        )
        .await;
}

/// `restart_steam`: graceful shutdown; in gaming mode the session manager
/// brings the client back automatically.
pub async fn restart_steam(conn: &mut ConnState, env: &Envelope) {
    let result = std::process::Command::new("steam")
        .arg("-shutdown")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    let payload = match result {
        Ok(_) => SteamResponse {
            success: true,
            message: "restarting".to_owned(),
        },
        Err(e) => SteamResponse {
            success: false,
            message: e.to_string(),
        },
    };
    conn.outbound
        .send_reply(&env.id, "steam_response", &payload)
        .await;
}
