//! Console log handlers: remote filter and toggle control.

use crate::server::{AgentState, ConnState, SessionState};
use cd_protocol::{ConsoleLogStatus, Envelope, SetConsoleLogEnabled, SetConsoleLogFilter};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// `set_console_log_filter`: update the level bitmask.
pub async fn set_console_log_filter(conn: &mut ConnState, env: &Envelope) {
    let p: SetConsoleLogFilter = match env.parse_payload() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed set_console_log_filter payload");
            return;
        }
    };
    conn.console_log.set_level_mask(p.level_mask);
    info!(mask = p.level_mask, "console log filter updated");
    conn.outbound
        .send_reply(
            &env.id,
            "set_console_log_filter",
            &SetConsoleLogFilter {
                level_mask: p.level_mask,
            },
        )
        .await;
}

/// `set_console_log_enabled`: toggle streaming remotely.
pub async fn set_console_log_enabled(
    conn: &mut ConnState,
    state: &Arc<AgentState>,
    env: &Envelope,
) {
    let p: SetConsoleLogEnabled = env.parse_payload().unwrap_or_default();
    {
        let settings = state.settings.lock().await;
        if let Err(e) = settings.set("console_log_enabled", &p.enabled) {
            warn!(error = %e, "failed to persist console log toggle");
        }
    }
    if p.enabled && conn.session == SessionState::Auth {
        conn.console_log.start(conn.outbound.clone());
    } else {
        conn.console_log.stop().await;
    }
    info!(enabled = p.enabled, "console log enabled (remote)");
    state
        .bridge
        .notify("console_log_toggle", json!({ "enabled": p.enabled }))
        .await;
    conn.outbound
        .send_reply(
            &env.id,
            "set_console_log_enabled",
            &SetConsoleLogEnabled { enabled: p.enabled },
        )
        .await;
    send_console_log_status(conn, state).await;
}

pub async fn send_console_log_status(conn: &ConnState, state: &Arc<AgentState>) {
    let payload = ConsoleLogStatus {
        enabled: state.console_log_enabled().await,
        level_mask: conn.console_log.level_mask(),
    };
    conn.outbound
        .send_event("console_log_status", &payload)
        .await;
}
