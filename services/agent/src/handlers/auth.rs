//! Handshake and pairing handlers.

use crate::server::{AgentState, ConnState, ConnectedHub, LoopAction, SessionState, authorize};
use cd_protocol::{
    Compatibility, Envelope, HubConnected, PairConfirm, PairFailed, PairSuccess, PairingRequired,
    check_protocol_compatibility, error_codes,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// `hub_connected`: protocol gate, then token auth or the pairing path.
pub async fn hub_connected(
    conn: &mut ConnState,
    state: &Arc<AgentState>,
    env: &Envelope,
) -> LoopAction {
    let p: HubConnected = match env.parse_payload() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed hub_connected payload");
            conn.outbound
                .send_error(&env.id, error_codes::BAD_REQUEST, "invalid payload")
                .await;
            return LoopAction::Continue;
        }
    };
    info!(
        name = %p.name,
        version = %p.version,
        platform = %p.platform,
        protocol = p.protocol_version,
        "hub connected"
    );

    // Reject incompatible protocol versions before any auth.
    match check_protocol_compatibility(p.protocol_version) {
        Compatibility::Incompatible(reason) => {
            warn!(hub_id = %p.hub_id, reason = %reason, "rejecting hub");
            conn.outbound
                .send_error(&env.id, error_codes::NOT_ACCEPTABLE, reason)
                .await;
            return LoopAction::Close;
        }
        Compatibility::Deprecated(reason) => warn!(hub_id = %p.hub_id, reason = %reason),
        Compatibility::Compatible => {}
    }

    // Returning peer with a valid token.
    if !p.token.is_empty() && !p.hub_id.is_empty() {
        let valid = {
            let pairing = state.pairing.lock().await;
            pairing.validate_token(&p.hub_id, &p.token).await
        };
        if valid {
            authorize(
                conn,
                state,
                ConnectedHub {
                    id: p.hub_id.clone(),
                    name: p.name.clone(),
                    version: p.version.clone(),
                    platform: p.platform.clone(),
                },
            )
            .await;

            let status = crate::server::agent_status(state).await;
            conn.outbound
                .send_reply(&env.id, "agent_status", &status)
                .await;
            state
                .bridge
                .notify(
                    "hub_connected",
                    json!({ "name": p.name, "version": p.version }),
                )
                .await;

            if status.telemetry_enabled {
                conn.telemetry
                    .start(status.telemetry_interval, conn.outbound.clone());
            }
            if status.console_log_enabled {
                conn.console_log.start(conn.outbound.clone());
            }
            return LoopAction::Continue;
        }
    }

    // Needs pairing.
    if p.hub_id.is_empty() {
        conn.outbound
            .send_error(&env.id, error_codes::UNAUTHORIZED, "hub_id required")
            .await;
        return LoopAction::Continue;
    }

    let (code, lockout_remaining) = {
        let mut pairing = state.pairing.lock().await;
        let code = pairing.generate_code(&p.hub_id, &p.name, &p.platform);
        (code, pairing.lockout_remaining())
    };
    match code {
        None => {
            conn.outbound
                .send_error(
                    &env.id,
                    error_codes::LOCKED_OUT,
                    format!("Pairing locked out. Try again in {lockout_remaining}s"),
                )
                .await;
        }
        Some(code) => {
            conn.hub_id = Some(p.hub_id);
            conn.session = SessionState::AwaitPair;
            conn.outbound
                .send_reply(
                    &env.id,
                    "pairing_required",
                    &PairingRequired {
                        code: code.clone(),
                        expires_in: crate::pairing::PAIRING_CODE_EXPIRY_SECS,
                    },
                )
                .await;
            state.bridge.notify("pairing_code", json!({ "code": code })).await;
        }
    }
    LoopAction::Continue
}

/// `pair_confirm`: validate the code; stay in `AwaitPair` on failure.
pub async fn pair_confirm(conn: &mut ConnState, state: &Arc<AgentState>, env: &Envelope) {
    let p: PairConfirm = env.parse_payload().unwrap_or_default();
    let hub_id = conn.hub_id.clone().unwrap_or_default();

    let (token, hub_name, locked_remaining) = {
        let mut pairing = state.pairing.lock().await;
        let hub_name = pairing.pending_hub_name().map(str::to_owned);
        let token = pairing.validate_code(&hub_id, &p.code).await;
        let locked = pairing
            .is_locked_out()
            .then(|| pairing.lockout_remaining());
        (token, hub_name, locked)
    };

    match token {
        Some(token) => {
            authorize(
                conn,
                state,
                ConnectedHub {
                    id: hub_id,
                    name: hub_name.unwrap_or_default(),
                    version: String::new(),
                    platform: String::new(),
                },
            )
            .await;
            conn.outbound
                .send_reply(&env.id, "pair_success", &PairSuccess { token })
                .await;
            state.bridge.notify("pairing_success", json!({})).await;
        }
        None => {
            if let Some(remaining) = locked_remaining {
                conn.outbound
                    .send_reply(
                        &env.id,
                        "pair_failed",
                        &PairFailed {
                            reason: format!(
                                "Too many failed attempts. Locked for {remaining}s"
                            ),
                        },
                    )
                    .await;
                state
                    .bridge
                    .notify("pairing_locked", json!({ "remainingSeconds": remaining }))
                    .await;
            } else {
                conn.outbound
                    .send_reply(
                        &env.id,
                        "pair_failed",
                        &PairFailed {
                            reason: "Invalid code".to_owned(),
                        },
                    )
                    .await;
            }
        }
    }
}
