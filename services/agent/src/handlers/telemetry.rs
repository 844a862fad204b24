//! Telemetry status push.
//!
//! Pump lifecycle lives on the connection state; this module only shapes the
//! `telemetry_status` frames sent when toggles change.

use crate::server::{AgentState, ConnState};
use cd_protocol::TelemetryStatus;
use std::sync::Arc;

pub async fn send_telemetry_status(conn: &ConnState, state: &Arc<AgentState>) {
    let payload = TelemetryStatus {
        enabled: state.telemetry_enabled().await,
        interval: state.telemetry_interval().await,
    };
    conn.outbound.send_event("telemetry_status", &payload).await;
}
