// cd-protocol: CapyDeploy control-channel types and serialization.
//
// All control-channel text frames share one envelope shape:
//
// ```json
// { "id": "...", "type": "...", "payload": { ... } }
// ```
//
// Error responses replace `payload` with an `error` object.  Payload field
// names are camelCase on the wire; the typed structs below carry the rename.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Current protocol version spoken by this agent.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest peer protocol version still accepted.
pub const PROTOCOL_MIN_SUPPORTED: u32 = 1;

/// Maximum control-channel frame size (text or binary).
pub const MAX_FRAME_BYTES: usize = 50 * 1024 * 1024;

/// Chunk size advertised to the Hub for the control-channel upload path.
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// Frozen numeric error codes carried in `error` frames.
pub mod error_codes {
    /// Bad request: safe-path violation, invalid arguments.
    pub const BAD_REQUEST: i32 = 400;
    /// Not authorized / missing hub id.
    pub const UNAUTHORIZED: i32 = 401;
    /// Unknown upload id or game.
    pub const NOT_FOUND: i32 = 404;
    /// Incompatible protocol version.
    pub const NOT_ACCEPTABLE: i32 = 406;
    /// Pairing locked out.
    pub const LOCKED_OUT: i32 = 429;
}

/// Console log level bitmask values.
///
/// The default mask carries everything except debug.
pub mod log_levels {
    pub const LOG: u32 = 1;
    pub const WARN: u32 = 2;
    pub const ERROR: u32 = 4;
    pub const INFO: u32 = 8;
    pub const DEBUG: u32 = 16;
    pub const DEFAULT_MASK: u32 = LOG | WARN | ERROR | INFO;

    /// Map a level name to its mask bit.  Unknown levels map to 0.
    ///
    /// `warning` and `verbose` are accepted aliases for warn/debug.
    pub fn level_bit(level: &str) -> u32 {
        match level {
            "log" => LOG,
            "warn" | "warning" => WARN,
            "error" => ERROR,
            "info" => INFO,
            "debug" | "verbose" => DEBUG,
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Version compatibility
// ---------------------------------------------------------------------------

/// Outcome of checking a peer's advertised protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    /// In range but below current; accepted.
    Deprecated(String),
    /// Out of `[PROTOCOL_MIN_SUPPORTED, PROTOCOL_VERSION]`; reject with 406.
    Incompatible(String),
}

/// Check whether a peer's protocol version is compatible.
///
/// Version 0 predates explicit versioning and is treated as 1.
pub fn check_protocol_compatibility(peer_version: u32) -> Compatibility {
    let effective = if peer_version == 0 { 1 } else { peer_version };

    if effective < PROTOCOL_MIN_SUPPORTED {
        return Compatibility::Incompatible(format!(
            "peer protocol v{effective} is below minimum supported v{PROTOCOL_MIN_SUPPORTED}"
        ));
    }
    if effective > PROTOCOL_VERSION {
        return Compatibility::Incompatible(format!(
            "peer protocol v{effective} is above our current v{PROTOCOL_VERSION}"
        ));
    }
    if effective < PROTOCOL_VERSION {
        return Compatibility::Deprecated(format!("peer protocol v{effective} is deprecated"));
    }
    Compatibility::Compatible
}

// ---------------------------------------------------------------------------
// Text frame envelope
// ---------------------------------------------------------------------------

/// Error body carried by `error` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

/// The control-channel text frame envelope.
///
/// `id` is an opaque correlation token echoed back in responses.  Frames the
/// agent originates (telemetry, log batches, status pushes) carry a fresh
/// UUID id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    /// Build a response frame correlated to `id`.
    pub fn reply<T: Serialize>(id: &str, kind: &str, payload: &T) -> Self {
        Envelope {
            id: id.to_owned(),
            kind: kind.to_owned(),
            payload: serde_json::to_value(payload).ok(),
            error: None,
        }
    }

    /// Build a response frame with no payload (e.g. `pong`).
    pub fn reply_empty(id: &str, kind: &str) -> Self {
        Envelope {
            id: id.to_owned(),
            kind: kind.to_owned(),
            payload: None,
            error: None,
        }
    }

    /// Build an agent-originated event frame with a fresh id.
    pub fn event<T: Serialize>(kind: &str, payload: &T) -> Self {
        Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_owned(),
            payload: serde_json::to_value(payload).ok(),
            error: None,
        }
    }

    /// Build an error frame correlated to `id`.
    pub fn error(id: &str, code: i32, message: impl Into<String>) -> Self {
        Envelope {
            id: id.to_owned(),
            kind: "error".to_owned(),
            payload: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    /// Deserialize the payload into a typed struct, treating a missing
    /// payload as the type's `Default`.
    pub fn parse_payload<T: serde::de::DeserializeOwned + Default>(
        &self,
    ) -> Result<T, serde_json::Error> {
        match &self.payload {
            Some(v) => serde_json::from_value(v.clone()),
            None => Ok(T::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake / pairing payloads
// ---------------------------------------------------------------------------

/// Hub handshake (`hub_connected`, H→A).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubConnected {
    pub hub_id: String,
    pub name: String,
    pub version: String,
    pub platform: String,
    /// Empty when the Hub has never paired.
    pub token: String,
    /// 0 predates versioning and is treated as 1.
    pub protocol_version: u32,
}

/// Agent identity and toggles (`agent_status`, A→H, successful handshake).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub accept_connections: bool,
    pub telemetry_enabled: bool,
    pub telemetry_interval: u64,
    pub console_log_enabled: bool,
    pub protocol_version: u32,
}

/// `pairing_required` (A→H).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequired {
    pub code: String,
    pub expires_in: u64,
}

/// `pair_confirm` (H→A).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PairConfirm {
    pub code: String,
}

/// `pair_success` (A→H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSuccess {
    pub token: String,
}

/// `pair_failed` (A→H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairFailed {
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Info / config payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub version: String,
    pub accept_connections: bool,
}

/// `info_response` (A→H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub agent: AgentInfo,
}

/// `config_response` (A→H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub install_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteamUser {
    pub id: String,
}

/// `steam_users_response` (A→H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteamUsersResponse {
    pub users: Vec<SteamUser>,
}

// ---------------------------------------------------------------------------
// Upload payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadConfig {
    pub game_name: String,
    /// Executable filename as declared by the Hub; may carry backslashes.
    pub executable: String,
}

/// `init_upload` (H→A).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitUpload {
    pub config: UploadConfig,
    pub total_size: u64,
    pub files: Vec<String>,
}

/// `upload_init_response` (A→H).
///
/// `tcp_port`/`tcp_token` are omitted when the bulk endpoint failed to bind;
/// the control-channel chunk path is then the sole transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInitResponse {
    pub upload_id: String,
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_token: Option<String>,
}

/// `upload_chunk` (H→A, JSON path; `data` is base64).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadChunk {
    pub upload_id: String,
    pub file_path: String,
    pub offset: u64,
    pub data: String,
}

/// `upload_chunk_response` (A→H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub upload_id: String,
    pub bytes_written: u64,
    pub total_written: u64,
}

/// Shortcut creation config carried by `complete_upload`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShortcutConfig {
    pub name: String,
    /// Artwork type → URL.  Recognized types: grid, hero, logo, banner, icon.
    pub artwork: std::collections::BTreeMap<String, String>,
}

/// `complete_upload` (H→A).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompleteUpload {
    pub upload_id: String,
    pub create_shortcut: bool,
    pub shortcut: Option<ShortcutConfig>,
}

/// `cancel_upload` (H→A).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CancelUpload {
    pub upload_id: String,
}

/// `operation_result` (A→H).  Field population varies by operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam_restarted: Option<bool>,
}

// ---------------------------------------------------------------------------
// Game management payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutEntry {
    pub app_id: u32,
    pub name: String,
    pub exe: String,
    pub start_dir: String,
    pub launch_options: String,
    pub last_played: u64,
}

/// `shortcuts_response` (A→H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutsResponse {
    pub shortcuts: Vec<ShortcutEntry>,
}

/// `delete_game` (H→A).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteGame {
    pub app_id: u32,
}

/// `steam_response` (A→H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteamResponse {
    pub success: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Telemetry payloads
// ---------------------------------------------------------------------------

/// One telemetry sample (`telemetry_data` payload).
///
/// Sections are omitted entirely when no measurement in them succeeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySample {
    /// Unix millis.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<BatteryMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan: Option<FanMetrics>,
}

impl TelemetrySample {
    /// True when every section is absent.
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none()
            && self.gpu.is_none()
            && self.memory.is_none()
            && self.battery.is_none()
            && self.power.is_none()
            && self.fan.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_celsius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq_mhz: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_celsius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq_mhz: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_freq_mhz: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vram_total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vram_used_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryMetrics {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_free_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatteryMetrics {
    /// Charge percentage 0-100.
    pub capacity: i64,
    /// Kernel-reported status string, e.g. "Charging" or "Discharging".
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PowerMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tdp_watts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_watts: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanMetrics {
    pub rpm: i64,
}

/// `telemetry_status` (A→H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryStatus {
    pub enabled: bool,
    pub interval: u64,
}

// ---------------------------------------------------------------------------
// Console log payloads
// ---------------------------------------------------------------------------

/// One console or game log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogEntry {
    /// Unix millis.
    pub timestamp: i64,
    pub level: String,
    /// "console" or "game".
    pub source: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Value>>,
}

/// `console_log_data` (A→H).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLogData {
    pub entries: Vec<LogEntry>,
    /// Entries lost to ring overflow since the previous batch.
    pub dropped: u64,
}

/// `console_log_status` (A→H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleLogStatus {
    pub enabled: bool,
    pub level_mask: u32,
}

/// `set_console_log_filter` (H→A).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConsoleLogFilter {
    #[serde(default = "default_level_mask")]
    pub level_mask: u32,
}

fn default_level_mask() -> u32 {
    log_levels::DEFAULT_MASK
}

impl Default for SetConsoleLogFilter {
    fn default() -> Self {
        Self {
            level_mask: log_levels::DEFAULT_MASK,
        }
    }
}

/// `set_console_log_enabled` (H→A).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetConsoleLogEnabled {
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Artwork payloads
// ---------------------------------------------------------------------------

/// `artwork_image_response` (A→H, acknowledges a binary artwork frame).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtworkImageResponse {
    pub success: bool,
    pub artwork_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Binary frames
// ---------------------------------------------------------------------------

/// Raw binary-frame header as carried on the wire.
///
/// The presence of `type` discriminates artwork frames from the default
/// upload-chunk routing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BinaryHeader {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub upload_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    pub offset: u64,
    pub app_id: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub artwork_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_type: String,
}

/// A decoded binary frame, routed by header `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryFrame {
    /// Header `type == "artwork_image"`.
    ArtworkImage {
        id: String,
        app_id: u32,
        artwork_type: String,
        content_type: String,
        data: Vec<u8>,
    },
    /// Default routing: a file chunk for an active upload session.
    UploadChunk {
        id: String,
        upload_id: String,
        file_path: String,
        offset: u64,
        data: Vec<u8>,
    },
}

/// Binary frame decode failures.  These drop the frame; they never tear the
/// connection down.
#[derive(Debug)]
pub enum FrameError {
    /// Frame shorter than the 4-byte header-length prefix.
    Truncated,
    /// Declared header length exceeds the frame.
    HeaderIncomplete,
    /// Header JSON failed to parse.
    BadHeader(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "binary frame too short"),
            FrameError::HeaderIncomplete => write!(f, "binary frame header incomplete"),
            FrameError::BadHeader(s) => write!(f, "invalid binary header: {}", s),
        }
    }
}

impl std::error::Error for FrameError {}

/// Decode a binary frame: `[4B BE header_len][header JSON][payload]`.
pub fn decode_binary_frame(raw: &[u8]) -> Result<BinaryFrame, FrameError> {
    if raw.len() < 4 {
        return Err(FrameError::Truncated);
    }
    let header_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if raw.len() < 4 + header_len {
        return Err(FrameError::HeaderIncomplete);
    }
    let header: BinaryHeader = serde_json::from_slice(&raw[4..4 + header_len])
        .map_err(|e| FrameError::BadHeader(e.to_string()))?;
    let data = raw[4 + header_len..].to_vec();

    if header.kind.as_deref() == Some("artwork_image") {
        return Ok(BinaryFrame::ArtworkImage {
            id: header.id,
            app_id: header.app_id,
            artwork_type: header.artwork_type,
            content_type: header.content_type,
            data,
        });
    }
    Ok(BinaryFrame::UploadChunk {
        id: header.id,
        upload_id: header.upload_id,
        file_path: header.file_path,
        offset: header.offset,
        data,
    })
}

/// Encode a binary frame from a header and payload bytes.
pub fn encode_binary_frame(header: &BinaryHeader, data: &[u8]) -> Vec<u8> {
    let header_json = serde_json::to_vec(header).unwrap_or_else(|_| b"{}".to_vec());
    let mut out = Vec::with_capacity(4 + header_json.len() + data.len());
    out.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    out.extend_from_slice(&header_json);
    out.extend_from_slice(data);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
