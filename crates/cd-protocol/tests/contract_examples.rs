//! Contract golden tests: each literal frame below is a capture of what the
//! Hub actually puts on the wire.  Deserialize to the typed payload, serialize
//! back, and verify the JSON is structurally identical — field renames and
//! skip rules must not drift.

use cd_protocol::{
    AgentStatus, CompleteUpload, ConsoleLogData, Envelope, HubConnected, InitUpload, UploadChunk,
};

/// Deserialize an envelope, re-serialize it, and assert structural equality.
fn round_trip(json_text: &str) -> Envelope {
    let env: Envelope = serde_json::from_str(json_text).expect("deserialize envelope");
    let serialized = serde_json::to_string(&env).expect("serialize envelope");
    let original: serde_json::Value = serde_json::from_str(json_text).unwrap();
    let roundtripped: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(original, roundtripped, "round-trip mismatch");
    env
}

#[test]
fn hub_connected_round_trip() {
    let env = round_trip(
        r#"{"id":"msg-1","type":"hub_connected","payload":{"hubId":"hub-a1","name":"Desk Hub","version":"0.4.2","platform":"windows","token":"tok","protocolVersion":1}}"#,
    );
    assert_eq!(env.kind, "hub_connected");
    let p: HubConnected = env.parse_payload().unwrap();
    assert_eq!(p.hub_id, "hub-a1");
    assert_eq!(p.protocol_version, 1);
}

#[test]
fn hub_connected_first_contact_has_no_token() {
    let env = round_trip(
        r#"{"id":"msg-1","type":"hub_connected","payload":{"hubId":"hub-a1","name":"Desk Hub","version":"0.4.2","platform":"linux","protocolVersion":1}}"#,
    );
    let p: HubConnected = env.parse_payload().unwrap();
    assert!(p.token.is_empty());
}

#[test]
fn agent_status_wire_shape() {
    let status = AgentStatus {
        name: "Steam Deck".to_owned(),
        version: "0.3.0".to_owned(),
        platform: "linux".to_owned(),
        accept_connections: true,
        telemetry_enabled: false,
        telemetry_interval: 2,
        console_log_enabled: false,
        protocol_version: 1,
    };
    let env = Envelope::reply("msg-1", "agent_status", &status);
    let v = serde_json::to_value(&env).unwrap();
    assert_eq!(v["payload"]["acceptConnections"], true);
    assert_eq!(v["payload"]["telemetryInterval"], 2);
    assert_eq!(v["payload"]["protocolVersion"], 1);
}

#[test]
fn init_upload_round_trip() {
    let env = round_trip(
        r#"{"id":"up-1","type":"init_upload","payload":{"config":{"gameName":"Celeste","executable":"Celeste.exe"},"totalSize":1234567,"files":["Celeste.exe","Content/pack.bin"]}}"#,
    );
    let p: InitUpload = env.parse_payload().unwrap();
    assert_eq!(p.config.game_name, "Celeste");
    assert_eq!(p.total_size, 1_234_567);
    assert_eq!(p.files.len(), 2);
}

#[test]
fn upload_chunk_round_trip() {
    let env = round_trip(
        r#"{"id":"c-9","type":"upload_chunk","payload":{"uploadId":"upload-1700000000-4242","filePath":"Content/pack.bin","offset":1048576,"data":"aGVsbG8="}}"#,
    );
    let p: UploadChunk = env.parse_payload().unwrap();
    assert_eq!(p.offset, 1_048_576);
    assert_eq!(p.data, "aGVsbG8=");
}

#[test]
fn complete_upload_round_trip() {
    let env = round_trip(
        r#"{"id":"done","type":"complete_upload","payload":{"uploadId":"upload-1700000000-4242","createShortcut":true,"shortcut":{"name":"Celeste","artwork":{"grid":"https://cdn.example/grid.png","hero":"https://cdn.example/hero.jpg"}}}}"#,
    );
    let p: CompleteUpload = env.parse_payload().unwrap();
    assert!(p.create_shortcut);
    let shortcut = p.shortcut.unwrap();
    assert_eq!(shortcut.name, "Celeste");
    assert_eq!(shortcut.artwork.len(), 2);
}

#[test]
fn console_log_data_round_trip() {
    let env = round_trip(
        r#"{"id":"b1","type":"console_log_data","payload":{"entries":[{"timestamp":1700000000123,"level":"warn","source":"console","text":"deprecated API","url":"https://steamloopback.host/x.js","line":42}],"dropped":3}}"#,
    );
    let p: ConsoleLogData = env.parse_payload().unwrap();
    assert_eq!(p.dropped, 3);
    assert_eq!(p.entries[0].level, "warn");
    assert_eq!(p.entries[0].line, Some(42));
}

#[test]
fn ping_frame_has_no_payload() {
    let env = round_trip(r#"{"id":"p1","type":"ping"}"#);
    assert_eq!(env.kind, "ping");
    assert!(env.payload.is_none());
    let pong = Envelope::reply_empty(&env.id, "pong");
    let v = serde_json::to_value(&pong).unwrap();
    assert!(v.get("payload").is_none());
}

#[test]
fn error_frame_round_trip() {
    let env = round_trip(
        r#"{"id":"x","type":"error","error":{"code":429,"message":"Pairing locked out. Try again in 299s"}}"#,
    );
    assert_eq!(env.error.as_ref().unwrap().code, 429);
}
