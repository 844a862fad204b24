//! Binary frame routing: upload chunks and in-band artwork.

mod common;

use cd_protocol::BinaryHeader;
use common::{connect_authed, pair, start_agent, take_event_wait};
use serde_json::json;

/// A binary frame with no `type` is an upload chunk.
#[tokio::test]
async fn binary_chunk_writes_like_json_chunk() {
    let agent = start_agent().await;
    let token = pair(&agent).await;
    let (mut client, _) = connect_authed(&agent, &token).await;

    client
        .send_request(
            "init_upload",
            &json!({
                "config": { "gameName": "Bin", "executable": "b.exe" },
                "totalSize": 4,
                "files": ["b.exe"],
            }),
        )
        .await
        .unwrap();
    let resp = client.recv_envelope().await.unwrap();
    let upload_id = resp.payload.unwrap()["uploadId"].as_str().unwrap().to_owned();

    let header = BinaryHeader {
        id: "bin-1".to_owned(),
        upload_id: upload_id.clone(),
        file_path: "b.exe".to_owned(),
        offset: 0,
        ..Default::default()
    };
    client.send_binary(&header, b"data").await.unwrap();

    let resp = client.recv_envelope().await.unwrap();
    assert_eq!(resp.kind, "upload_chunk_response");
    assert_eq!(resp.id, "bin-1");
    let payload = resp.payload.unwrap();
    assert_eq!(payload["bytesWritten"], 4);
    assert_eq!(payload["totalWritten"], 4);

    let file = agent.install_root.path().join("Bin").join("b.exe");
    assert_eq!(std::fs::read(&file).unwrap(), b"data");
}

/// Artwork frames with `appId == 0` are cached and merged into the
/// shortcut-creation payload.
#[tokio::test]
async fn pending_artwork_merges_into_create_shortcut() {
    let agent = start_agent().await;
    let token = pair(&agent).await;
    let (mut client, _) = connect_authed(&agent, &token).await;

    client
        .send_request(
            "init_upload",
            &json!({
                "config": { "gameName": "Arty", "executable": "a.exe" },
                "totalSize": 0,
                "files": [],
            }),
        )
        .await
        .unwrap();
    let resp = client.recv_envelope().await.unwrap();
    let upload_id = resp.payload.unwrap()["uploadId"].as_str().unwrap().to_owned();

    let header = BinaryHeader {
        kind: Some("artwork_image".to_owned()),
        id: "art-1".to_owned(),
        app_id: 0,
        artwork_type: "grid".to_owned(),
        content_type: "image/png".to_owned(),
        ..Default::default()
    };
    client.send_binary(&header, b"\x89PNGfake").await.unwrap();

    let resp = client.recv_envelope().await.unwrap();
    assert_eq!(resp.kind, "artwork_image_response");
    assert_eq!(resp.id, "art-1");
    let payload = resp.payload.unwrap();
    assert_eq!(payload["success"], true);
    assert_eq!(payload["artworkType"], "grid");

    client
        .send_request(
            "complete_upload",
            &json!({
                "uploadId": upload_id,
                "createShortcut": true,
                "shortcut": { "name": "Arty", "artwork": {} },
            }),
        )
        .await
        .unwrap();
    let result = client.recv_envelope().await.unwrap();
    assert_eq!(result.payload.unwrap()["success"], true);

    let shortcut = take_event_wait(&agent, "create_shortcut").await;
    assert_eq!(shortcut.data["name"], "Arty");
    assert_eq!(shortcut.data["artwork"]["grid"]["format"], "png");
    assert!(
        shortcut.data["artwork"]["grid"]["data"]
            .as_str()
            .unwrap()
            .len()
            > 0
    );
    assert!(
        shortcut.data["startDir"]
            .as_str()
            .unwrap()
            .starts_with('"'),
        "start dir is quoted"
    );

    // The shortcut is tracked with app id 0 until registration.
    let tracked = agent.state.tracked_shortcuts().await;
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].app_id, 0);
    assert_eq!(tracked[0].game_name, "Arty");
}

/// Garbage binary frames are dropped without killing the session.
#[tokio::test]
async fn malformed_binary_frame_is_dropped() {
    let agent = start_agent().await;
    let token = pair(&agent).await;
    let (mut client, _) = connect_authed(&agent, &token).await;

    // Header length promises more bytes than the frame holds.
    client.send_raw_binary(&[0, 0, 0, 200, b'{']).await.unwrap();

    let id = client.send_request("ping", &json!({})).await.unwrap();
    let pong = client.recv_envelope().await.unwrap();
    assert_eq!((pong.kind.as_str(), pong.id), ("pong", id));
}
