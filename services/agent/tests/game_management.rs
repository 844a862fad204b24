//! Shortcut listing, registration back-fill, and game deletion.

mod common;

use common::{connect_authed, pair, start_agent, take_event_wait};
use serde_json::json;

async fn install_game(
    client: &mut cd_test_utils::HubClient,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    client
        .send_request(
            "init_upload",
            &json!({
                "config": { "gameName": name, "executable": "run.sh" },
                "totalSize": 0,
                "files": [],
            }),
        )
        .await?;
    let resp = client.recv_envelope().await?;
    let upload_id = resp.payload.unwrap()["uploadId"].as_str().unwrap().to_owned();
    client
        .send_request(
            "complete_upload",
            &json!({
                "uploadId": upload_id,
                "createShortcut": true,
                "shortcut": { "name": name, "artwork": {} },
            }),
        )
        .await?;
    client.recv_envelope().await?;
    Ok(())
}

#[tokio::test]
async fn list_register_delete_round_trip() {
    let agent = start_agent().await;
    let token = pair(&agent).await;
    let (mut client, _) = connect_authed(&agent, &token).await;

    install_game(&mut client, "Celeste").await.unwrap();
    let game_dir = agent.install_root.path().join("Celeste");
    assert!(game_dir.exists());

    // Freshly created shortcuts list with app id 0.
    client.send_request("list_shortcuts", &json!({})).await.unwrap();
    let resp = client.recv_envelope().await.unwrap();
    assert_eq!(resp.kind, "shortcuts_response");
    let shortcuts = resp.payload.unwrap()["shortcuts"].clone();
    assert_eq!(shortcuts.as_array().unwrap().len(), 1);
    assert_eq!(shortcuts[0]["name"], "Celeste");
    assert_eq!(shortcuts[0]["appId"], 0);

    // The UI surface registers the id the client assigned.
    agent.state.register_shortcut("Celeste", 0x8000_1234).await;
    client.send_request("list_shortcuts", &json!({})).await.unwrap();
    let resp = client.recv_envelope().await.unwrap();
    let shortcuts = resp.payload.unwrap()["shortcuts"].clone();
    assert_eq!(shortcuts[0]["appId"], 0x8000_1234u32 as u64);

    // Unknown app ids 404.
    client
        .send_request("delete_game", &json!({"appId": 1}))
        .await
        .unwrap();
    let resp = client.recv_envelope().await.unwrap();
    assert_eq!(resp.error.unwrap().code, 404);

    client
        .send_request("delete_game", &json!({"appId": 0x8000_1234u32}))
        .await
        .unwrap();
    let resp = client.recv_envelope().await.unwrap();
    assert_eq!(resp.kind, "operation_result");
    let payload = resp.payload.unwrap();
    assert_eq!(payload["status"], "deleted");
    assert_eq!(payload["gameName"], "Celeste");
    assert_eq!(payload["steamRestarted"], false);

    assert!(!game_dir.exists(), "install directory must be removed");
    assert!(agent.state.tracked_shortcuts().await.is_empty());

    let removal = take_event_wait(&agent, "remove_shortcut").await;
    assert_eq!(removal.data["appId"], 0x8000_1234u32 as u64);
}
