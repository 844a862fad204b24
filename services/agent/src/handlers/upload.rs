//! Upload, binary transfer, and artwork handlers.
//!
//! The coordinator owns upload sessions across both transports: the framed
//! control-channel chunk path and the ephemeral bulk TCP channel.  Progress
//! toward the frontend is throttled to >= 2 % delta or >= 500 ms.

use crate::artwork::{self, ArtworkData};
use crate::data_channel::DataChannelServer;
use crate::server::{AgentState, ConnState};
use crate::steam;
use crate::uploads::{
    DataChannelHandle, TrackedShortcut, UploadSession, UploadStatus, new_upload_id,
    validate_relative_path,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cd_protocol::{
    ArtworkImageResponse, BinaryFrame, CHUNK_SIZE, CompleteUpload, Envelope, InitUpload,
    OperationResult, UploadChunk, UploadChunkResponse, UploadInitResponse, decode_binary_frame,
    error_codes,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

const PROGRESS_MIN_DELTA_PCT: f64 = 2.0;
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// `init_upload`: create the session, bring up the bulk endpoint, respond
/// with the transport parameters.
pub async fn init_upload(conn: &mut ConnState, state: &Arc<AgentState>, env: &Envelope) {
    let p: InitUpload = match env.parse_payload() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed init_upload payload");
            conn.outbound
                .send_error(&env.id, error_codes::BAD_REQUEST, "invalid payload")
                .await;
            return;
        }
    };
    let game_name = p.config.game_name;

    if let Err(e) = validate_relative_path(&game_name) {
        conn.outbound
            .send_error(
                &env.id,
                error_codes::BAD_REQUEST,
                format!("invalid game name: {e}"),
            )
            .await;
        return;
    }

    let upload_id = new_upload_id();
    let install_root = steam::expand_path(&state.install_path().await);
    let install_dir = install_root.join(&game_name);
    if let Err(e) = tokio::fs::create_dir_all(&install_dir).await {
        error!(path = %install_dir.display(), error = %e, "failed to create install directory");
        conn.outbound
            .send_error(
                &env.id,
                error_codes::BAD_REQUEST,
                "failed to create install directory",
            )
            .await;
        return;
    }

    let mut session = UploadSession::new(upload_id.clone(), game_name.clone(), p.total_size, p.files);
    session.install_dir = install_dir.clone();
    session.executable = p.config.executable;

    info!(
        game = %game_name,
        total_size = p.total_size,
        dir = %install_dir.display(),
        "upload started"
    );

    // Bring the bulk endpoint up before responding so the response carries
    // its port and token.  A bind failure leaves the control-channel chunk
    // path as the sole transport.
    let channel = match DataChannelServer::bind().await {
        Ok(ch) => Some(ch),
        Err(e) => {
            warn!(error = %e, "failed to start data channel");
            None
        }
    };

    let response = UploadInitResponse {
        upload_id: upload_id.clone(),
        chunk_size: CHUNK_SIZE,
        tcp_port: channel.as_ref().map(DataChannelServer::port),
        tcp_token: channel.as_ref().map(|ch| ch.token().to_owned()),
    };
    conn.outbound
        .send_reply(&env.id, "upload_init_response", &response)
        .await;

    if let Some(channel) = channel {
        session.channel = Some(spawn_bulk_receiver(state, &session, channel));
    }
    conn.uploads.insert(upload_id, session);

    state
        .bridge
        .notify(
            "operation_event",
            json!({
                "type": "install",
                "status": "start",
                "gameName": game_name,
                "progress": 0,
            }),
        )
        .await;
}

/// Run the bulk endpoint's accept loop in the background, with a throttled
/// progress pump toward the frontend.
fn spawn_bulk_receiver(
    state: &Arc<AgentState>,
    session: &UploadSession,
    channel: DataChannelServer,
) -> DataChannelHandle {
    let port = channel.port();
    let token = channel.token().to_owned();
    let cancel = channel.cancel_flag();

    let upload_id = session.id.clone();
    let total_size = session.total_size;
    let install_dir = session.install_dir.clone();
    let transferred = session.transferred_counter();
    let bridge = state.bridge.clone();

    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<(u64, String)>();

    // Throttle pump: drains raw per-read progress into frontend slot events.
    {
        let upload_id = upload_id.clone();
        tokio::spawn(async move {
            let mut last_pct = 0.0_f64;
            let mut last_at = Instant::now();
            while let Some((total, file)) = progress_rx.recv().await {
                transferred.store(total, std::sync::atomic::Ordering::SeqCst);
                let pct = if total_size == 0 {
                    100.0
                } else {
                    total as f64 / total_size as f64 * 100.0
                };
                let now = Instant::now();
                if pct >= 100.0
                    || pct - last_pct >= PROGRESS_MIN_DELTA_PCT
                    || now.duration_since(last_at) >= PROGRESS_MIN_INTERVAL
                {
                    last_pct = pct;
                    last_at = now;
                    bridge
                        .notify(
                            "upload_progress",
                            json!({
                                "uploadId": upload_id,
                                "transferredBytes": total,
                                "totalBytes": total_size,
                                "currentFile": file,
                                "percentage": pct,
                            }),
                        )
                        .await;
                }
            }
        });
    }

    let accept_task = {
        let upload_id = upload_id.clone();
        tokio::spawn(async move {
            let result = channel
                .accept_and_receive(install_dir, move |total, file| {
                    let _ = progress_tx.send((total, file.to_owned()));
                })
                .await;
            match result {
                Ok(total) => info!(upload_id = %upload_id, total, "data channel transfer complete"),
                Err(e) => warn!(upload_id = %upload_id, error = %e, "data channel transfer failed"),
            }
        })
    };

    DataChannelHandle::new(port, token, cancel, accept_task)
}

/// `upload_chunk` (JSON path; `data` is base64).
pub async fn upload_chunk(conn: &mut ConnState, state: &Arc<AgentState>, env: &Envelope) {
    let p: UploadChunk = match env.parse_payload() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed upload_chunk payload");
            conn.outbound
                .send_error(&env.id, error_codes::BAD_REQUEST, "invalid payload")
                .await;
            return;
        }
    };
    let data = match BASE64.decode(&p.data) {
        Ok(d) => d,
        Err(e) => {
            conn.outbound
                .send_error(
                    &env.id,
                    error_codes::BAD_REQUEST,
                    format!("invalid chunk encoding: {e}"),
                )
                .await;
            return;
        }
    };
    write_chunk(conn, state, &env.id, &p.upload_id, &p.file_path, p.offset, &data).await;
}

/// Shared by the JSON and binary chunk paths.
async fn write_chunk(
    conn: &mut ConnState,
    state: &Arc<AgentState>,
    msg_id: &str,
    upload_id: &str,
    file_path: &str,
    offset: u64,
    data: &[u8],
) {
    let outbound = conn.outbound.clone();
    let Some(session) = conn.uploads.get_mut(upload_id) else {
        outbound
            .send_error(msg_id, error_codes::NOT_FOUND, "Upload not found")
            .await;
        return;
    };

    if let Err(e) = validate_relative_path(file_path) {
        outbound
            .send_error(
                msg_id,
                error_codes::BAD_REQUEST,
                format!("invalid file path: {e}"),
            )
            .await;
        return;
    }

    let full_path = session.install_dir.join(file_path);
    if let Some(parent) = full_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!(error = %e, "failed to create chunk parent directory");
            return;
        }
    }

    // offset == 0 starts the file over; anything else appends in arrival
    // order (the Hub writes sequentially).
    let write_result = async {
        let mut file = if offset == 0 {
            tokio::fs::File::create(&full_path).await?
        } else {
            tokio::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&full_path)
                .await?
        };
        file.write_all(data).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = write_result {
        error!(path = %full_path.display(), error = %e, "chunk write failed");
        return;
    }

    let total_written = session.add_transferred(data.len() as u64);
    session.current_file = Some(file_path.to_owned());
    let progress = session.progress();
    let total_size = session.total_size;

    state
        .bridge
        .notify(
            "upload_progress",
            json!({
                "uploadId": upload_id,
                "transferredBytes": total_written,
                "totalBytes": total_size,
                "currentFile": file_path,
                "percentage": progress,
            }),
        )
        .await;

    outbound
        .send_reply(
            msg_id,
            "upload_chunk_response",
            &UploadChunkResponse {
                upload_id: upload_id.to_owned(),
                bytes_written: data.len() as u64,
                total_written,
            },
        )
        .await;
}

/// `complete_upload`: finalize the install, optionally assemble the
/// shortcut-creation payload.
pub async fn complete_upload(conn: &mut ConnState, state: &Arc<AgentState>, env: &Envelope) {
    let p: CompleteUpload = env.parse_payload().unwrap_or_default();

    let Some(mut session) = conn.uploads.remove(&p.upload_id) else {
        conn.outbound
            .send_error(&env.id, error_codes::NOT_FOUND, "Upload not found")
            .await;
        return;
    };
    session.stop_channel();
    session.status = UploadStatus::Complete;
    info!(game = %session.game_name, "upload complete");

    // Hand the tree to the desktop user and make the executable runnable.
    let install_dir = session.install_dir.clone();
    {
        let dir = install_dir.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || steam::fix_permissions(&dir)).await {
            error!(error = %e, "permission fix task failed");
        }
    }
    let exe_name = basename(&session.executable.replace('\\', "/"));
    let exe_path = install_dir.join(&exe_name);
    if !exe_name.is_empty() && exe_path.exists() {
        set_executable(&exe_path);
    }

    let result = OperationResult {
        success: Some(true),
        path: Some(install_dir.to_string_lossy().into_owned()),
        ..Default::default()
    };

    if p.create_shortcut {
        let shortcut = p.shortcut.unwrap_or_default();
        let shortcut_name = if shortcut.name.is_empty() {
            session.game_name.clone()
        } else {
            shortcut.name.clone()
        };
        let quoted_start_dir = format!("\"{}\"", install_dir.display());

        let mut artwork_data = if shortcut.artwork.is_empty() {
            Default::default()
        } else {
            artwork::download_artwork(&shortcut.artwork).await
        };
        // Merge artwork received in-band before completion.
        if !conn.pending_artwork.is_empty() {
            info!(
                count = conn.pending_artwork.len(),
                "merging pending local artwork"
            );
            artwork_data.append(&mut conn.pending_artwork);
        }
        let icon_url = shortcut.artwork.get("icon").cloned().unwrap_or_default();

        state
            .bridge
            .notify(
                "create_shortcut",
                json!({
                    "name": shortcut_name,
                    "exe": exe_path.to_string_lossy(),
                    "startDir": quoted_start_dir,
                    "artwork": artwork_data,
                    "iconUrl": icon_url,
                }),
            )
            .await;

        let mut tracked = state.tracked_shortcuts().await;
        tracked.push(TrackedShortcut {
            name: shortcut_name,
            exe: exe_path.to_string_lossy().into_owned(),
            start_dir: install_dir.to_string_lossy().into_owned(),
            app_id: 0,
            game_name: session.game_name.clone(),
            installed_at: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        });
        state.set_tracked_shortcuts(&tracked).await;
    }

    state
        .bridge
        .notify(
            "operation_event",
            json!({
                "type": "install",
                "status": "complete",
                "gameName": session.game_name,
                "progress": 100,
            }),
        )
        .await;

    conn.outbound
        .send_reply(&env.id, "operation_result", &result)
        .await;
}

/// `cancel_upload`: best-effort removal of the partial install.
pub async fn cancel_upload(conn: &mut ConnState, env: &Envelope) {
    let p: cd_protocol::CancelUpload = env.parse_payload().unwrap_or_default();

    if let Some(mut session) = conn.uploads.remove(&p.upload_id) {
        session.stop_channel();
        session.status = UploadStatus::Cancelled;
        if session.install_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&session.install_dir).await {
                error!(error = %e, "failed to clean up cancelled upload");
            }
        }
        info!(game = %session.game_name, "upload cancelled");
    }

    conn.outbound
        .send_reply(
            &env.id,
            "operation_result",
            &OperationResult {
                success: Some(true),
                ..Default::default()
            },
        )
        .await;
}

/// Disconnect cleanup: delete the install directories of uploads that never
/// completed.
pub async fn cleanup_orphaned_uploads(conn: &mut ConnState) {
    let orphaned: Vec<String> = conn
        .uploads
        .iter()
        .filter(|(_, s)| s.status == UploadStatus::Active)
        .map(|(id, _)| id.clone())
        .collect();

    for upload_id in &orphaned {
        if let Some(mut session) = conn.uploads.remove(upload_id) {
            warn!(game = %session.game_name, "cleaning orphaned upload");
            session.stop_channel();
            if session.install_dir.exists() {
                match tokio::fs::remove_dir_all(&session.install_dir).await {
                    Ok(()) => info!(path = %session.install_dir.display(), "orphaned folder removed"),
                    Err(e) => error!(error = %e, "failed to clean up orphaned upload"),
                }
            }
        }
    }
    if !orphaned.is_empty() {
        info!(count = orphaned.len(), "orphaned uploads cleaned");
    }
}

// ---------------------------------------------------------------------------
// Binary frames
// ---------------------------------------------------------------------------

/// Route a binary frame: artwork by header type, upload chunk otherwise.
/// Parse failures drop the frame.
pub async fn handle_binary(conn: &mut ConnState, state: &Arc<AgentState>, raw: &[u8]) {
    match decode_binary_frame(raw) {
        Ok(BinaryFrame::ArtworkImage {
            id,
            app_id,
            artwork_type,
            content_type,
            data,
        }) => {
            binary_artwork(conn, state, &id, app_id, &artwork_type, &content_type, data).await;
        }
        Ok(BinaryFrame::UploadChunk {
            id,
            upload_id,
            file_path,
            offset,
            data,
        }) => {
            info!(
                upload_id = %upload_id,
                file_path = %file_path,
                offset,
                size = data.len(),
                "binary chunk"
            );
            write_chunk(conn, state, &id, &upload_id, &file_path, offset, &data).await;
        }
        Err(e) => error!(error = %e, "binary frame dropped"),
    }
}

/// `artwork_image` frames.
///
/// `app_id == 0` means the shortcut does not exist yet: cache the bytes for
/// the `create_shortcut` merge.  Otherwise write straight to the grid
/// directory and tell the UI surface to apply it live.
async fn binary_artwork(
    conn: &mut ConnState,
    state: &Arc<AgentState>,
    msg_id: &str,
    app_id: u32,
    artwork_type: &str,
    content_type: &str,
    data: Vec<u8>,
) {
    info!(
        app_id,
        artwork_type,
        content_type,
        size = data.len(),
        "artwork image"
    );
    let format = if content_type.contains("jpeg") || content_type.contains("jpg") {
        "jpg"
    } else {
        "png"
    };

    if app_id == 0 {
        conn.pending_artwork.insert(
            artwork_type.to_owned(),
            ArtworkData {
                data: BASE64.encode(&data),
                format: format.to_owned(),
            },
        );
        info!(artwork_type, bytes = data.len(), "pending artwork stored");
        conn.outbound
            .send_reply(
                msg_id,
                "artwork_image_response",
                &ArtworkImageResponse {
                    success: true,
                    artwork_type: artwork_type.to_owned(),
                    error: None,
                },
            )
            .await;
        return;
    }

    let applied = {
        let artwork_type = artwork_type.to_owned();
        let content_type = content_type.to_owned();
        let bytes = data.clone();
        tokio::task::spawn_blocking(move || {
            artwork::apply_from_data(app_id, &artwork_type, &bytes, &content_type)
        })
        .await
    };

    match applied {
        Ok(Ok(_path)) => {
            state
                .bridge
                .notify(
                    "update_artwork",
                    json!({
                        "appId": app_id,
                        "artworkType": artwork_type,
                        "data": BASE64.encode(&data),
                        "format": format,
                    }),
                )
                .await;
            conn.outbound
                .send_reply(
                    msg_id,
                    "artwork_image_response",
                    &ArtworkImageResponse {
                        success: true,
                        artwork_type: artwork_type.to_owned(),
                        error: None,
                    },
                )
                .await;
        }
        Ok(Err(e)) => {
            error!(error = %e, "failed to apply artwork");
            conn.outbound
                .send_reply(
                    msg_id,
                    "artwork_image_response",
                    &ArtworkImageResponse {
                        success: false,
                        artwork_type: artwork_type.to_owned(),
                        error: Some(e.to_string()),
                    },
                )
                .await;
        }
        Err(e) => error!(error = %e, "artwork task failed"),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn set_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)) {
        error!(path = %path.display(), error = %e, "failed to chmod executable");
    }
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_handles_windows_separators() {
        assert_eq!(basename(&"bin\\game.exe".replace('\\', "/")), "game.exe");
        assert_eq!(basename("game.exe"), "game.exe");
        assert_eq!(basename("a/b/c.bin"), "c.bin");
        assert_eq!(basename(""), "");
    }
}
