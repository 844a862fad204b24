//! Artwork download and shortcut icon management.
//!
//! Artwork reaches the agent three ways: URLs in the shortcut config,
//! in-band binary frames, and an icon URL applied after shortcut creation.
//! Everything lands in the Steam grid directory under the grid naming
//! convention; icon application additionally patches the shortcuts catalog,
//! with retry because the client does not flush new entries synchronously.

use crate::steam;
use crate::vdf;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const MAX_ICON_RETRIES: u32 = 5;
const ICON_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = concat!("CapyDeploy/", env!("CARGO_PKG_VERSION"));

/// Grid filename suffix per artwork type.
fn artwork_suffix(artwork_type: &str) -> Option<&'static str> {
    match artwork_type {
        "grid" => Some("p"),
        "banner" => Some(""),
        "hero" => Some("_hero"),
        "logo" => Some("_logo"),
        "icon" => Some("_icon"),
        _ => None,
    }
}

/// File extension for a Content-Type.
fn ext_for_content_type(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Extensions that may linger from earlier writes of the same artwork slot.
const STALE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "ico"];

#[derive(Debug, Error)]
pub enum ArtworkError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("unknown artwork type: {0}")]
    UnknownArtworkType(String),
    #[error("Steam directory not found")]
    SteamDirNotFound,
    #[error("no Steam users found")]
    NoSteamUsers,
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Artwork bytes held for a shortcut that does not exist yet, and the shape
/// handed to the frontend in `create_shortcut` / `update_artwork` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtworkData {
    /// Base64-encoded image bytes.
    pub data: String,
    /// "png" or "jpg" (webp is mapped to png for downstream compatibility).
    pub format: String,
}

/// Derive the downstream format tag from Content-Type and URL.
fn detect_format(content_type: &str, url: &str) -> &'static str {
    if content_type.contains("jpeg") || content_type.contains("jpg") || url.ends_with(".jpg") {
        "jpg"
    } else {
        // webp deliberately reports png: the client's artwork API accepts the
        // bytes but rejects the webp tag.
        "png"
    }
}

/// Download shortcut artwork URLs ({grid, hero, logo, banner}) into
/// base64 payloads.  Failed downloads are logged and skipped.
pub async fn download_artwork(
    artwork: &BTreeMap<String, String>,
) -> BTreeMap<String, ArtworkData> {
    let client = match reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build artwork HTTP client");
            return BTreeMap::new();
        }
    };

    let mut result = BTreeMap::new();
    for key in ["grid", "hero", "logo", "banner"] {
        let Some(url) = artwork.get(key).filter(|u| !u.is_empty()) else {
            continue;
        };
        match fetch(&client, url).await {
            Ok((bytes, content_type)) => {
                let format = detect_format(&content_type, url);
                info!(key, bytes = bytes.len(), format, "artwork downloaded");
                result.insert(
                    key.to_owned(),
                    ArtworkData {
                        data: BASE64.encode(&bytes),
                        format: format.to_owned(),
                    },
                );
            }
            Err(e) => error!(key, url = %url, error = %e, "artwork download failed"),
        }
    }
    result
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<(Vec<u8>, String), reqwest::Error> {
    let resp = client.get(url).send().await?.error_for_status()?;
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();
    let bytes = resp.bytes().await?;
    Ok((bytes.to_vec(), content_type))
}

// ---------------------------------------------------------------------------
// Grid directory writes
// ---------------------------------------------------------------------------

/// Write raw artwork bytes into a user's grid directory.
///
/// Removes stale siblings with other extensions first so the client never
/// resolves an outdated file.  Returns the written path.
pub fn apply_from_data_in(
    steam_dir: &Path,
    user_id: &str,
    app_id: u32,
    artwork_type: &str,
    data: &[u8],
    content_type: &str,
) -> Result<PathBuf, ArtworkError> {
    let ext = ext_for_content_type(content_type)
        .ok_or_else(|| ArtworkError::UnsupportedContentType(content_type.to_owned()))?;
    let suffix = artwork_suffix(artwork_type)
        .ok_or_else(|| ArtworkError::UnknownArtworkType(artwork_type.to_owned()))?;

    let grid_dir = grid_dir(steam_dir, user_id);
    std::fs::create_dir_all(&grid_dir)?;

    let base = format!("{app_id}{suffix}");
    remove_stale(&grid_dir, &base);

    let dest = grid_dir.join(format!("{base}.{ext}"));
    std::fs::write(&dest, data)?;
    info!(artwork_type, path = %dest.display(), bytes = data.len(), "artwork applied");
    Ok(dest)
}

/// [`apply_from_data_in`] against the discovered Steam install.
pub fn apply_from_data(
    app_id: u32,
    artwork_type: &str,
    data: &[u8],
    content_type: &str,
) -> Result<PathBuf, ArtworkError> {
    let (steam_dir, user_id) = resolve_steam_user()?;
    apply_from_data_in(&steam_dir, &user_id, app_id, artwork_type, data, content_type)
}

fn grid_dir(steam_dir: &Path, user_id: &str) -> PathBuf {
    steam_dir
        .join("userdata")
        .join(user_id)
        .join("config")
        .join("grid")
}

fn remove_stale(grid_dir: &Path, base: &str) {
    for ext in STALE_EXTENSIONS {
        let _ = std::fs::remove_file(grid_dir.join(format!("{base}.{ext}")));
    }
}

fn resolve_steam_user() -> Result<(PathBuf, String), ArtworkError> {
    let steam_dir = steam::steam_dir().ok_or(ArtworkError::SteamDirNotFound)?;
    let users = steam::steam_users_in(&steam_dir);
    let user = users.first().ok_or(ArtworkError::NoSteamUsers)?;
    Ok((steam_dir, user.id.clone()))
}

// ---------------------------------------------------------------------------
// Icon application (catalog patch with retry)
// ---------------------------------------------------------------------------

/// Save a base64 icon into the grid directory and patch the catalog.
///
/// Returns false when the catalog could not be patched; the icon file is
/// still on disk and the client picks it up on next restart.
pub async fn set_shortcut_icon(app_id: u32, icon_b64: &str, icon_format: &str) -> bool {
    let Ok((steam_dir, user_id)) = resolve_steam_user().map_err(|e| error!(error = %e)) else {
        return false;
    };
    set_shortcut_icon_in(&steam_dir, &user_id, app_id, icon_b64, icon_format).await
}

pub async fn set_shortcut_icon_in(
    steam_dir: &Path,
    user_id: &str,
    app_id: u32,
    icon_b64: &str,
    icon_format: &str,
) -> bool {
    let ext = if icon_format == "jpg" { "jpg" } else { "png" };
    let grid = grid_dir(steam_dir, user_id);
    if let Err(e) = std::fs::create_dir_all(&grid) {
        error!(error = %e, "failed to create grid directory");
        return false;
    }
    let icon_path = grid.join(format!("{app_id}_icon.{ext}"));

    let data = match BASE64.decode(icon_b64) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "invalid icon base64");
            return false;
        }
    };
    if let Err(e) = std::fs::write(&icon_path, &data) {
        error!(error = %e, "failed to save icon file");
        return false;
    }
    info!(path = %icon_path.display(), bytes = data.len(), "icon saved");

    let vdf_path = shortcuts_vdf_path(steam_dir, user_id);
    update_vdf_icon(&vdf_path, app_id, &icon_path).await
}

/// Download an icon URL straight into the grid directory (keeping the URL's
/// extension) and patch the catalog.
pub async fn set_shortcut_icon_from_url(app_id: u32, icon_url: &str) -> bool {
    let Ok((steam_dir, user_id)) = resolve_steam_user().map_err(|e| error!(error = %e)) else {
        return false;
    };

    let ext = url_extension(icon_url).unwrap_or_else(|| ".png".to_owned());
    let grid = grid_dir(&steam_dir, &user_id);
    if let Err(e) = std::fs::create_dir_all(&grid) {
        error!(error = %e, "failed to create grid directory");
        return false;
    }
    let icon_path = grid.join(format!("{app_id}_icon{ext}"));

    let client = match reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build icon HTTP client");
            return false;
        }
    };
    match fetch(&client, icon_url).await {
        Ok((bytes, _)) => {
            if let Err(e) = std::fs::write(&icon_path, &bytes) {
                error!(error = %e, "failed to write icon file");
                return false;
            }
            info!(path = %icon_path.display(), bytes = bytes.len(), "icon downloaded");
        }
        Err(e) => {
            error!(url = icon_url, error = %e, "icon download failed");
            return false;
        }
    }

    let vdf_path = shortcuts_vdf_path(&steam_dir, &user_id);
    update_vdf_icon(&vdf_path, app_id, &icon_path).await
}

fn shortcuts_vdf_path(steam_dir: &Path, user_id: &str) -> PathBuf {
    steam_dir
        .join("userdata")
        .join(user_id)
        .join("config")
        .join("shortcuts.vdf")
}

/// Extension (with dot) from a URL path, query stripped.
fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next()?;
    let dot = name.rfind('.')?;
    (dot > 0).then(|| name[dot..].to_owned())
}

/// Patch the catalog's icon field with exponential backoff.
///
/// The client writes new entries to the catalog lazily, so the entry may not
/// exist yet when this runs right after shortcut creation.  Up to 5 attempts
/// with delays of 1·2^n seconds; the read-modify-write runs on the blocking
/// pool.
pub async fn update_vdf_icon(vdf_path: &Path, app_id: u32, icon_path: &Path) -> bool {
    for attempt in 0..MAX_ICON_RETRIES {
        if vdf_path.exists() {
            let vdf_path = vdf_path.to_path_buf();
            let icon = icon_path.to_string_lossy().into_owned();
            let patched = tokio::task::spawn_blocking(move || -> Result<bool, String> {
                let data = std::fs::read(&vdf_path).map_err(|e| e.to_string())?;
                let mut root = vdf::parse(&data).map_err(|e| e.to_string())?;
                if !vdf::patch_icon(&mut root, app_id, &icon) {
                    return Ok(false);
                }
                std::fs::write(&vdf_path, vdf::serialize(&root)).map_err(|e| e.to_string())?;
                Ok(true)
            })
            .await;

            match patched {
                Ok(Ok(true)) => {
                    info!(app_id, "shortcuts catalog icon updated");
                    return true;
                }
                Ok(Ok(false)) => {
                    info!(
                        app_id,
                        attempt = attempt + 1,
                        "shortcut not in catalog yet"
                    );
                }
                Ok(Err(e)) => error!(attempt = attempt + 1, error = %e, "catalog patch failed"),
                Err(e) => error!(error = %e, "catalog patch task failed"),
            }
        } else {
            info!(
                attempt = attempt + 1,
                "shortcuts catalog not found yet"
            );
        }

        if attempt + 1 < MAX_ICON_RETRIES {
            let delay = ICON_RETRY_BASE_DELAY * 2u32.pow(attempt);
            tokio::time::sleep(delay).await;
        }
    }

    warn!(
        app_id,
        icon = %icon_path.display(),
        "catalog not patched after {} retries; icon applies on next client restart",
        MAX_ICON_RETRIES
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdf::{VdfMap, VdfValue};

    #[test]
    fn suffix_and_extension_tables() {
        assert_eq!(artwork_suffix("grid"), Some("p"));
        assert_eq!(artwork_suffix("banner"), Some(""));
        assert_eq!(artwork_suffix("hero"), Some("_hero"));
        assert_eq!(artwork_suffix("poster"), None);
        assert_eq!(ext_for_content_type("image/webp"), Some("webp"));
        assert_eq!(ext_for_content_type("text/html"), None);
    }

    #[test]
    fn webp_reports_png_format() {
        assert_eq!(detect_format("image/webp", "https://x/y.webp"), "png");
        assert_eq!(detect_format("", "https://x/y.webp"), "png");
        assert_eq!(detect_format("image/jpeg", "https://x/y"), "jpg");
        assert_eq!(detect_format("", "https://x/y.jpg"), "jpg");
        assert_eq!(detect_format("image/png", "https://x/y.png"), "png");
    }

    #[test]
    fn url_extension_strips_query() {
        assert_eq!(
            url_extension("https://cdn.example/icons/a.ico?sig=abc"),
            Some(".ico".to_owned())
        );
        assert_eq!(url_extension("https://cdn.example/noext"), None);
    }

    #[test]
    fn apply_replaces_stale_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let steam_dir = dir.path();
        let grid = grid_dir(steam_dir, "123");
        std::fs::create_dir_all(&grid).unwrap();
        std::fs::write(grid.join("4242_hero.jpg"), b"old").unwrap();

        let written =
            apply_from_data_in(steam_dir, "123", 4242, "hero", b"new", "image/png").unwrap();
        assert_eq!(written, grid.join("4242_hero.png"));
        assert!(!grid.join("4242_hero.jpg").exists());
        assert_eq!(std::fs::read(written).unwrap(), b"new");
    }

    #[test]
    fn apply_rejects_unknown_type_and_content() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            apply_from_data_in(dir.path(), "1", 1, "hero", b"x", "text/plain"),
            Err(ArtworkError::UnsupportedContentType(_))
        ));
        assert!(matches!(
            apply_from_data_in(dir.path(), "1", 1, "sticker", b"x", "image/png"),
            Err(ArtworkError::UnknownArtworkType(_))
        ));
    }

    fn catalog_with_entry(app_id_raw: i32) -> Vec<u8> {
        let root = VdfMap(vec![(
            "shortcuts".to_owned(),
            VdfValue::Map(VdfMap(vec![(
                "0".to_owned(),
                VdfValue::Map(VdfMap(vec![
                    ("appid".to_owned(), VdfValue::Int(app_id_raw)),
                    ("AppName".to_owned(), VdfValue::String("G".to_owned())),
                ])),
            )])),
        )]);
        vdf::serialize(&root)
    }

    #[tokio::test]
    async fn patch_succeeds_first_attempt_without_sleeping() {
        let dir = tempfile::tempdir().unwrap();
        let vdf_path = dir.path().join("shortcuts.vdf");
        std::fs::write(&vdf_path, catalog_with_entry(7)).unwrap();

        let started = std::time::Instant::now();
        let ok = update_vdf_icon(&vdf_path, 7 | 0x8000_0000, Path::new("/grid/i.png")).await;
        assert!(ok);
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "first-attempt success must not back off"
        );

        let root = vdf::parse(&std::fs::read(&vdf_path).unwrap()).unwrap();
        let entry = vdf::shortcut_entries(&root).next().unwrap();
        assert_eq!(entry.get_str("icon"), Some("/grid/i.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn patch_exhausts_retries_when_entry_missing() {
        let dir = tempfile::tempdir().unwrap();
        let vdf_path = dir.path().join("shortcuts.vdf");
        std::fs::write(&vdf_path, catalog_with_entry(7)).unwrap();

        // 1+2+4+8 = 15 virtual seconds of backoff across 5 attempts.
        let ok = update_vdf_icon(&vdf_path, 0x8000_0099, Path::new("/grid/i.png")).await;
        assert!(!ok);
    }
}
