//! Steam and system discovery helpers.
//!
//! The agent runs as root (service context) while Steam runs as the desktop
//! user, so "home" means the desktop user's home, not the process owner's.

use std::path::{Path, PathBuf};
use tracing::warn;

/// Resolve the real desktop user's home directory.
///
/// Prefers `/home/deck` (SteamOS), then any `/home/*` entry with a `.steam`
/// directory, then the process home.
pub fn user_home() -> PathBuf {
    let deck = PathBuf::from("/home/deck");
    if deck.exists() {
        return deck;
    }
    if let Ok(entries) = std::fs::read_dir("/home") {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && path.join(".steam").exists() {
                return path;
            }
        }
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"))
}

/// Expand a leading `~/` against the desktop user's home.
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => user_home().join(rest),
        None => PathBuf::from(path),
    }
}

/// Detect the handheld platform tag advertised over discovery.
pub fn detect_platform() -> String {
    if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
        let lower = content.to_lowercase();
        if lower.contains("steamos") {
            return "steamdeck".to_owned();
        }
        if lower.contains("chimeraos") {
            return "chimeraos".to_owned();
        }
        // Bazzite is not a Steam Deck even when /home/deck exists.
        if lower.contains("bazzite") {
            return "linux".to_owned();
        }
    }

    if Path::new("/usr/share/plymouth/themes/legion-go").exists() {
        return "legiongologo".to_owned();
    }
    if Path::new("/usr/share/plymouth/themes/rogally").exists() {
        return "rogally".to_owned();
    }

    // /home/deck must be a real directory, not a symlink (Bazzite symlinks it).
    if let Ok(meta) = std::fs::symlink_metadata("/home/deck") {
        if meta.is_dir() && !meta.is_symlink() {
            return "steamdeck".to_owned();
        }
    }

    "linux".to_owned()
}

/// Find the Steam installation root.
pub fn steam_dir() -> Option<PathBuf> {
    steam_dir_in(&user_home())
}

/// Steam root candidates under a given home, first existing wins.
pub fn steam_dir_in(home: &Path) -> Option<PathBuf> {
    let candidates = [
        home.join(".steam").join("steam"),
        home.join(".local").join("share").join("Steam"),
        home.join(".var")
            .join("app")
            .join("com.valvesoftware.Steam")
            .join(".steam")
            .join("steam"),
    ];
    candidates.into_iter().find(|p| p.is_dir())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteamUserInfo {
    /// Numeric directory name under `userdata/`.
    pub id: String,
    /// True when `config/shortcuts.vdf` exists for this user.
    pub has_shortcuts: bool,
}

/// Enumerate Steam users from the `userdata` directory.
///
/// Entries must be numeric and non-zero.  The first user with a shortcuts
/// catalog is considered to own non-Steam shortcuts.
pub fn steam_users() -> Vec<SteamUserInfo> {
    match steam_dir() {
        Some(dir) => steam_users_in(&dir),
        None => Vec::new(),
    }
}

pub fn steam_users_in(steam_dir: &Path) -> Vec<SteamUserInfo> {
    let userdata = steam_dir.join("userdata");
    let Ok(entries) = std::fs::read_dir(&userdata) else {
        return Vec::new();
    };
    let mut users = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.is_empty() || name == "0" || !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        users.push(SteamUserInfo {
            id: name.to_owned(),
            has_shortcuts: path.join("config").join("shortcuts.vdf").exists(),
        });
    }
    users.sort_by(|a, b| a.id.cmp(&b.id));
    users
}

/// Recursively hand ownership of `path` to the real desktop user and apply
/// 0755/0644 modes.  Best-effort: individual failures are skipped.
#[cfg(unix)]
pub fn fix_permissions(path: &Path) {
    use std::os::unix::fs::MetadataExt;

    let home = user_home();
    let Ok(meta) = std::fs::metadata(&home) else {
        warn!(home = %home.display(), "cannot stat user home; skipping ownership fix");
        return;
    };
    let (uid, gid) = (meta.uid(), meta.gid());
    fix_tree(path, uid, gid);
}

#[cfg(unix)]
fn fix_tree(path: &Path, uid: u32, gid: u32) {
    use std::os::unix::fs::PermissionsExt;

    let _ = std::os::unix::fs::chown(path, Some(uid), Some(gid));
    let Ok(meta) = std::fs::metadata(path) else {
        return;
    };
    if meta.is_dir() {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755));
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                fix_tree(&entry.path(), uid, gid);
            }
        }
    } else {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644));
    }
}

#[cfg(not(unix))]
pub fn fix_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_path_resolves_tilde() {
        let expanded = expand_path("~/Games");
        assert!(expanded.ends_with("Games"));
        assert!(!expanded.to_string_lossy().contains('~'));
        assert_eq!(expand_path("/opt/x"), PathBuf::from("/opt/x"));
    }

    #[test]
    fn steam_dir_prefers_dot_steam() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".local/share/Steam")).unwrap();
        assert_eq!(
            steam_dir_in(home.path()).unwrap(),
            home.path().join(".local/share/Steam")
        );
        std::fs::create_dir_all(home.path().join(".steam/steam")).unwrap();
        assert_eq!(
            steam_dir_in(home.path()).unwrap(),
            home.path().join(".steam/steam")
        );
    }

    #[test]
    fn steam_users_skips_non_numeric_and_zero() {
        let dir = tempfile::tempdir().unwrap();
        let userdata = dir.path().join("userdata");
        for name in ["0", "abc", "123", "456"] {
            std::fs::create_dir_all(userdata.join(name)).unwrap();
        }
        std::fs::create_dir_all(userdata.join("123").join("config")).unwrap();
        std::fs::write(
            userdata.join("123").join("config").join("shortcuts.vdf"),
            b"\x08",
        )
        .unwrap();

        let users = steam_users_in(dir.path());
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, "123");
        assert!(users[0].has_shortcuts);
        assert_eq!(users[1].id, "456");
        assert!(!users[1].has_shortcuts);
    }
}
