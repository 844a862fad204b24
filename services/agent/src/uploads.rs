//! Upload session state and the safe-path policy.
//!
//! Every relative path supplied by the peer — game names, chunk file paths,
//! bulk-channel entries — passes through [`validate_relative_path`].  This is
//! the sole defense against writing outside the install root.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Safe-path policy
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("absolute path not allowed: {0}")]
    Absolute(String),
    #[error("parent traversal not allowed: {0}")]
    Traversal(String),
}

/// Reject a peer-supplied relative path that is empty, absolute, or whose
/// normalized form is `..` or begins with `../`.
pub fn validate_relative_path(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(PathError::Absolute(path.to_owned()));
    }
    let normalized = normalize(p);
    if normalized.first().is_some_and(|c| c == "..") {
        return Err(PathError::Traversal(path.to_owned()));
    }
    Ok(())
}

/// Lexical normalization: drop `.`, fold `a/..` pairs, keep leading `..`s.
fn normalize(path: &Path) -> Vec<String> {
    let mut stack: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if stack.last().is_some_and(|c| c != "..") {
                    stack.pop();
                } else {
                    stack.push("..".to_owned());
                }
            }
            other => stack.push(other.as_os_str().to_string_lossy().into_owned()),
        }
    }
    stack
}

// ---------------------------------------------------------------------------
// Upload sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Active,
    Complete,
    Cancelled,
}

/// Handle onto a running bulk-transfer endpoint owned by an upload session.
#[derive(Debug)]
pub struct DataChannelHandle {
    pub port: u16,
    pub token: String,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl DataChannelHandle {
    pub fn new(port: u16, token: String, cancel: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self {
            port,
            token,
            cancel,
            task,
        }
    }

    /// Cooperatively cancel the receive loop and abort the accept task.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

/// One in-flight upload.
///
/// `transferred` is shared with the bulk endpoint's progress callback, which
/// runs outside the connection task.
#[derive(Debug)]
pub struct UploadSession {
    pub id: String,
    pub game_name: String,
    pub total_size: u64,
    pub files: Vec<String>,
    transferred: Arc<AtomicU64>,
    pub current_file: Option<String>,
    pub status: UploadStatus,
    pub install_dir: PathBuf,
    pub executable: String,
    pub channel: Option<DataChannelHandle>,
}

impl UploadSession {
    pub fn new(id: String, game_name: String, total_size: u64, files: Vec<String>) -> Self {
        Self {
            id,
            game_name,
            total_size,
            files,
            transferred: Arc::new(AtomicU64::new(0)),
            current_file: None,
            status: UploadStatus::Active,
            install_dir: PathBuf::new(),
            executable: String::new(),
            channel: None,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    /// Advance the byte counter; returns the new total.
    pub fn add_transferred(&self, bytes: u64) -> u64 {
        self.transferred.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    /// Shared counter handle for the bulk endpoint's progress callback.
    pub fn transferred_counter(&self) -> Arc<AtomicU64> {
        self.transferred.clone()
    }

    /// Percentage complete; a zero-byte declaration reports 100.
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        self.transferred() as f64 / self.total_size as f64 * 100.0
    }

    pub fn stop_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.stop();
        }
    }
}

/// Time-based id with a random suffix, e.g. `upload-1700000000-4242`.
pub fn new_upload_id() -> String {
    let secs = chrono::Utc::now().timestamp();
    let suffix: u32 = rand::thread_rng().gen_range(1000..10000);
    format!("upload-{secs}-{suffix}")
}

/// A shortcut the agent created, persisted under `tracked_shortcuts`.
///
/// `app_id` stays 0 until the UI surface registers the id the client
/// assigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackedShortcut {
    pub name: String,
    pub exe: String,
    pub start_dir: String,
    pub app_id: u32,
    pub game_name: String,
    /// Unix seconds.
    pub installed_at: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_absolute_and_traversal() {
        assert_eq!(validate_relative_path(""), Err(PathError::Empty));
        assert!(matches!(
            validate_relative_path("/etc/passwd"),
            Err(PathError::Absolute(_))
        ));
        assert!(matches!(
            validate_relative_path(".."),
            Err(PathError::Traversal(_))
        ));
        assert!(matches!(
            validate_relative_path("../evil"),
            Err(PathError::Traversal(_))
        ));
        assert!(matches!(
            validate_relative_path("a/../../evil"),
            Err(PathError::Traversal(_))
        ));
    }

    #[test]
    fn accepts_plain_and_interior_dotdot_that_stays_inside() {
        assert_eq!(validate_relative_path("game.exe"), Ok(()));
        assert_eq!(validate_relative_path("Content/pack.bin"), Ok(()));
        assert_eq!(validate_relative_path("a/b/../c"), Ok(()));
        assert_eq!(validate_relative_path("./a"), Ok(()));
    }

    #[test]
    fn validation_is_idempotent_under_normalization() {
        for p in ["a/b/../c", "./x/y", "dir/sub/file"] {
            assert_eq!(validate_relative_path(p), Ok(()));
            let normalized = normalize(Path::new(p)).join("/");
            assert_eq!(validate_relative_path(&normalized), Ok(()));
        }
    }

    #[test]
    fn progress_handles_zero_total() {
        let mut s = UploadSession::new("u".into(), "G".into(), 0, vec![]);
        assert_eq!(s.progress(), 100.0);
        s.total_size = 200;
        assert_eq!(s.add_transferred(50), 50);
        assert_eq!(s.progress(), 25.0);
        assert_eq!(s.transferred(), 50);
    }

    #[test]
    fn upload_id_shape() {
        let id = new_upload_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts[0], "upload");
        assert!(parts[1].parse::<i64>().is_ok());
        let suffix: u32 = parts[2].parse().unwrap();
        assert!((1000..10000).contains(&suffix));
    }
}
