//! Game log tailer.
//!
//! The wrapper script writes `game_<appId>_<timestamp>.log` files under
//! `<home>/.local/share/capydeploy/logs/`.  The tailer waits for a log file
//! to appear (preferring one newer than the tail start), follows it line by
//! line, and batches entries onto the `console_log_data` channel with
//! `source = "game"`.

use crate::server::Outbound;
use cd_protocol::{ConsoleLogData, LogEntry};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const MAX_BATCH_SIZE: usize = 50;
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const FILE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GameLogTailer {
    log_dir: PathBuf,
    handle: Option<JoinHandle<()>>,
    cancel: Option<watch::Sender<bool>>,
}

impl GameLogTailer {
    pub fn new() -> Self {
        Self::with_log_dir(
            crate::steam::user_home()
                .join(".local")
                .join("share")
                .join("capydeploy")
                .join("logs"),
        )
    }

    pub fn with_log_dir(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            handle: None,
            cancel: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start tailing the freshest log file for `app_id`, replacing any
    /// previous tail.
    pub async fn start(&mut self, app_id: u32, outbound: Outbound) {
        self.stop().await;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancel = Some(cancel_tx);
        let dir = self.log_dir.clone();
        self.handle = Some(tokio::spawn(run(dir, app_id, outbound, cancel_rx)));
        info!(app_id, "game log tailer started");
    }

    /// Stop the tailer after a final flush.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            info!("game log tailer stopped");
        }
    }
}

impl Default for GameLogTailer {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(dir: PathBuf, app_id: u32, outbound: Outbound, mut cancel: watch::Receiver<bool>) {
    let Some(log_file) = wait_for_file(&dir, app_id, &mut cancel).await else {
        warn!(
            app_id,
            "no game log file appeared within {}s",
            FILE_WAIT_TIMEOUT.as_secs()
        );
        return;
    };
    info!(file = %log_file.display(), "tailing game log");
    tail_file(&log_file, &outbound, &mut cancel).await;
}

/// Wait up to 30 s for a log file matching `game_<appId>_*.log`.
///
/// A file that appears after the tail starts wins; otherwise the most
/// recently modified pre-existing file is used.
async fn wait_for_file(
    dir: &Path,
    app_id: u32,
    cancel: &mut watch::Receiver<bool>,
) -> Option<PathBuf> {
    let deadline = tokio::time::Instant::now() + FILE_WAIT_TIMEOUT;
    let initial = find_latest(dir, app_id);

    while tokio::time::Instant::now() < deadline {
        let current = find_latest(dir, app_id);
        match (&initial, &current) {
            (Some(old), Some(new)) if old != new => return current,
            (None, Some(_)) => return current,
            _ => {}
        }
        tokio::select! {
            biased;
            _ = cancel.changed() => return None,
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
    // Fall back to whatever is latest, even if it predates the tail.
    find_latest(dir, app_id)
}

/// Most recently modified `game_<appId>_*.log` in `dir`.
fn find_latest(dir: &Path, app_id: u32) -> Option<PathBuf> {
    let prefix = format!("game_{app_id}_");
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".log"))
        })
        .filter_map(|e| {
            let mtime = e.metadata().ok()?.modified().ok()?;
            Some((mtime, e.path()))
        })
        .max_by_key(|(mtime, _)| *mtime)
        .map(|(_, path)| path)
}

async fn tail_file(path: &Path, outbound: &Outbound, cancel: &mut watch::Receiver<bool>) {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            error!(file = %path.display(), error = %e, "failed to open game log");
            return;
        }
    };
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut buffer: Vec<LogEntry> = Vec::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                // EOF for now: flush what we have and poll for growth.
                flush(&mut buffer, outbound).await;
                tokio::select! {
                    biased;
                    _ = cancel.changed() => {
                        flush(&mut buffer, outbound).await;
                        return;
                    }
                    () = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
            Ok(_) => {
                push_entry(&mut buffer, line.trim_end_matches('\n'));
                if buffer.len() >= MAX_BATCH_SIZE {
                    flush(&mut buffer, outbound).await;
                }
                if *cancel.borrow() {
                    flush(&mut buffer, outbound).await;
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "game log read failed");
                flush(&mut buffer, outbound).await;
                return;
            }
        }
    }
}

fn push_entry(buffer: &mut Vec<LogEntry>, text: &str) {
    if text.is_empty() {
        return;
    }
    buffer.push(LogEntry {
        timestamp: chrono::Utc::now().timestamp_millis(),
        level: derive_level(text).to_owned(),
        source: "game".to_owned(),
        text: text.to_owned(),
        url: None,
        line: None,
        segments: None,
    });
}

/// Coarse level heuristic over the raw line.
fn derive_level(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    if lower.contains("error") || lower.contains("fatal") || lower.contains("panic") {
        "error"
    } else if lower.contains("warn") {
        "warn"
    } else if lower.contains("debug") || lower.contains("trace") {
        "debug"
    } else {
        "log"
    }
}

async fn flush(buffer: &mut Vec<LogEntry>, outbound: &Outbound) {
    if buffer.is_empty() {
        return;
    }
    let n = buffer.len().min(MAX_BATCH_SIZE);
    let entries: Vec<LogEntry> = buffer.drain(..n).collect();
    let batch = ConsoleLogData {
        entries,
        dropped: 0,
    };
    outbound.send_event("console_log_data", &batch).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_heuristic() {
        assert_eq!(derive_level("Segfault: PANIC at 0x0"), "error");
        assert_eq!(derive_level("[Fatal] out of memory"), "error");
        assert_eq!(derive_level("WARNING: deprecated"), "warn");
        assert_eq!(derive_level("trace: frame 12"), "debug");
        assert_eq!(derive_level("loaded 42 assets"), "log");
    }

    #[test]
    fn find_latest_prefers_newest_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("game_123_1000.log");
        let new = dir.path().join("game_123_2000.log");
        let other = dir.path().join("game_999_3000.log");
        std::fs::write(&old, "a").unwrap();
        std::fs::write(&other, "c").unwrap();
        std::fs::write(&new, "b").unwrap();
        let earlier = std::time::SystemTime::now() - Duration::from_secs(60);
        let f = std::fs::File::options().write(true).open(&old).unwrap();
        f.set_modified(earlier).unwrap();

        assert_eq!(find_latest(dir.path(), 123), Some(new));
        assert_eq!(find_latest(dir.path(), 777), None);
    }
}
