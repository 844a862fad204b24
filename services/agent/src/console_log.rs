//! Frontend console log collector.
//!
//! Entries arrive from the UI surface's console hook via [`ConsoleLogCollector::add_entry`]
//! and are flushed to the Hub in batches on the `console_log_data` channel.
//!
//! The buffer is a bounded ring: cap 200 entries, oldest dropped on overflow
//! with a `dropped` counter reported in the next batch.  Entries filtered by
//! the level mask never enter the buffer and do not count as dropped.

use crate::server::Outbound;
use cd_protocol::{ConsoleLogData, LogEntry, log_levels};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub const MAX_BUFFER_SIZE: usize = 200;
pub const MAX_BATCH_SIZE: usize = 50;
const FLUSH_INTERVAL_MS: u64 = 500;

#[derive(Debug)]
struct Ring {
    buffer: VecDeque<LogEntry>,
    dropped: u64,
    level_mask: u32,
}

pub struct ConsoleLogCollector {
    ring: Arc<Mutex<Ring>>,
    handle: Option<JoinHandle<()>>,
    cancel: Option<watch::Sender<bool>>,
}

impl Default for ConsoleLogCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleLogCollector {
    pub fn new() -> Self {
        Self {
            ring: Arc::new(Mutex::new(Ring {
                buffer: VecDeque::new(),
                dropped: 0,
                level_mask: log_levels::DEFAULT_MASK,
            })),
            handle: None,
            cancel: None,
        }
    }

    pub fn level_mask(&self) -> u32 {
        self.ring.lock().expect("ring lock").level_mask
    }

    pub fn set_level_mask(&self, mask: u32) {
        self.ring.lock().expect("ring lock").level_mask = mask;
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Buffer one entry from the console hook.
    ///
    /// Entries whose level bit is filtered out are discarded silently.
    pub fn add_entry(
        &self,
        level: &str,
        text: &str,
        source: &str,
        url: Option<String>,
        line: Option<u32>,
        segments: Option<Vec<Value>>,
    ) {
        let bit = log_levels::level_bit(level);
        let mut ring = self.ring.lock().expect("ring lock");
        if bit == 0 || ring.level_mask & bit == 0 {
            return;
        }
        if ring.buffer.len() >= MAX_BUFFER_SIZE {
            ring.buffer.pop_front();
            ring.dropped += 1;
        }
        ring.buffer.push_back(LogEntry {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level: level.to_owned(),
            source: source.to_owned(),
            text: text.to_owned(),
            url: url.filter(|u| !u.is_empty()),
            line: line.filter(|&l| l != 0),
            segments,
        });
    }

    /// Start the flush loop.  No-op when already running.
    pub fn start(&mut self, outbound: Outbound) {
        if self.is_running() {
            return;
        }
        {
            let mut ring = self.ring.lock().expect("ring lock");
            ring.buffer.clear();
            ring.dropped = 0;
        }
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.cancel = Some(cancel_tx);
        let ring = self.ring.clone();
        self.handle = Some(tokio::spawn(async move {
            loop {
                let cancelled = tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => true,
                    () = tokio::time::sleep(std::time::Duration::from_millis(FLUSH_INTERVAL_MS)) => false,
                };
                flush(&ring, &outbound).await;
                if cancelled {
                    break;
                }
            }
        }));
        info!("console log collector started");
    }

    /// Stop the loop after one final flush.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            info!("console log collector stopped");
        }
        let mut ring = self.ring.lock().expect("ring lock");
        ring.buffer.clear();
        ring.dropped = 0;
    }
}

/// Send up to one batch of buffered entries.
async fn flush(ring: &Arc<Mutex<Ring>>, outbound: &Outbound) {
    let batch = {
        let mut ring = ring.lock().expect("ring lock");
        if ring.buffer.is_empty() {
            return;
        }
        let n = ring.buffer.len().min(MAX_BATCH_SIZE);
        let entries: Vec<LogEntry> = ring.buffer.drain(..n).collect();
        let dropped = ring.dropped;
        ring.dropped = 0;
        ConsoleLogData { entries, dropped }
    };
    outbound.send_event("console_log_data", &batch).await;
}
