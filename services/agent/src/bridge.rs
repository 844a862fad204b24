//! Frontend event bridge.
//!
//! The UI surface polls the settings store; the agent only ever writes.  Two
//! key families:
//!
//! - `_queue_<event>` — append queue for events that must not be lost
//!   (pairing codes, shortcut creation, connect/disconnect).  Capped at 50
//!   entries, oldest dropped on overflow.
//! - `_event_<event>` — last-write-wins slot for high-rate progress updates.
//!
//! `take_event` is read-and-clear: queued events pop FIFO, slot events read
//! once and clear.  Stale keys from a previous run are swept at startup.

use crate::settings::SharedSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

/// Events that must not be lost — delivered through append queues.
pub const QUEUED_EVENTS: &[&str] = &[
    "operation_event",
    "create_shortcut",
    "remove_shortcut",
    "update_artwork",
    "pairing_code",
    "pairing_success",
    "pairing_locked",
    "hub_connected",
    "hub_disconnected",
    "server_error",
    "console_log_toggle",
];

/// Maximum queued entries per event before the oldest is dropped.
pub const MAX_QUEUE_SIZE: usize = 50;

/// One delivered frontend event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeEvent {
    /// Unix seconds (fractional).
    pub timestamp: f64,
    pub data: Value,
}

#[derive(Clone)]
pub struct FrontendBridge {
    settings: SharedSettings,
}

impl FrontendBridge {
    pub fn new(settings: SharedSettings) -> Self {
        Self { settings }
    }

    /// Post an event for the frontend.  Failures are logged, never fatal.
    pub async fn notify(&self, event: &str, data: Value) {
        debug!(event, "frontend event");
        let entry = BridgeEvent {
            timestamp: now_secs(),
            data,
        };
        let settings = self.settings.lock().await;
        let result = if QUEUED_EVENTS.contains(&event) {
            let key = format!("_queue_{event}");
            let mut queue: Vec<BridgeEvent> = settings.get_or(&key, Vec::new());
            queue.push(entry);
            if queue.len() > MAX_QUEUE_SIZE {
                let excess = queue.len() - MAX_QUEUE_SIZE;
                queue.drain(..excess);
            }
            settings.set(&key, &queue)
        } else {
            settings.set(&format!("_event_{event}"), &entry)
        };
        if let Err(e) = result {
            error!(event, error = %e, "failed to persist frontend event");
        }
    }

    /// Read and clear one event.  Pops from the queue first, then falls back
    /// to the slot.
    pub async fn take_event(&self, event: &str) -> Option<BridgeEvent> {
        let settings = self.settings.lock().await;

        let queue_key = format!("_queue_{event}");
        let mut queue: Vec<BridgeEvent> = settings.get_or(&queue_key, Vec::new());
        if !queue.is_empty() {
            let first = queue.remove(0);
            if let Err(e) = settings.set(&queue_key, &queue) {
                error!(event, error = %e, "failed to update event queue");
            }
            return Some(first);
        }

        let slot_key = format!("_event_{event}");
        let slot: Option<BridgeEvent> = settings.get(&slot_key).ok().flatten();
        if slot.is_some() {
            if let Err(e) = settings.delete(&slot_key) {
                error!(event, error = %e, "failed to clear event slot");
            }
        }
        slot
    }

    /// Remove all `_queue_*` and `_event_*` keys left over from a previous
    /// run.  Called once at startup.
    pub async fn sweep_stale(&self) {
        let settings = self.settings.lock().await;
        for prefix in ["_queue_", "_event_"] {
            match settings.keys_with_prefix(prefix) {
                Ok(keys) => {
                    for key in keys {
                        if let Err(e) = settings.delete(&key) {
                            error!(key = %key, error = %e, "failed to sweep stale event key");
                        }
                    }
                }
                Err(e) => error!(prefix, error = %e, "failed to list stale event keys"),
            }
        }
    }
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn bridge() -> FrontendBridge {
        FrontendBridge::new(Arc::new(Mutex::new(Settings::open_in_memory().unwrap())))
    }

    #[tokio::test]
    async fn queued_events_pop_fifo() {
        let b = bridge();
        b.notify("pairing_code", json!({"code": "111111"})).await;
        b.notify("pairing_code", json!({"code": "222222"})).await;

        let first = b.take_event("pairing_code").await.unwrap();
        assert_eq!(first.data["code"], "111111");
        let second = b.take_event("pairing_code").await.unwrap();
        assert_eq!(second.data["code"], "222222");
        assert!(b.take_event("pairing_code").await.is_none());
    }

    #[tokio::test]
    async fn queue_caps_at_fifty_dropping_oldest() {
        let b = bridge();
        for i in 0..60 {
            b.notify("operation_event", json!({"n": i})).await;
        }
        let first = b.take_event("operation_event").await.unwrap();
        assert_eq!(first.data["n"], 10, "oldest ten must have been dropped");
    }

    #[tokio::test]
    async fn slot_events_overwrite_and_clear_on_read() {
        let b = bridge();
        b.notify("upload_progress", json!({"percentage": 10.0})).await;
        b.notify("upload_progress", json!({"percentage": 55.0})).await;

        let taken = b.take_event("upload_progress").await.unwrap();
        assert_eq!(taken.data["percentage"], 55.0);
        assert!(b.take_event("upload_progress").await.is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_bridge_keys() {
        let settings = Arc::new(Mutex::new(Settings::open_in_memory().unwrap()));
        {
            let s = settings.lock().await;
            s.set("_queue_pairing_code", &json!([{"timestamp": 0.0, "data": {}}]))
                .unwrap();
            s.set("_event_upload_progress", &json!({"timestamp": 0.0, "data": {}}))
                .unwrap();
            s.set("agent_name", "Deck").unwrap();
        }
        let b = FrontendBridge::new(settings.clone());
        b.sweep_stale().await;

        let s = settings.lock().await;
        assert!(s.keys_with_prefix("_queue_").unwrap().is_empty());
        assert!(s.keys_with_prefix("_event_").unwrap().is_empty());
        assert_eq!(s.get::<String>("agent_name").unwrap().as_deref(), Some("Deck"));
    }
}
