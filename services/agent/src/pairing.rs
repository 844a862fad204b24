//! Pairing code and token management for Hub authentication.
//!
//! At most one pairing is pending at a time.  Codes are 6 uniform decimal
//! digits with a 60 s expiry.  Three consecutive failures engage a 300 s
//! lockout; the lockout state is process-local and not persisted.
//! Successful pairing mints a high-entropy token and persists the
//! authorization record under `authorized_hubs`.

use crate::settings::SharedSettings;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const PAIRING_CODE_LENGTH: usize = 6;
pub const PAIRING_CODE_EXPIRY_SECS: u64 = 60;
pub const MAX_FAILED_ATTEMPTS: u32 = 3;
pub const LOCKOUT_DURATION_SECS: u64 = 300;

/// A persisted authorization record, keyed by hub id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizedHub {
    pub name: String,
    #[serde(default)]
    pub platform: String,
    pub token: String,
    /// Unix seconds.
    pub paired_at: f64,
}

#[derive(Debug)]
struct Pending {
    code: String,
    hub_id: String,
    hub_name: String,
    hub_platform: String,
    expires_at: Instant,
}

pub struct PairingAuthority {
    settings: SharedSettings,
    pending: Option<Pending>,
    failed_attempts: u32,
    lockout_until: Option<Instant>,
}

impl PairingAuthority {
    pub fn new(settings: SharedSettings) -> Self {
        Self {
            settings,
            pending: None,
            failed_attempts: 0,
            lockout_until: None,
        }
    }

    /// Generate a fresh pairing code, overwriting any prior pending entry.
    ///
    /// Returns `None` while the lockout is active.
    pub fn generate_code(&mut self, hub_id: &str, hub_name: &str, hub_platform: &str) -> Option<String> {
        if self.is_locked_out() {
            return None;
        }
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        self.pending = Some(Pending {
            code: code.clone(),
            hub_id: hub_id.to_owned(),
            hub_name: hub_name.to_owned(),
            hub_platform: hub_platform.to_owned(),
            expires_at: Instant::now() + Duration::from_secs(PAIRING_CODE_EXPIRY_SECS),
        });
        Some(code)
    }

    /// Name of the hub the pending code was issued for.
    pub fn pending_hub_name(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.hub_name.as_str())
    }

    /// Validate a pairing code.  On success mints and persists a token.
    ///
    /// Every failure counts toward the lockout; the third consecutive
    /// failure engages it and clears the pending code.
    pub async fn validate_code(&mut self, hub_id: &str, code: &str) -> Option<String> {
        if self.is_locked_out() {
            return None;
        }

        let matches = match &self.pending {
            None => return None,
            Some(p) if Instant::now() > p.expires_at => return None,
            Some(p) => p.hub_id == hub_id && constant_time_eq(p.code.as_bytes(), code.as_bytes()),
        };

        if !matches {
            self.failed_attempts += 1;
            if self.failed_attempts >= MAX_FAILED_ATTEMPTS {
                self.lockout_until =
                    Some(Instant::now() + Duration::from_secs(LOCKOUT_DURATION_SECS));
                self.pending = None;
                self.failed_attempts = 0;
                warn!(
                    "pairing locked out for {}s after {} failed attempts",
                    LOCKOUT_DURATION_SECS, MAX_FAILED_ATTEMPTS
                );
            }
            return None;
        }

        self.failed_attempts = 0;
        let token = mint_token();
        let pending = self.pending.take().expect("pending checked above");

        let settings = self.settings.lock().await;
        let mut authorized: BTreeMap<String, AuthorizedHub> =
            settings.get_or("authorized_hubs", BTreeMap::new());
        authorized.insert(
            hub_id.to_owned(),
            AuthorizedHub {
                name: pending.hub_name,
                platform: pending.hub_platform,
                token: token.clone(),
                paired_at: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            },
        );
        if let Err(e) = settings.set("authorized_hubs", &authorized) {
            error!(error = %e, "failed to persist authorization record");
            return None;
        }
        info!(hub_id, "hub paired");
        Some(token)
    }

    /// Constant-time token check against the persisted record.
    pub async fn validate_token(&self, hub_id: &str, token: &str) -> bool {
        let settings = self.settings.lock().await;
        let authorized: BTreeMap<String, AuthorizedHub> =
            settings.get_or("authorized_hubs", BTreeMap::new());
        match authorized.get(hub_id) {
            Some(hub) => constant_time_eq(hub.token.as_bytes(), token.as_bytes()),
            None => false,
        }
    }

    /// All persisted authorization records.
    pub async fn authorized_hubs(&self) -> BTreeMap<String, AuthorizedHub> {
        let settings = self.settings.lock().await;
        settings.get_or("authorized_hubs", BTreeMap::new())
    }

    /// Delete a hub's authorization record.  Returns true if one existed.
    pub async fn revoke(&self, hub_id: &str) -> bool {
        let settings = self.settings.lock().await;
        let mut authorized: BTreeMap<String, AuthorizedHub> =
            settings.get_or("authorized_hubs", BTreeMap::new());
        if authorized.remove(hub_id).is_none() {
            return false;
        }
        if let Err(e) = settings.set("authorized_hubs", &authorized) {
            error!(error = %e, "failed to persist revocation");
            return false;
        }
        info!(hub_id, "hub revoked");
        true
    }

    pub fn is_locked_out(&self) -> bool {
        matches!(self.lockout_until, Some(t) if Instant::now() < t)
    }

    /// Seconds until the lockout lifts; 0 when not locked.
    pub fn lockout_remaining(&self) -> u64 {
        match self.lockout_until {
            Some(t) => t.saturating_duration_since(Instant::now()).as_secs(),
            None => 0,
        }
    }

    pub fn reset_lockout(&mut self) {
        self.lockout_until = None;
        self.failed_attempts = 0;
    }
}

/// 32 bytes of CSPRNG output, URL-safe base64 without padding.
fn mint_token() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Length-guarded constant-time byte comparison.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
