//! Agent configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/capydeploy/agent.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else has a default; a missing file section simply takes all
//! defaults.  Mutable runtime state (agent name, install path, toggles)
//! lives in the settings store — the config only seeds first-run values.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub schema_version: u32,
    pub agent: AgentSection,
    pub storage: StorageSection,
    pub server: ServerSection,
    pub discovery: DiscoverySection,
}

#[derive(Debug, Clone)]
pub struct AgentSection {
    /// Default display name; overridden by the persisted `agent_name`.
    pub name: String,
    /// Default game install root; `~` expands to the desktop user's home.
    pub install_path: String,
    pub accept_connections: bool,
}

#[derive(Debug, Clone)]
pub struct StorageSection {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct ServerSection {
    /// Bind address for the control channel; port 0 means OS-assigned.
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct DiscoverySection {
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    agent: Option<RawAgentSection>,
    storage: Option<RawStorageSection>,
    server: Option<RawServerSection>,
    discovery: Option<RawDiscoverySection>,
}

#[derive(Debug, Deserialize)]
struct RawAgentSection {
    name: Option<String>,
    install_path: Option<String>,
    accept_connections: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawStorageSection {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawServerSection {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDiscoverySection {
    enabled: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default path `/etc/capydeploy/agent.toml`.
pub fn load_config() -> Result<AgentConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/capydeploy/agent.toml"))
}

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<AgentConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<AgentConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let agent = match raw.agent {
        Some(a) => AgentSection {
            name: a.name.unwrap_or_else(|| "Steam Deck".to_owned()),
            install_path: a.install_path.unwrap_or_else(|| "~/Games".to_owned()),
            accept_connections: a.accept_connections.unwrap_or(true),
        },
        None => AgentSection {
            name: "Steam Deck".to_owned(),
            install_path: "~/Games".to_owned(),
            accept_connections: true,
        },
    };

    let storage = StorageSection {
        sqlite_path: raw
            .storage
            .and_then(|s| s.sqlite_path)
            .unwrap_or_else(|| "/var/lib/capydeploy/agent.sqlite3".to_owned()),
    };

    let server = ServerSection {
        bind: raw
            .server
            .and_then(|s| s.bind)
            .unwrap_or_else(|| "0.0.0.0:0".to_owned()),
    };

    let discovery = DiscoverySection {
        enabled: raw.discovery.and_then(|d| d.enabled).unwrap_or(true),
    };

    Ok(AgentConfig {
        schema_version,
        agent,
        storage,
        server,
        discovery,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_takes_defaults() {
        let cfg = load_config_from_str("schema_version = 1\n").unwrap();
        assert_eq!(cfg.agent.name, "Steam Deck");
        assert_eq!(cfg.agent.install_path, "~/Games");
        assert!(cfg.agent.accept_connections);
        assert_eq!(cfg.server.bind, "0.0.0.0:0");
        assert_eq!(cfg.storage.sqlite_path, "/var/lib/capydeploy/agent.sqlite3");
        assert!(cfg.discovery.enabled);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = load_config_from_str(
            r#"
schema_version = 1

[agent]
name = "Living Room Deck"
install_path = "~/Drop"

[server]
bind = "127.0.0.1:7700"

[discovery]
enabled = false
"#,
        )
        .unwrap();
        assert_eq!(cfg.agent.name, "Living Room Deck");
        assert_eq!(cfg.agent.install_path, "~/Drop");
        assert_eq!(cfg.server.bind, "127.0.0.1:7700");
        assert!(!cfg.discovery.enabled);
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        let err = load_config_from_str("[agent]\nname = \"X\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "schema_version"));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let err = load_config_from_str("schema_version = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = load_config_from_str("schema_version = = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
