// ABOUTME: Configuration parsing from TOML file with environment variable overrides.
// ABOUTME: Validates required fields and provides sensible defaults for optional ones.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use turngate_core::policy::PolicyRule;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Prometheus exporter address; disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the gateway's SQLite state; defaults to the platform
    /// data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Session used when a bridged event (e.g. a voice transcript) carries no
    /// session key.
    #[serde(default = "default_bridge_session")]
    pub default_session_key: String,
    /// When false, any bridge connection is treated as linked.
    #[serde(default = "default_true")]
    pub pairing_required: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_session_key: default_bridge_session(),
            pairing_required: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine backend name resolved through the engine registry.
    #[serde(default = "default_engine_backend")]
    pub backend: String,
    /// Backend-specific options, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<toml::Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: default_engine_backend(),
            options: None,
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8913".to_string()
}

fn default_bridge_session() -> String {
    "bridge:dm:default".to_string()
}

fn default_engine_backend() -> String {
    "mock".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment
    /// variable overrides (`TURNGATE_*`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config: {}", path.display()))?
            }
            Some(path) => {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            None => Config::default(),
        };

        if let Ok(addr) = std::env::var("TURNGATE_LISTEN_ADDR") {
            config.server.listen_addr = addr;
        }
        if let Ok(addr) = std::env::var("TURNGATE_METRICS_ADDR") {
            config.server.metrics_addr = Some(addr);
        }
        if let Ok(dir) = std::env::var("TURNGATE_STATE_DIR") {
            config.storage.state_dir = Some(PathBuf::from(dir));
        }
        if let Ok(backend) = std::env::var("TURNGATE_ENGINE") {
            config.engine.backend = backend;
        }
        if let Ok(key) = std::env::var("TURNGATE_DEFAULT_SESSION") {
            config.bridge.default_session_key = key;
        }
        if let Ok(required) = std::env::var("TURNGATE_PAIRING_REQUIRED") {
            config.bridge.pairing_required = required != "0" && required != "false";
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.server
            .listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen_addr: {}", self.server.listen_addr))?;
        if let Some(ref addr) = self.server.metrics_addr {
            addr.parse::<SocketAddr>()
                .with_context(|| format!("Invalid metrics_addr: {}", addr))?;
        }
        if self.bridge.default_session_key.is_empty() {
            anyhow::bail!("bridge.default_session_key must not be empty");
        }
        Ok(())
    }

    /// Resolve the state directory, creating it if needed.
    pub fn state_dir(&self) -> Result<PathBuf> {
        let dir = match &self.storage.state_dir {
            Some(dir) => dir.clone(),
            None => directories::ProjectDirs::from("com", "turngate", "turngate")
                .context("Could not determine platform data directory")?
                .data_dir()
                .to_path_buf(),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state dir: {}", dir.display()))?;
        Ok(dir)
    }

    /// Engine options as JSON for the engine registry.
    pub fn engine_options(&self) -> serde_json::Value {
        self.engine
            .options
            .as_ref()
            .and_then(|v| serde_json::to_value(v).ok())
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8913");
        assert_eq!(config.bridge.default_session_key, "bridge:dm:default");
        assert!(config.bridge.pairing_required);
        assert_eq!(config.engine.backend, "mock");
        assert!(config.policy.rules.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [server]
            listen_addr = "0.0.0.0:9000"

            [bridge]
            default_session_key = "bridge:dm:main"
            pairing_required = false

            [[policy.rules]]
            action = "deny"
            provider = "discord"
            chat_type = "group"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert!(!config.bridge.pairing_required);
        assert_eq!(config.policy.rules.len(), 1);
        assert_eq!(config.policy.rules[0].provider.as_deref(), Some("discord"));
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let config = Config {
            server: ServerConfig {
                listen_addr: "not-an-addr".to_string(),
                metrics_addr: None,
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
