//! Configuration handling for cstp-vpn

use crate::cstp::{AgentIdentity, TunnelOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// `webvpn` session cookie; prompted for when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub version: String,
    /// Always identify as AnyConnect
    pub cisco_compat: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub tun_name: String,
    /// Used when the server sends no keepalive interval; 0 disables
    pub keepalive_secs: u64,
    /// Used when the server sends no DPD interval; 0 disables
    pub dpd_secs: u64,
    pub dead_peer_factor: u32,
    pub enable_dtls: bool,
    pub dtls_handshake_timeout_secs: u64,
}

fn default_port() -> u16 {
    443
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "AnyConnect".to_string(),
            version: "4.10.07061".to_string(),
            cisco_compat: false,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            tun_name: "cstp0".to_string(),
            keepalive_secs: 30,
            dpd_secs: 30,
            dead_peer_factor: 3,
            enable_dtls: true,
            dtls_handshake_timeout_secs: 10,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "vpn.example.com".to_string(),
                port: default_port(),
            },
            agent: AgentConfig::default(),
            tunnel: TunnelConfig::default(),
            cookie: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `~/.config/cstp-vpn/config.toml`, or `./cstp-vpn.toml` without a
    /// config directory
    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("cstp-vpn").join("config.toml"),
            None => PathBuf::from("cstp-vpn.toml"),
        }
    }

    pub fn agent_identity(&self) -> AgentIdentity {
        AgentIdentity {
            name: self.agent.name.clone(),
            version: self.agent.version.clone(),
            cisco_compat: self.agent.cisco_compat,
        }
    }

    pub fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            dead_peer_factor: self.tunnel.dead_peer_factor,
            enable_dtls: self.tunnel.enable_dtls,
            dtls_handshake_timeout: Duration::from_secs(self.tunnel.dtls_handshake_timeout_secs),
            ..TunnelOptions::default()
        }
    }

    pub fn default_keepalive(&self) -> Duration {
        Duration::from_secs(self.tunnel.keepalive_secs)
    }

    pub fn default_dpd(&self) -> Duration {
        Duration::from_secs(self.tunnel.dpd_secs)
    }
}
