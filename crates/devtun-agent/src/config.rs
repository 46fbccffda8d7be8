//! Agent configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (DEVTUN_*)
//! 2. Config file (agent.toml)
//! 3. Default values (where applicable)

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::types::DeviceKey;

/// Environment variable prefix
const ENV_PREFIX: &str = "DEVTUN";

const DEFAULT_ADB_ADDR: &str = "127.0.0.1:5037";
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_DISCOVERY_RETRY_SECS: u64 = 5;

/// Agent configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the control plane API
    pub control_api_url: Option<String>,

    /// Bearer token for the control plane API
    pub api_token: Option<String>,

    /// ADB server address
    pub adb_addr: Option<String>,

    /// Track ADB-attached devices
    pub enable_adb: Option<bool>,

    /// CA bundle (PEM file) trusted for access point TLS
    pub ca_cert: Option<String>,

    /// User-Agent sent in tunnel handshakes and API calls
    pub client_id: Option<String>,

    /// Upper bound on one tunnel handshake
    pub handshake_timeout_secs: Option<u64>,

    /// Wait between attempts to reach the ADB server
    pub discovery_retry_secs: Option<u64>,

    /// Desktop device keys to connect at startup
    pub devices: Vec<String>,
}

/// Resolved agent configuration
#[derive(Debug)]
pub struct ResolvedAgentConfig {
    pub control_api_url: String,
    pub api_token: String,
    pub adb_addr: String,
    pub enable_adb: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_id: String,
    pub handshake_timeout: Duration,
    pub discovery_retry: Duration,
    pub devices: Vec<DeviceKey>,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Get environment variable as u64
fn get_env_u64(name: &str) -> Option<u64> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as bool (`1`/`true`/`yes`, `0`/`false`/`no`)
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    })
}

fn default_client_id() -> String {
    format!("devtun-agent/{}", env!("CARGO_PKG_VERSION"))
}

impl AgentConfig {
    /// Default config location (`~/.config/devtun/agent.toml` on Linux)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("devtun").join("agent.toml"))
    }

    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedAgentConfig> {
        // Control API URL: ENV > config > required
        let control_api_url = get_env("CONTROL_API_URL")
            .or(self.control_api_url)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Control API URL required. Set DEVTUN_CONTROL_API_URL or control_api_url in config"
                )
            })?;

        // API token: ENV > config > required
        let api_token = get_env("API_TOKEN").or(self.api_token).ok_or_else(|| {
            anyhow::anyhow!("API token required. Set DEVTUN_API_TOKEN or api_token in config")
        })?;

        let adb_addr = get_env("ADB_ADDR")
            .or(self.adb_addr)
            .unwrap_or_else(|| DEFAULT_ADB_ADDR.to_string());
        let enable_adb = get_env_bool("ENABLE_ADB")
            .or(self.enable_adb)
            .unwrap_or(true);
        let ca_cert = get_env("CA_CERT").or(self.ca_cert).map(PathBuf::from);
        let client_id = get_env("CLIENT_ID")
            .or(self.client_id)
            .unwrap_or_else(default_client_id);

        let handshake_timeout = Duration::from_secs(
            get_env_u64("HANDSHAKE_TIMEOUT_SECS")
                .or(self.handshake_timeout_secs)
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        );
        if handshake_timeout.is_zero() {
            anyhow::bail!("handshake_timeout_secs must be greater than zero");
        }
        let discovery_retry = Duration::from_secs(
            get_env_u64("DISCOVERY_RETRY_SECS")
                .or(self.discovery_retry_secs)
                .unwrap_or(DEFAULT_DISCOVERY_RETRY_SECS),
        );

        // Devices: ENV (comma separated) > config
        let devices = match get_env("DEVICES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(DeviceKey::from)
                .collect(),
            None => self.devices.into_iter().map(DeviceKey::from).collect(),
        };

        Ok(ResolvedAgentConfig {
            control_api_url,
            api_token,
            adb_addr,
            enable_adb,
            ca_cert,
            client_id,
            handshake_timeout,
            discovery_retry,
            devices,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedAgentConfig> {
        let config = Self::load(path);
        config.resolve()
    }
}
