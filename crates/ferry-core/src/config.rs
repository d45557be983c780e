//! Configuration resolution for Ferry.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/ferry/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged as JSON documents before deserialization, so a file only
//! needs to mention the keys it overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Complete Ferry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub client_tls: ClientTlsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the proxy accepts client connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub addr: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// The endpoint every accepted connection is relayed to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub tls: RemoteTlsConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 80,
            tls: RemoteTlsConfig::default(),
        }
    }
}

/// TLS towards the remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteTlsConfig {
    /// Wrap the remote socket in TLS.
    pub enabled: bool,
    /// PEM file with trust anchors. Falls back to the webpki roots.
    pub ca_path: Option<PathBuf>,
    /// Skip certificate verification. Testing only.
    pub insecure: bool,
}

/// TLS presented to connecting clients.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClientTlsConfig {
    /// Plaintext towards clients.
    #[default]
    Disabled,
    /// Generate a throwaway CA and server certificate at startup.
    DevSelfSigned {
        /// Directory the generated PEM files are written to.
        cert_dir: Option<PathBuf>,
    },
    /// Operator-provided PEM certificate chain and key.
    Custom { cert_path: PathBuf, key_path: PathBuf },
}

/// Logging output configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Check the resolved configuration for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.remote.host.trim().is_empty() {
            return Err(Error::Config("remote.host must not be empty".into()));
        }
        if self.remote.port == 0 {
            return Err(Error::Config("remote.port must be non-zero".into()));
        }
        if let ClientTlsConfig::Custom {
            cert_path,
            key_path,
        } = &self.client_tls
        {
            if cert_path.as_os_str().is_empty() || key_path.as_os_str().is_empty() {
                return Err(Error::Config(
                    "client_tls custom mode requires cert_path and key_path".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` is the file passed on the command line, if any. Unlike the
/// global file it must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_json(&mut merged, read_config_value(&global_path)?);
        debug!(path = %global_path.display(), "Loaded global config");
    }

    if let Some(path) = explicit {
        merge_json(&mut merged, read_config_value(path)?);
        debug!(path = %path.display(), "Loaded config file");
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ferry").join("settings.json"))
}

fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`. Objects merge key by key, every other
/// value replaces what was there.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `FERRY_*` environment overrides. `lookup` abstracts the environment
/// so tests do not have to mutate process state.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("FERRY_LISTEN") {
        config.listen.addr = val
            .parse()
            .map_err(|e| Error::Config(format!("FERRY_LISTEN={val}: {e}")))?;
    }
    if let Some(val) = lookup("FERRY_REMOTE_HOST") {
        config.remote.host = val;
    }
    if let Some(val) = lookup("FERRY_REMOTE_PORT") {
        config.remote.port = val
            .parse()
            .map_err(|e| Error::Config(format!("FERRY_REMOTE_PORT={val}: {e}")))?;
    }
    if let Some(val) = lookup("FERRY_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some(val) = lookup("FERRY_LOG_JSON") {
        config.logging.json = matches!(val.as_str(), "1" | "true" | "yes");
    }
    Ok(())
}
