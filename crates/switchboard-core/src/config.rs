//! Configuration resolution for Switchboard.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/switchboard/settings.json)
//! 3. Project config (.switchboard/settings.json)
//! 4. Explicit config file (`--config`)
//! 5. Environment variables
//!
//! Files may be partial; they are deep-merged as JSON before being
//! deserialized, so a project file that only sets `client.url` keeps every
//! other value from the layers below it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Switchboard configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Broker-side configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address for the WebSocket + status server.
    pub addr: String,
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3055".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Client-side (dispatcher + transport) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker WebSocket URL.
    pub url: String,
    pub command_timeout_secs: u64,
    /// How many times an unanswered command's deadline may be extended.
    pub max_extensions: u32,
    /// Growth factor applied to the wait on each extension.
    pub extension_factor: f64,
    /// Deadline granted by each progress frame.
    pub progress_window_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3055".to_string(),
            command_timeout_secs: 60,
            max_extensions: 3,
            extension_factor: 1.5,
            progress_window_secs: 60,
            connect_timeout_secs: 10,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_secs: u64,
    pub multiplier: f64,
    /// Quick attempts before falling back to the persistent interval.
    pub max_attempts: u32,
    pub persistent_interval_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_secs: 30,
            multiplier: 2.0,
            max_attempts: 5,
            persistent_interval_secs: 8,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` is a file named on the command line; unlike the global and
/// project files it must exist.
pub fn load_config(project_dir: Option<&Path>, explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_json(&mut merged, load_config_file(&global_path)?);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".switchboard").join("settings.json");
        if project_path.exists() {
            merge_json(&mut merged, load_config_file(&project_path)?);
        }
    }

    if let Some(path) = explicit {
        merge_json(&mut merged, load_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Reject values that would make timers misbehave.
pub fn validate(config: &Config) -> Result<()> {
    let factors = [
        ("client.extension_factor", config.client.extension_factor),
        ("client.reconnect.multiplier", config.client.reconnect.multiplier),
    ];
    for (key, value) in factors {
        if !value.is_finite() || value < 1.0 {
            return Err(Error::Config(format!(
                "Invalid configuration: {key} must be a finite number >= 1.0, got {value}"
            )));
        }
    }
    Ok(())
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    tracing::debug!(path = %path.display(), "Loaded config layer");
    Ok(value)
}

/// Recursively merge `overlay` into `base`; objects merge key by key, any
/// other value replaces.
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

/// Apply `SWITCHBOARD_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("SWITCHBOARD_ADDR") {
        config.broker.addr = val;
    }
    if let Some(val) = lookup("SWITCHBOARD_LOG_LEVEL") {
        config.broker.log_level = val;
    }
    if let Some(val) = lookup("SWITCHBOARD_URL") {
        config.client.url = val;
    }
    if let Some(val) = lookup("SWITCHBOARD_COMMAND_TIMEOUT_SECS") {
        if let Ok(n) = val.parse() {
            config.client.command_timeout_secs = n;
        }
    }
}
