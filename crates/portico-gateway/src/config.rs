//! Gateway configuration: optional TOML file + CLI/environment overrides.

use portico_core::{PorticoError, PorticoResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub debug: bool,
    /// Idle minutes before auto-sleep (0 = disabled).
    #[serde(default)]
    pub auto_sleep: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            secret: String::new(),
            debug: false,
            auto_sleep: 0,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

/// Values taken from the command line or environment. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub secret: Option<String>,
    pub debug: bool,
    pub auto_sleep: Option<u64>,
    pub max_body_bytes: Option<usize>,
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: String,
    /// Shared secret; a WebSocket whose path contains it is the control channel.
    pub secret: String,
    pub debug: bool,
    pub auto_sleep_minutes: u64,
    pub max_body_bytes: usize,
}

impl GatewayConfig {
    /// Load config from a TOML file (if present), then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> PorticoResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| PorticoError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::merge(file_config, overrides)
    }

    /// Merge overrides on top of file values and validate the result.
    pub fn merge(file: ConfigFile, overrides: Overrides) -> PorticoResult<Self> {
        let section = file.gateway;
        let secret = overrides.secret.unwrap_or(section.secret);
        if secret.is_empty() {
            return Err(PorticoError::Config(
                "a non-empty shared secret is required (SECRET)".into(),
            ));
        }

        Ok(Self {
            port: overrides.port.unwrap_or(section.port),
            bind: overrides.bind.unwrap_or(section.bind),
            secret,
            debug: overrides.debug || section.debug,
            auto_sleep_minutes: overrides.auto_sleep.unwrap_or(section.auto_sleep),
            max_body_bytes: overrides.max_body_bytes.unwrap_or(section.max_body_bytes),
        })
    }

    /// `bind:port` listen address.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Idle period after which the gateway shuts itself down (zero = never).
    pub fn auto_sleep(&self) -> Duration {
        Duration::from_secs(self.auto_sleep_minutes * 60)
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
