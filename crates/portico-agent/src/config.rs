//! Agent configuration: optional TOML file + CLI/environment overrides.

use portico_core::{PorticoError, PorticoResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Fixed delay between control-channel reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(2500);

/// `http` or `https`; the matching WebSocket scheme is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn http(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn ws(&self) -> &'static str {
        match self {
            Self::Http => "ws",
            Self::Https => "wss",
        }
    }
}

impl FromStr for Scheme {
    type Err = PorticoError;

    fn from_str(s: &str) -> PorticoResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "ws" => Ok(Self::Http),
            "https" | "wss" => Ok(Self::Https),
            other => Err(PorticoError::Config(format!("unknown protocol: {other:?}"))),
        }
    }
}

/// What a local bridge failure tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultScope {
    /// Drop the control connection and reconnect.
    #[default]
    Tunnel,
    /// Close only the affected bridge session.
    Session,
}

impl FromStr for FaultScope {
    type Err = PorticoError;

    fn from_str(s: &str) -> PorticoResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tunnel" => Ok(Self::Tunnel),
            "session" => Ok(Self::Session),
            other => Err(PorticoError::Config(format!("unknown fault scope: {other:?}"))),
        }
    }
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
}

/// `[agent]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub remote_host: String,
    #[serde(default = "default_protocol")]
    pub remote_protocol: String,
    #[serde(default)]
    pub local_host: String,
    #[serde(default = "default_protocol")]
    pub local_protocol: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_fault_scope")]
    pub fault_scope: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_protocol: default_protocol(),
            local_host: String::new(),
            local_protocol: default_protocol(),
            secret: String::new(),
            debug: false,
            fault_scope: default_fault_scope(),
        }
    }
}

fn default_protocol() -> String {
    "http".to_string()
}
fn default_fault_scope() -> String {
    "tunnel".to_string()
}

/// Values taken from the command line or environment. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub remote_host: Option<String>,
    pub remote_protocol: Option<String>,
    pub local_host: Option<String>,
    pub local_protocol: Option<String>,
    pub secret: Option<String>,
    pub debug: bool,
    pub fault_scope: Option<String>,
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Gateway `host[:port]`; also the public host used in header rewrites.
    pub remote_host: String,
    pub remote_scheme: Scheme,
    /// Local service `host[:port]`.
    pub local_host: String,
    pub local_scheme: Scheme,
    pub secret: String,
    pub debug: bool,
    pub fault_scope: FaultScope,
    pub reconnect_delay: Duration,
}

impl AgentConfig {
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
        let section = file.agent;

        let remote_host = normalize_host(overrides.remote_host.unwrap_or(section.remote_host));
        let local_host = normalize_host(overrides.local_host.unwrap_or(section.local_host));
        let secret = overrides.secret.unwrap_or(section.secret);

        if remote_host.is_empty() {
            return Err(PorticoError::Config("remote host is required (HOST)".into()));
        }
        if local_host.is_empty() {
            return Err(PorticoError::Config("local host is required (LOCALHOST)".into()));
        }
        if secret.is_empty() {
            return Err(PorticoError::Config(
                "a non-empty shared secret is required (SECRET)".into(),
            ));
        }

        Ok(Self {
            remote_host,
            remote_scheme: overrides
                .remote_protocol
                .unwrap_or(section.remote_protocol)
                .parse()?,
            local_host,
            local_scheme: overrides
                .local_protocol
                .unwrap_or(section.local_protocol)
                .parse()?,
            secret,
            debug: overrides.debug || section.debug,
            fault_scope: overrides
                .fault_scope
                .unwrap_or(section.fault_scope)
                .parse()?,
            reconnect_delay: RECONNECT_DELAY,
        })
    }

    /// Control-channel URL: `<ws|wss>://<remote_host>/<secret>`.
    pub fn control_url(&self) -> String {
        format!(
            "{}://{}/{}",
            self.remote_scheme.ws(),
            self.remote_host,
            urlencoding::encode(&self.secret)
        )
    }

    /// Base URL of the local HTTP service.
    pub fn local_http_base(&self) -> String {
        format!("{}://{}", self.local_scheme.http(), self.local_host)
    }

    /// Base URL of the local WebSocket service.
    pub fn local_ws_base(&self) -> String {
        format!("{}://{}", self.local_scheme.ws(), self.local_host)
    }
}

/// Strip any scheme prefix and trailing slashes from a host setting.
fn normalize_host(host: String) -> String {
    let trimmed = host.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_string()
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
