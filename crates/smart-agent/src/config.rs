//! Application configuration.
//!
//! Values are layered: built-in defaults, then the TOML config file, then
//! environment variables prefixed with `SMART_AGENT` using `__` between
//! section and key (`SMART_AGENT_BROKER__PORT=1883`).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "smart-agent";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    /// HTTP streaming listener.
    pub server: ServerConfig,
    /// MQTT broker connection.
    pub broker: BrokerConfig,
    /// Broadcast hub sizing.
    pub hub: HubConfig,
    /// Locally generated events.
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Route serving the event stream.
    pub stream_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            stream_path: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Topic used for both inbound and outbound traffic.
    pub topic: String,
    pub keep_alive_secs: u64,
    /// How long the initial connect may take before startup fails.
    pub connect_timeout_secs: u64,
    /// Pause between event loop polls after a connection error.
    pub reconnect_delay_ms: u64,
    /// Subscribe to `topic` and relay inbound messages to streaming clients.
    pub subscribe: bool,
    /// Capacity of the client's outgoing request queue.
    pub request_capacity: usize,
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 10004,
            client_id: "agent".to_string(),
            topic: "topic/test".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            reconnect_delay_ms: 1000,
            subscribe: false,
            request_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Per-subscriber delivery buffer. Events beyond it are dropped for that subscriber.
    pub subscriber_capacity: usize,
    /// Buffer for membership notices headed to the broker.
    pub notice_capacity: usize,
    /// Publish "Client added/Removed client" notices to the broker.
    pub membership_notices: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 16,
            notice_capacity: 16,
            membership_notices: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Announce the start-up time once the broker link is up.
    pub announce_on_start: bool,
    /// Emit a clock event every N seconds; 0 disables the ticker.
    pub clock_interval_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            announce_on_start: true,
            clock_interval_secs: 0,
        }
    }
}

impl AppConfig {
    /// Load from an optional TOML file plus the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load with an explicit environment map instead of the process environment.
    pub fn load_with_env(
        path: &Path,
        env_vars: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let built = Config::builder()
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(env_prefix().as_str())
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env_vars),
            )
            .build()
            .with_context(|| format!("reading configuration from {}", path.display()))?;

        let config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make startup fail in less obvious ways.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        if !self.server.stream_path.starts_with('/') {
            bail!(
                "server.stream_path must start with '/': {}",
                self.server.stream_path
            );
        }
        if matches!(self.server.stream_path.as_str(), "/health" | "/notify") {
            bail!(
                "server.stream_path collides with a built-in route: {}",
                self.server.stream_path
            );
        }
        if self.broker.host.trim().is_empty() {
            bail!("broker.host must not be empty");
        }
        if self.broker.port == 0 {
            bail!("broker.port must be non-zero");
        }
        if self.broker.topic.trim().is_empty() {
            bail!("broker.topic must not be empty");
        }
        if self.broker.client_id.trim().is_empty() {
            bail!("broker.client_id must not be empty");
        }
        if self.broker.keep_alive_secs == 0 {
            bail!("broker.keep_alive_secs must be at least 1");
        }
        if self.broker.request_capacity == 0 {
            bail!("broker.request_capacity must be at least 1");
        }
        if self.hub.subscriber_capacity == 0 || self.hub.notice_capacity == 0 {
            bail!("hub capacities must be at least 1");
        }
        Ok(())
    }
}

/// Resolve the config file location: explicit override (file or directory) or the XDG default.
pub fn config_file_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    let config_file = match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                expanded.join("config.toml")
            } else {
                expanded
            }
        }
        None => default_config_dir()?.join("config.toml"),
    };

    if config_file.parent().is_none() {
        return Err(anyhow!("invalid config file path: {config_file:?}"));
    }
    Ok(config_file)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        let expanded = shellexpand::full(text).context("expanding path")?;
        Ok(PathBuf::from(expanded.to_string()))
    } else {
        Ok(path)
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
