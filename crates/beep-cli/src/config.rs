//! Configuration system for the BEEP CLI.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use beep_core::SessionConfig;
use beep_transport::TransportConfig;

/// Accepted `logging.level` values
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// BEEP CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Listening side
    #[serde(default)]
    pub server: ServerConfig,
    /// Initiating side
    #[serde(default)]
    pub client: ClientConfig,
    /// Session parameters shared by both sides
    #[serde(default)]
    pub session: SessionSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Peer to connect to
    #[serde(default = "default_peer_addr")]
    pub peer_addr: String,
    /// Messages sent by `ping`
    #[serde(default = "default_count")]
    pub count: u32,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Receive window per channel (bytes)
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    /// Outbound frame payload limit (bytes)
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    /// Seconds to wait for the peer's greeting
    #[serde(default = "default_greeting_timeout")]
    pub greeting_timeout_secs: u64,
    /// `serverName` sent with the first channel start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:10288".to_string()
}

fn default_peer_addr() -> String {
    "127.0.0.1:10288".to_string()
}

fn default_count() -> u32 {
    4
}

fn default_window_size() -> u32 {
    beep_core::DEFAULT_WINDOW_SIZE
}

fn default_frame_size() -> usize {
    4096
}

fn default_greeting_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_addr: default_peer_addr(),
            count: default_count(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            frame_size: default_frame_size(),
            greeting_timeout_secs: default_greeting_timeout(),
            server_name: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Read a TOML file
    ///
    /// # Errors
    ///
    /// Fails on I/O or TOML errors.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Write as TOML, creating parent directories
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// `<config dir>/beep/config.toml`, relative to the working directory
    /// when the platform has no config dir
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_default()
            .join("beep")
            .join("config.toml")
    }

    /// Load `path` if it exists, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Listen address as a `SocketAddr`
    ///
    /// # Errors
    ///
    /// Fails if `server.listen_addr` is not `ip:port`.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("Listen address {:?}", self.server.listen_addr))
    }

    /// Transport configuration for this config's session section
    #[must_use]
    pub fn transport(&self) -> TransportConfig {
        let mut session = SessionConfig::default()
            .with_window_size(self.session.window_size)
            .with_frame_size(self.session.frame_size)
            .with_greeting_timeout(Duration::from_secs(self.session.greeting_timeout_secs));
        if let Some(name) = &self.session.server_name {
            session = session.with_server_name(name.clone());
        }
        TransportConfig::default().with_session(session)
    }

    /// Reject settings the session layer cannot run with
    ///
    /// # Errors
    ///
    /// Names the first offending setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        validate_host_port(&self.client.peer_addr, "Peer address")?;

        if self.client.count == 0 {
            anyhow::bail!("Message count must be at least 1");
        }

        if self.session.window_size == 0 {
            anyhow::bail!("Window size must be greater than 0");
        }

        if self.session.frame_size == 0 || self.session.frame_size > 16 * 1024 * 1024 {
            anyhow::bail!("Frame size must be between 1 and 16MB");
        }

        if self.session.greeting_timeout_secs == 0 {
            anyhow::bail!("Greeting timeout must be at least 1 second");
        }

        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            anyhow::bail!(
                "Unknown log level {:?} (expected {})",
                self.logging.level,
                LOG_LEVELS.join("/")
            );
        }

        Ok(())
    }
}

/// Check `host:port` shape
fn validate_host_port(addr: &str, what: &str) -> anyhow::Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("{what} {addr:?} needs a port"))?;
    match port.parse::<u16>() {
        Ok(0) | Err(_) => anyhow::bail!("{what} {addr:?}: bad port {port:?}"),
        Ok(_) => {}
    }
    if host.is_empty() || host.contains(['/', '\\']) {
        anyhow::bail!("{what} {addr:?}: bad host {host:?}");
    }
    Ok(())
}
