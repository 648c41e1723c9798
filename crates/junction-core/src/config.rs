//! Configuration system for Junction.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $JUNCTION_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/junction/config.toml
//!   3. ~/.config/junction/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JunctionConfig {
    pub endpoint: EndpointConfig,
    pub router: RouterConfig,
    pub bluetooth: BluetoothConfig,
    pub listen: ListenConfig,
}

/// Per-connection timers and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Seconds of inbound silence before a probe is sent. 0 = never probe.
    pub idle_timeout_secs: u32,
    /// Seconds to wait for a probe answer before the next probe.
    pub probe_timeout_secs: u32,
    /// Unanswered probes before the link is declared dead.
    pub max_idle_probes: u32,
    /// Seconds a single message write may take.
    pub send_timeout_secs: u32,
    /// Control messages allowed per second of send timeout.
    pub max_control_msgs_per_sec: u32,
}

/// Session/name router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Milliseconds a host has to answer AcceptSession.
    pub accept_timeout_ms: u64,
    /// Milliseconds a remote daemon has to answer AttachSession.
    pub attach_timeout_ms: u64,
    /// Retries for a session message that arrives before its route.
    pub no_route_retries: u32,
    /// Milliseconds between those retries.
    pub no_route_retry_ms: u64,
    /// Seconds between found-name expiry sweeps.
    pub name_expiry_interval_secs: u64,
    /// Milliseconds an endpoint may flush before forced stop on shutdown.
    pub stop_flush_ms: u64,
}

/// Bluetooth topology limits and default timings.
pub mod bt_limits {
    use std::time::Duration;

    pub const DELEGATE_TIME: Duration = Duration::from_secs(30);
    pub const ABSOLUTE_MAX_CONNECTIONS: usize = 7;
    pub const DEFAULT_MAX_CONNECTIONS: usize = 3;
    pub const LOST_DEVICE_TIMEOUT: Duration = Duration::from_secs(60);
    /// Slack added to the next found-node expiry before sweeping.
    pub const LOST_DEVICE_TIMEOUT_EXT: Duration = Duration::from_secs(5);
    pub const BLACKLIST_TIME: Duration = Duration::from_secs(3600);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub enabled: bool,
    /// Max simultaneous minion connections. Capped at 7.
    pub max_connections: usize,
    /// Seconds a delegated find/advertise runs before rotation.
    pub delegate_time_secs: u64,
    /// Seconds a found device stays cached without refresh.
    pub lost_device_timeout_secs: u64,
    /// Seconds a device that failed to connect is ignored.
    pub blacklist_secs: u64,
    /// Rotate delegates once more than this many EIR minions exist.
    pub rotate_eir_threshold: usize,
    /// Without EIR minions, rotate once more than this many minions exist.
    pub rotate_minion_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// TCP address for client and bus-to-bus connections. Empty = off.
    pub tcp_addr: String,
    /// Daemons to connect to at startup, as host:port.
    pub peers: Vec<String>,
    /// Milliseconds a new connection has to say hello.
    pub hello_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 20,
            probe_timeout_secs: 10,
            max_idle_probes: 3,
            send_timeout_secs: 30,
            max_control_msgs_per_sec: 10,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            accept_timeout_ms: 30_000,
            attach_timeout_ms: 30_000,
            no_route_retries: 20,
            no_route_retry_ms: 10,
            name_expiry_interval_secs: 1,
            stop_flush_ms: 500,
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_connections: bt_limits::DEFAULT_MAX_CONNECTIONS,
            delegate_time_secs: bt_limits::DELEGATE_TIME.as_secs(),
            lost_device_timeout_secs: bt_limits::LOST_DEVICE_TIMEOUT.as_secs(),
            blacklist_secs: bt_limits::BLACKLIST_TIME.as_secs(),
            rotate_eir_threshold: 2,
            rotate_minion_threshold: 2,
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            tcp_addr: "127.0.0.1:9955".to_string(),
            peers: Vec::new(),
            hello_timeout_ms: 5_000,
        }
    }
}

impl EndpointConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.idle_timeout_secs))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.probe_timeout_secs))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.send_timeout_secs))
    }
}

impl BluetoothConfig {
    /// Configured connection limit, never above what a piconet allows.
    pub fn max_connections(&self) -> usize {
        self.max_connections.min(bt_limits::ABSOLUTE_MAX_CONNECTIONS)
    }

    pub fn delegate_time(&self) -> Duration {
        Duration::from_secs(self.delegate_time_secs)
    }

    pub fn lost_device_timeout(&self) -> Duration {
        Duration::from_secs(self.lost_device_timeout_secs)
    }

    pub fn blacklist_time(&self) -> Duration {
        Duration::from_secs(self.blacklist_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("junction")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl JunctionConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            JunctionConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("JUNCTION_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&JunctionConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply JUNCTION_* overrides using `lookup` as the environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.parse().ok())
        }

        if let Some(v) = parse(lookup("JUNCTION_ENDPOINT__IDLE_TIMEOUT_SECS")) {
            self.endpoint.idle_timeout_secs = v;
        }
        if let Some(v) = parse(lookup("JUNCTION_ENDPOINT__PROBE_TIMEOUT_SECS")) {
            self.endpoint.probe_timeout_secs = v;
        }
        if let Some(v) = parse(lookup("JUNCTION_ENDPOINT__MAX_IDLE_PROBES")) {
            self.endpoint.max_idle_probes = v;
        }
        if let Some(v) = parse(lookup("JUNCTION_ENDPOINT__SEND_TIMEOUT_SECS")) {
            self.endpoint.send_timeout_secs = v;
        }
        if let Some(v) = lookup("JUNCTION_LISTEN__TCP_ADDR") {
            self.listen.tcp_addr = v;
        }
        if let Some(v) = lookup("JUNCTION_LISTEN__PEERS") {
            self.listen.peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("JUNCTION_BLUETOOTH__ENABLED") {
            self.bluetooth.enabled = v == "true" || v == "1";
        }
        if let Some(v) = parse::<usize>(lookup("JUNCTION_BLUETOOTH__MAX_CONNECTIONS")) {
            self.bluetooth.max_connections = v;
        }
    }
}
