use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const TFTP_PORT: u16 = 69;

/// Tunables for a sending session and its fault variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Sleep between non-blocking receive attempts while waiting for a reply.
    pub poll_interval_ms: u64,
    /// How long a fault variant waits for an ACK before logging it as missing.
    pub fault_ack_timeout_ms: u64,
    pub timeout_pause_secs: u64,
    pub timeout_before_block: u64,
    pub loss_probability: f64,
    /// Fixed seed for the packet-loss variant. Random when unset.
    pub loss_seed: Option<u64>,
    pub truncate_ratio: f64,
    pub duplicate_every: u64,
    pub corrupt_every: u64,
    pub corrupt_offset: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            fault_ack_timeout_ms: 1000,
            timeout_pause_secs: 10,
            timeout_before_block: 5,
            loss_probability: 0.3,
            loss_seed: None,
            truncate_ratio: 0.6,
            duplicate_every: 5,
            corrupt_every: 7,
            corrupt_offset: 10,
        }
    }
}

impl ClientConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fault_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.fault_ack_timeout_ms)
    }

    pub fn timeout_pause(&self) -> Duration {
        Duration::from_secs(self.timeout_pause_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub output_dir: PathBuf,
    /// A transfer that sees no DATA for this long is finished as timed out.
    pub receive_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Replace files that already exist in `output_dir`.
    pub overwrite: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: ([0, 0, 0, 0], TFTP_PORT).into(),
            output_dir: PathBuf::from("."),
            receive_timeout_ms: 5000,
            poll_interval_ms: 50,
            overwrite: false,
        }
    }
}

impl ServerConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Config {
    pub fn from_toml(content: &str) -> anyhow::Result<Config> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Config::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Config> {
        match path {
            Some(path) => Config::load(path),
            None => Ok(Config::default()),
        }
    }
}
