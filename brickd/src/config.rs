use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/brickd/brickd.toml";
const ENV_CONFIG_PATH: &str = "BRICKD_CONFIG";

/// Longest accepted authentication secret.
pub const MAX_SECRET_LENGTH: usize = 64;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub bricklet: BrickletConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `BRICKD_CONFIG` environment variable. A missing file yields the
    /// defaults; a malformed file is an error, because silently ignoring a
    /// broken config would leave the daemon listening on the wrong ports.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(
                std::env::var(ENV_CONFIG_PATH)
                    .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
            ),
        };

        let config = match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str::<Config>(&contents)
                .map_err(|e| anyhow::anyhow!("malformed config {}: {e}", path.display()))?,
            Err(_) => Config::default(),
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.authentication.secret.len() > MAX_SECRET_LENGTH {
            anyhow::bail!(
                "authentication secret is longer than {} characters",
                MAX_SECRET_LENGTH
            );
        }

        if self.listen.plain_port == 0 {
            anyhow::bail!("listen.plain_port must not be 0");
        }

        Ok(())
    }

    /// Configured secret, `None` when authentication is disabled.
    pub fn secret(&self) -> Option<&str> {
        if self.authentication.secret.is_empty() {
            None
        } else {
            Some(&self.authentication.secret)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,
    #[serde(default = "default_plain_port")]
    pub plain_port: u16,
    /// 0 disables the WebSocket listener.
    #[serde(default)]
    pub websocket_port: u16,
    #[serde(default = "default_mesh_gateway_port")]
    pub mesh_gateway_port: u16,
    #[serde(default)]
    pub dual_stack: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            plain_port: default_plain_port(),
            websocket_port: 0,
            mesh_gateway_port: default_mesh_gateway_port(),
            dual_stack: false,
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}
fn default_plain_port() -> u16 {
    4223
}
fn default_mesh_gateway_port() -> u16 {
    4240
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthenticationConfig {
    /// Empty = authentication disabled.
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BrickletConfig {
    /// SPI groups, each one spidev bus with up to 10 chip selects.
    #[serde(default)]
    pub group: Vec<BrickletGroupConfig>,
    /// Per-port poll pacing, keyed by port letter.
    #[serde(default)]
    pub port: BTreeMap<String, BrickletPortConfig>,
}

impl BrickletConfig {
    /// Poll pacing for a port letter in microseconds (default 200).
    pub fn sleep_between_reads(&self, port: char) -> u32 {
        self.port
            .get(&port.to_string())
            .map(|p| p.sleep_between_reads)
            .unwrap_or(default_sleep_between_reads())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrickletGroupConfig {
    /// Device path template, `%d` is replaced by the chip-select number for
    /// hardware chip select, by 0 otherwise.
    pub spidev: String,
    #[serde(default)]
    pub cs: Vec<BrickletChipSelectConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrickletChipSelectConfig {
    pub driver: ChipSelectDriver,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub num: u16,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChipSelectDriver {
    Hardware,
    Gpio,
    Wiringpi,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrickletPortConfig {
    #[serde(default = "default_sleep_between_reads")]
    pub sleep_between_reads: u32,
}

fn default_sleep_between_reads() -> u32 {
    200
}
