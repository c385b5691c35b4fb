use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use smsgate_at::MessageMode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no devices configured")]
    NoDevices,
    #[error("device name '{0}' is used more than once")]
    DuplicateDevice(String),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub devices: Vec<DeviceConfig>,
    /// Slow loop (message listing) interval.
    pub poll_interval_seconds: u64,
    /// Delete a message from the modem once the sink accepted it.
    pub delete_after_forward: bool,
    /// Fast loop (call detection) interval.
    pub call_poll_interval_ms: u64,
    /// Ring silence after which a call is considered over.
    pub quiet_period_seconds: u64,
    pub command_timeout_ms: u64,
    pub supervisor: SupervisorConfig,
    pub telegram: Option<TelegramConfig>,
    pub history: Option<HistoryConfig>,
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub message_mode: MessageMode,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default)]
    pub fetch: FetchMode,
    /// Value for `AT+CSCS`, left at the modem default when unset.
    #[serde(default)]
    pub charset: Option<String>,
    pub transport: TransportConfig,
}

/// How message contents are retrieved after listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Use the bodies from the listing.
    List,
    /// Read every listed slot again; some modems truncate long bodies in
    /// listings.
    #[default]
    Read,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// In-process simulated modem that receives generated traffic.
    Mock {
        /// Interval in seconds between generated messages, 0 to disable
        sms_interval_secs: u64,
        /// Interval in seconds between generated calls, 0 to disable
        call_interval_secs: u64,
    },
}

impl TransportConfig {
    /// Human readable endpoint, for logs and the status API.
    pub fn endpoint(&self) -> String {
        match self {
            TransportConfig::Serial { port, baud_rate } => format!("{port}@{baud_rate}"),
            TransportConfig::Mock { .. } => "mock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Delay before the first reconnect attempt
    pub reconnect_backoff_secs: u64,
    /// Upper bound for the doubling reconnect delay
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

fn default_storage() -> String {
    "ME".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
        }

        let intervals = [
            ("poll_interval_seconds", self.poll_interval_seconds),
            ("call_poll_interval_ms", self.call_poll_interval_ms),
            ("quiet_period_seconds", self.quiet_period_seconds),
            ("command_timeout_ms", self.command_timeout_ms),
            (
                "supervisor.reconnect_backoff_secs",
                self.supervisor.reconnect_backoff_secs,
            ),
            ("supervisor.max_backoff_secs", self.supervisor.max_backoff_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn call_poll_interval(&self) -> Duration {
        Duration::from_millis(self.call_poll_interval_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.quiet_period_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: vec![DeviceConfig {
                name: "mock-modem".to_string(),
                message_mode: MessageMode::Text,
                storage: default_storage(),
                fetch: FetchMode::Read,
                charset: None,
                transport: TransportConfig::Mock {
                    sms_interval_secs: 60,
                    call_interval_secs: 90,
                },
            }],
            poll_interval_seconds: 10,
            delete_after_forward: true,
            call_poll_interval_ms: 200,
            quiet_period_seconds: 10,
            command_timeout_ms: 5000,
            supervisor: SupervisorConfig::default(),
            telegram: None,
            history: None,
            server: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}
