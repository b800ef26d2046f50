//! Configuration management

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }
}

/// Kind of media carried, changes how talk bursts are measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base of the fuzzed RTCP report interval
    pub report_interval_ms: u64,
    /// Packets per send statistics window
    pub tx_statistics_window: u32,
    /// Packets per receive statistics window
    pub rx_statistics_window: u32,
    /// Media clock rate in Hz
    pub clock_rate: u32,
    pub media: MediaKind,
    /// Drop packets that arrive behind the expected sequence number
    pub ignore_out_of_order: bool,
    /// Consecutive backward packets that force a resynchronization
    pub resync_threshold: u32,
    /// Accept any number of remote SSRC changes
    pub allow_ssrc_change: bool,
    pub ignore_payload_type_changes: bool,
    pub close_on_bye: bool,
    pub canonical_name: String,
    pub tool_name: String,
}

impl SessionConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 12_000,
            tx_statistics_window: 100,
            rx_statistics_window: 100,
            clock_rate: 8000,
            media: MediaKind::Audio,
            ignore_out_of_order: true,
            resync_threshold: 10,
            allow_ssrc_change: false,
            ignore_payload_type_changes: true,
            close_on_bye: false,
            canonical_name: String::new(),
            tool_name: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub local_address: IpAddr,
    /// First data port tried; rounded up to even
    pub port_base: u16,
    pub port_max: u16,
    pub max_port_attempts: u32,
    pub remote_data: Option<SocketAddr>,
    pub remote_control: Option<SocketAddr>,
    /// Follow the source address of incoming traffic
    pub remote_behind_nat: bool,
    pub type_of_service: Option<u8>,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    /// How long connection refused/reset on write is tolerated
    pub write_failure_threshold_ms: u64,
    pub max_datagram_size: usize,
}

impl TransportConfig {
    pub fn write_failure_threshold(&self) -> Duration {
        Duration::from_millis(self.write_failure_threshold_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_base: 5000,
            port_max: 5999,
            max_port_attempts: 100,
            remote_data: None,
            remote_control: None,
            remote_behind_nat: false,
            type_of_service: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            write_failure_threshold_ms: 10_000,
            max_datagram_size: 2048,
        }
    }
}
