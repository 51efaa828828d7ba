// src/config.rs
//
// Connection and logging configuration.
// Loaded from a TOML file; every field has a default so a partial file is valid.
// Timeouts and intervals are stored in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::io::codec::Encoding;
use crate::io::error::IoError;
use crate::io::serial::{Handshake, Parity};

// ============================================================================
// Serial
// ============================================================================

/// Serial port parameters, read once per connection attempt
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_port_name")]
    pub port_name: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub handshake: Handshake,
    /// Upper bound for a single blocking read; unset means the driver default
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    /// Bound for applying one write; unset means wait as long as the driver does
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_serial_new_line")]
    pub new_line: String,
    /// Wait after opening before reading starts
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Pause between a failed attempt and the next one
    #[serde(default)]
    pub retry_delay_ms: u64,
    /// Port-name enumeration interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_port_name() -> String {
    "COM1".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_serial_new_line() -> String {
    "\n".to_string()
}

fn default_settle_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: default_port_name(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            handshake: Handshake::default(),
            read_timeout_ms: None,
            write_timeout_ms: None,
            encoding: Encoding::default(),
            new_line: default_serial_new_line(),
            settle_ms: default_settle_ms(),
            retry_delay_ms: 0,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SerialConfig {
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            ..Default::default()
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ============================================================================
// TCP
// ============================================================================

/// TCP client parameters, read once per connection attempt
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Local address to bind before connecting (`"0.0.0.0:0"` style)
    #[serde(default)]
    pub local_addr: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Longest wait for inbound data before the attempt fails; unset waits forever
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub nodelay: bool,
    #[serde(default = "default_tcp_new_line")]
    pub new_line: String,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_tcp_new_line() -> String {
    "\r\n".to_string()
}

fn default_read_buffer_size() -> usize {
    8192
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            local_addr: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: None,
            write_timeout_ms: None,
            nodelay: true,
            new_line: default_tcp_new_line(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl TcpConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    /// `host:port` label used in logs and errors
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,
    /// Directory for timestamped log files; stderr only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
        }
    }
}

// ============================================================================
// File
// ============================================================================

/// Top-level configuration file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
}

pub fn parse_config(text: &str) -> Result<PortsConfig, IoError> {
    toml::from_str(text).map_err(|e| IoError::Config(e.to_string()))
}

pub fn load_config(path: &Path) -> Result<PortsConfig, IoError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| IoError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&text)
}

// ============================================================================
// Tests
// ============================================================================
